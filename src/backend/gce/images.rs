// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Language-to-image selection.
//!
//! Images are named `travis-ci-<language>-<suffix>`. The candidate
//! order is the configured mapping for the job's language if one
//! exists, otherwise the language itself, then the default language.
//! Within a candidate the lexicographically greatest image name wins,
//! a proxy for "newest" that matches the image naming convention.
//! Parsing a version suffix would be stronger, but name order is the
//! established contract.

use std::collections::HashMap;

use super::api::Image;

/// Image name prefix shared by all worker images.
pub(crate) const IMAGE_PREFIX: &str = "travis-ci-";

/// Candidate languages to try, in order.
pub(crate) fn candidate_languages(
    language: &str,
    mappings: &HashMap<String, String>,
    default_language: &str,
) -> Vec<String> {
    let mut candidates = Vec::with_capacity(2);

    let primary = match mappings.get(language) {
        Some(mapped) => mapped.as_str(),
        None => language,
    };
    if !primary.is_empty() {
        candidates.push(primary.to_string());
    }

    if !default_language.is_empty() && default_language != primary {
        candidates.push(default_language.to_string());
    }

    candidates
}

/// Image list filter expression for one candidate language.
pub(crate) fn image_filter(candidate: &str) -> String {
    format!("name eq ^{IMAGE_PREFIX}{candidate}.+")
}

/// Pick the image with the lexicographically greatest name.
pub(crate) fn newest_image(listed: Vec<Image>) -> Option<Image> {
    listed.into_iter().max_by(|a, b| a.name.cmp(&b.name))
}

/// Full selection over a known image list: first candidate language
/// with any matching image wins, newest name within it.
#[cfg(test)]
pub(crate) fn select_image(
    available: &[Image],
    language: &str,
    mappings: &HashMap<String, String>,
    default_language: &str,
) -> Option<Image> {
    for candidate in candidate_languages(language, mappings, default_language) {
        let prefix = format!("{IMAGE_PREFIX}{candidate}");
        let matching: Vec<Image> = available
            .iter()
            .filter(|image| image.name.starts_with(&prefix) && image.name.len() > prefix.len())
            .cloned()
            .collect();
        if let Some(best) = newest_image(matching) {
            return Some(best);
        }
    }
    None
}
