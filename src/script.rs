// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build-script production.
//!
//! The script producer is an external collaborator: job payload bytes
//! in, shell script bytes out. Failures here are treated like
//! provisioning failures (the job is requeued, no VM exists yet).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from script generation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScriptError {
    /// The HTTP request itself failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The producer answered with a non-success status.
    #[error("Script producer returned status {0}")]
    Status(u16),

    /// The producer returned an empty script.
    #[error("Script producer returned an empty script")]
    Empty,
}

/// Produces a shell script for a job payload.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    /// Generate the build script for the given raw job payload.
    async fn generate(&self, payload: &[u8]) -> Result<Vec<u8>, ScriptError>;
}

/// HTTP-backed script producer client.
pub struct HttpScriptGenerator {
    http: reqwest::Client,
    script_url: String,
}

impl HttpScriptGenerator {
    /// Create a generator addressing the producer at `base_uri`.
    pub fn new(base_uri: &str) -> Result<Self, ScriptError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            script_url: format!("{}/script", base_uri.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ScriptGenerator for HttpScriptGenerator {
    async fn generate(&self, payload: &[u8]) -> Result<Vec<u8>, ScriptError> {
        let response = self
            .http
            .post(&self.script_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScriptError::Status(status.as_u16()));
        }

        let script = response.bytes().await?.to_vec();
        if script.is_empty() {
            return Err(ScriptError::Empty);
        }
        Ok(script)
    }
}
