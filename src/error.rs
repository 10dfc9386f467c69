// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gantry-worker.

use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Message bus operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    /// Build script generation failed.
    #[error("Script error: {0}")]
    Script(#[from] crate::script::ScriptError),

    /// Result reporting failed.
    #[error("Report error: {0}")]
    Report(#[from] crate::reporter::ReportError),

    /// Compute backend operation failed.
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// Metrics registry operation failed.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the worker Error.
pub type Result<T> = std::result::Result<T, Error>;
