// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend trait definitions.
//!
//! The compute backend is the only extensibility seam the worker core
//! depends on: a [`Provider`] boots isolated VMs, and each [`Instance`]
//! accepts a script upload, runs it to completion while streaming
//! output, and tears down. Every operation accepts a cancellation
//! token and must return promptly once it is cancelled.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One sub-error reported by an asynchronous control-plane operation.
#[derive(Debug, Clone)]
pub struct OperationSubError {
    /// Machine-readable error code.
    pub code: String,
    /// Where in the request the error occurred.
    pub location: String,
    /// Human-readable message.
    pub message: String,
}

/// Structured failure of a control-plane operation.
///
/// Distinct from transport errors: the API call itself succeeded, but
/// the operation it tracked finished with errors. All sub-errors are
/// preserved.
#[derive(Debug, Clone)]
pub struct OperationError {
    /// Every sub-error the operation reported.
    pub errors: Vec<OperationSubError>,
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| {
                format!(
                    "code={} location={} message={}",
                    e.code, e.location, e.message
                )
            })
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The VM already bears a prior job's script and must be discarded.
    #[error("stale VM: build script already present")]
    StaleVm,

    /// The operation was cancelled via its token.
    #[error("operation cancelled")]
    Cancelled,

    /// No provider is registered under the requested name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// A required provider config key is missing.
    #[error("missing provider config key: {0}")]
    MissingConfig(&'static str),

    /// A provider config value failed to parse or load.
    #[error("invalid provider config {key}: {reason}")]
    InvalidConfig {
        /// The offending key.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// No image matched any candidate language.
    #[error("no image found for language {0}")]
    NoImage(String),

    /// A control-plane operation finished with errors.
    #[error("operation failed: {0}")]
    Operation(OperationError),

    /// The control-plane API call itself failed.
    #[error("compute API error: {0}")]
    Api(#[from] reqwest::Error),

    /// SSH transport or protocol failure.
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// The instance has no reachable IP address.
    #[error("no IP address found")]
    MissingIpAddress,

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

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Projection of a job used to request a VM.
#[derive(Debug, Clone, Default)]
pub struct StartAttributes {
    /// Short language tag used to select a base image. Empty when the
    /// job did not carry one; the provider then falls back to its
    /// default language.
    pub language: String,
}

/// Outcome of running the build script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    /// Whether the script ran to a natural exit (any exit code).
    /// `false` means the invocation itself failed.
    pub completed: bool,
    /// Exit code of the script when `completed` is true.
    pub exit_code: u8,
}

/// Receives build output as it is produced.
///
/// Implementations must tolerate arbitrary chunk boundaries; the
/// backend flushes at most one read's worth of bytes at a time.
#[async_trait]
pub trait OutputSink: Send {
    /// Write one chunk of combined stdout+stderr output.
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()>;
}

/// Stateful factory of instances.
///
/// Shared read-only across all processors for the process lifetime.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Short provider name used in metrics and logs.
    fn name(&self) -> &'static str;

    /// Boot a fresh VM for the given attributes.
    ///
    /// On success the caller owns the instance and is responsible for
    /// calling [`Instance::stop`] exactly once.
    async fn start(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
    ) -> Result<Box<dyn Instance>>;
}

/// Handle to a running, reachable compute environment.
#[async_trait]
pub trait Instance: Send + Sync + std::fmt::Debug {
    /// Stable display identifier.
    fn id(&self) -> String;

    /// Place the build script at the well-known path inside the VM.
    ///
    /// Returns [`BackendError::StaleVm`] if a script is already
    /// present; the VM is contaminated and must not be used.
    async fn upload_script(&self, token: &CancellationToken, script: &[u8]) -> Result<()>;

    /// Execute the uploaded script, streaming combined output to
    /// `sink` as it is produced.
    ///
    /// A natural script exit (any code) yields `Ok(RunResult {
    /// completed: true, .. })`; a failed invocation yields an error.
    async fn run_script(
        &self,
        token: &CancellationToken,
        sink: &mut dyn OutputSink,
    ) -> Result<RunResult>;

    /// Tear the VM down. Idempotent and best-effort; called exactly
    /// once on every processor exit path.
    async fn stop(&self, token: &CancellationToken) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_display_joins_sub_errors() {
        let err = OperationError {
            errors: vec![
                OperationSubError {
                    code: "QUOTA_EXCEEDED".to_string(),
                    location: "zone".to_string(),
                    message: "quota exceeded".to_string(),
                },
                OperationSubError {
                    code: "RESOURCE_NOT_FOUND".to_string(),
                    location: "disk".to_string(),
                    message: "image missing".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("code=QUOTA_EXCEEDED location=zone message=quota exceeded"));
        assert!(msg.contains(", code=RESOURCE_NOT_FOUND"));
    }

    #[test]
    fn test_stale_vm_error_display() {
        let err = BackendError::StaleVm;
        assert!(err.to_string().contains("stale VM"));
    }

    #[test]
    fn test_run_result_equality() {
        let a = RunResult {
            completed: true,
            exit_code: 42,
        };
        assert_eq!(
            a,
            RunResult {
                completed: true,
                exit_code: 42
            }
        );
        assert_ne!(
            a,
            RunResult {
                completed: false,
                exit_code: 0
            }
        );
    }
}
