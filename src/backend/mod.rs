// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute backends.
//!
//! A backend provides isolated execution environments for build jobs.
//! Providers are registered by name in [`create_provider`]; the rest of
//! the worker only sees the [`Provider`]/[`Instance`] contract.

use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::metrics::WorkerMetrics;

/// Google Compute Engine backend (VM over SSH).
pub mod gce;

/// Scriptable in-memory backend for tests.
pub mod mock;

mod traits;

pub use traits::{
    BackendError, Instance, OperationError, OperationSubError, OutputSink, Provider, Result,
    RunResult, StartAttributes,
};

/// Instantiate the provider registered under `name`.
pub fn create_provider(
    name: &str,
    config: &ProviderConfig,
    metrics: Arc<WorkerMetrics>,
) -> Result<Arc<dyn Provider>> {
    match name {
        "gce" => Ok(Arc::new(gce::GceProvider::new(config, metrics)?)),
        "mock" => Ok(Arc::new(mock::MockProvider::new())),
        other => Err(BackendError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_provider_unknown_name() {
        let metrics = Arc::new(WorkerMetrics::new().unwrap());
        let err = create_provider("digitalocean", &ProviderConfig::default(), metrics).unwrap_err();
        assert!(matches!(err, BackendError::UnknownProvider(name) if name == "digitalocean"));
    }

    #[test]
    fn test_create_provider_mock() {
        let metrics = Arc::new(WorkerMetrics::new().unwrap());
        let provider = create_provider("mock", &ProviderConfig::default(), metrics).unwrap();
        assert_eq!(provider.name(), "mock");
    }
}
