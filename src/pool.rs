// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processor pool supervisor.
//!
//! Owns the pool context, the shared job source, and `pool_size`
//! processor tasks. Shutdown is two-stage and monotonic: a graceful
//! drain stops new deliveries while in-flight jobs run to their own
//! deadlines; a hard shutdown cancels the pool context, which
//! propagates into every suspended backend call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::Provider;
use crate::metrics::{MetricsReporter, WorkerMetrics};
use crate::processor::{Processor, ProcessorConfig};
use crate::queue::JobSource;
use crate::reporter::Reporter;
use crate::script::ScriptGenerator;

/// Builder for a [`ProcessorPool`].
pub struct ProcessorPoolBuilder {
    source: Option<Arc<dyn JobSource>>,
    provider: Option<Arc<dyn Provider>>,
    generator: Option<Arc<dyn ScriptGenerator>>,
    reporter: Option<Arc<dyn Reporter>>,
    metrics: Option<Arc<WorkerMetrics>>,
    pool_size: usize,
    processor_config: ProcessorConfig,
    metrics_interval: Duration,
    metrics_source: Option<String>,
}

impl Default for ProcessorPoolBuilder {
    fn default() -> Self {
        Self {
            source: None,
            provider: None,
            generator: None,
            reporter: None,
            metrics: None,
            pool_size: 2,
            processor_config: ProcessorConfig::default(),
            metrics_interval: Duration::from_secs(60),
            metrics_source: None,
        }
    }
}

impl ProcessorPoolBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared job source (required).
    pub fn source(mut self, source: Arc<dyn JobSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the compute provider (required).
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the build-script generator (required).
    pub fn generator(mut self, generator: Arc<dyn ScriptGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Set the result reporter (required).
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Set the metrics registry (required).
    pub fn metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the number of concurrent processors.
    ///
    /// Default: `2`
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the per-phase deadlines.
    pub fn processor_config(mut self, config: ProcessorConfig) -> Self {
        self.processor_config = config;
        self
    }

    /// Set the metrics snapshot interval.
    ///
    /// Default: 60 seconds
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Set the source tag for metric snapshots.
    pub fn metrics_source(mut self, source: Option<String>) -> Self {
        self.metrics_source = source;
        self
    }

    /// Build the pool.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ProcessorPool> {
        let source = self.source.ok_or_else(|| anyhow::anyhow!("source is required"))?;
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("provider is required"))?;
        let generator = self
            .generator
            .ok_or_else(|| anyhow::anyhow!("generator is required"))?;
        let reporter = self
            .reporter
            .ok_or_else(|| anyhow::anyhow!("reporter is required"))?;
        let metrics = self
            .metrics
            .ok_or_else(|| anyhow::anyhow!("metrics is required"))?;

        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be at least 1");
        }

        Ok(ProcessorPool {
            source,
            provider,
            generator,
            reporter,
            metrics,
            pool_size: self.pool_size,
            processor_config: self.processor_config,
            metrics_interval: self.metrics_interval,
            metrics_source: self.metrics_source,
        })
    }
}

/// A configured, not-yet-running pool.
pub struct ProcessorPool {
    source: Arc<dyn JobSource>,
    provider: Arc<dyn Provider>,
    generator: Arc<dyn ScriptGenerator>,
    reporter: Arc<dyn Reporter>,
    metrics: Arc<WorkerMetrics>,
    pool_size: usize,
    processor_config: ProcessorConfig,
    metrics_interval: Duration,
    metrics_source: Option<String>,
}

impl ProcessorPool {
    /// Create a new builder.
    pub fn builder() -> ProcessorPoolBuilder {
        ProcessorPoolBuilder::new()
    }

    /// Spawn all processor tasks and the metrics reporter.
    pub fn start(self) -> RunningPool {
        let token = CancellationToken::new();

        let mut handles = Vec::with_capacity(self.pool_size);
        for id in 0..self.pool_size {
            let processor = Processor::new(
                id,
                self.source.clone(),
                self.provider.clone(),
                self.generator.clone(),
                self.reporter.clone(),
                self.metrics.clone(),
                self.processor_config.clone(),
                token.clone(),
            );
            handles.push(tokio::spawn(async move { processor.run().await }));
        }

        let reporter = MetricsReporter::new(
            self.metrics.clone(),
            self.metrics_interval,
            self.metrics_source.clone(),
        );
        let reporter_shutdown = reporter.shutdown_handle();
        let reporter_handle = tokio::spawn(async move { reporter.run().await });

        info!(pool_size = self.pool_size, "Processor pool started");

        RunningPool {
            source: self.source,
            handles,
            reporter_handle,
            reporter_shutdown,
            token,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A running pool; the handle for shutdown orchestration.
pub struct RunningPool {
    source: Arc<dyn JobSource>,
    handles: Vec<JoinHandle<()>>,
    reporter_handle: JoinHandle<()>,
    reporter_shutdown: Arc<tokio::sync::Notify>,
    token: CancellationToken,
    draining: Arc<AtomicBool>,
}

impl RunningPool {
    /// The pool cancellation token; cancelled only on hard shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop pulling new jobs; in-flight jobs run to their deadlines.
    ///
    /// One-shot: repeated calls are ignored. The pool context stays
    /// alive so running backend calls are not interrupted.
    pub async fn graceful_shutdown(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Graceful shutdown: draining job source");
        if let Err(e) = self.source.drain().await {
            warn!(error = %e, "Failed to drain job source");
        }
    }

    /// Cancel the pool context, aborting in-flight backend calls.
    pub fn shutdown_now(&self) {
        info!("Hard shutdown: cancelling pool context");
        self.token.cancel();
    }

    /// Wait for every processor to exit, then stop the metrics
    /// reporter.
    pub async fn wait(self) {
        for (id, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(processor = id, error = %e, "Processor task panicked");
            }
        }

        self.reporter_shutdown.notify_one();
        if let Err(e) = self.reporter_handle.await {
            error!(error = %e, "Metrics reporter task panicked");
        }

        info!("Processor pool stopped");
    }
}
