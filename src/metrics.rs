// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker metrics.
//!
//! A process-wide prometheus registry tracks VM boots per provider and
//! job dispositions. [`MetricsReporter`] periodically logs a snapshot;
//! when hosted-sink credentials are configured the snapshot carries
//! their source tag (the sink's wire protocol is out of scope).
//!
//! # Metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `worker_vm_provider_boot_seconds` | Histogram | `provider` |
//! | `worker_vm_provider_boot_timeouts_total` | Counter | `provider` |
//! | `worker_jobs_total` | Counter | `disposition` |

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Job finished and was acknowledged.
pub const DISPOSITION_COMPLETED: &str = "completed";
/// Job was returned to the queue for another worker.
pub const DISPOSITION_REQUEUED: &str = "requeued";
/// Job payload was undeliverable and dropped.
pub const DISPOSITION_REJECTED: &str = "rejected";

/// Boot histogram buckets, in seconds.
const BOOT_BUCKETS: &[f64] = &[5.0, 15.0, 30.0, 60.0, 120.0, 240.0];

/// Process-wide worker metrics.
#[derive(Debug)]
pub struct WorkerMetrics {
    registry: Registry,
    boot_duration: HistogramVec,
    boot_timeouts: IntCounterVec,
    jobs: IntCounterVec,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Completed (acknowledged) jobs.
    pub completed: u64,
    /// Requeued jobs.
    pub requeued: u64,
    /// Rejected (dropped) jobs.
    pub rejected: u64,
    /// Successful VM boots across all providers.
    pub boots: u64,
    /// Boot deadline expiries across all providers.
    pub boot_timeouts: u64,
}

impl WorkerMetrics {
    /// Create and register all worker metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let boot_duration = HistogramVec::new(
            HistogramOpts::new("worker_vm_provider_boot_seconds", "Time to boot a VM")
                .buckets(BOOT_BUCKETS.to_vec()),
            &["provider"],
        )?;
        registry.register(Box::new(boot_duration.clone()))?;

        let boot_timeouts = IntCounterVec::new(
            Opts::new(
                "worker_vm_provider_boot_timeouts_total",
                "VM boots abandoned because the provisioning deadline expired",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(boot_timeouts.clone()))?;

        let jobs = IntCounterVec::new(
            Opts::new("worker_jobs_total", "Jobs by terminal disposition"),
            &["disposition"],
        )?;
        registry.register(Box::new(jobs.clone()))?;

        Ok(Self {
            registry,
            boot_duration,
            boot_timeouts,
            jobs,
        })
    }

    /// Record a successful boot.
    pub fn observe_boot(&self, provider: &str, elapsed: Duration) {
        self.boot_duration
            .with_label_values(&[provider])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a boot abandoned at the provisioning deadline.
    pub fn mark_boot_timeout(&self, provider: &str) {
        self.boot_timeouts.with_label_values(&[provider]).inc();
    }

    /// Record a job's terminal disposition.
    pub fn mark_job(&self, disposition: &str) {
        self.jobs.with_label_values(&[disposition]).inc();
    }

    /// Current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            completed: self.jobs.with_label_values(&[DISPOSITION_COMPLETED]).get(),
            requeued: self.jobs.with_label_values(&[DISPOSITION_REQUEUED]).get(),
            rejected: self.jobs.with_label_values(&[DISPOSITION_REJECTED]).get(),
            ..Default::default()
        };

        for family in self.registry.gather() {
            match family.get_name() {
                "worker_vm_provider_boot_seconds" => {
                    snapshot.boots = family
                        .get_metric()
                        .iter()
                        .map(|m| m.get_histogram().get_sample_count())
                        .sum();
                }
                "worker_vm_provider_boot_timeouts_total" => {
                    snapshot.boot_timeouts = family
                        .get_metric()
                        .iter()
                        .map(|m| m.get_counter().get_value() as u64)
                        .sum();
                }
                _ => {}
            }
        }

        snapshot
    }

    /// Encode the registry in the text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| prometheus::Error::Msg(format!("invalid UTF-8 in encoded metrics: {e}")))
    }
}

/// Background task that periodically logs a metrics snapshot.
pub struct MetricsReporter {
    metrics: Arc<WorkerMetrics>,
    interval: Duration,
    source: Option<String>,
    shutdown: Arc<Notify>,
}

impl MetricsReporter {
    /// Create a reporter over the given registry.
    pub fn new(metrics: Arc<WorkerMetrics>, interval: Duration, source: Option<String>) -> Self {
        Self {
            metrics,
            interval,
            source,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reporter loop until shutdown is signalled.
    pub async fn run(&self) {
        debug!(
            interval_secs = self.interval.as_secs(),
            source = self.source.as_deref().unwrap_or("log"),
            "Metrics reporter started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                _ = tokio::time::sleep(self.interval) => {
                    let snapshot = self.metrics.snapshot();
                    info!(
                        source = self.source.as_deref().unwrap_or("log"),
                        completed = snapshot.completed,
                        requeued = snapshot.requeued,
                        rejected = snapshot.rejected,
                        boots = snapshot.boots,
                        boot_timeouts = snapshot.boot_timeouts,
                        "Worker metrics"
                    );
                }
            }
        }

        debug!("Metrics reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_dispositions() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.mark_job(DISPOSITION_COMPLETED);
        metrics.mark_job(DISPOSITION_COMPLETED);
        metrics.mark_job(DISPOSITION_REQUEUED);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.requeued, 1);
        assert_eq!(snapshot.rejected, 0);
    }

    #[test]
    fn test_snapshot_counts_boots() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.observe_boot("gce", Duration::from_secs(42));
        metrics.observe_boot("gce", Duration::from_secs(17));
        metrics.mark_boot_timeout("gce");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.boots, 2);
        assert_eq!(snapshot.boot_timeouts, 1);
    }

    #[test]
    fn test_encode_text_contains_metric_names() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.mark_job(DISPOSITION_COMPLETED);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("worker_jobs_total"));
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let metrics = Arc::new(WorkerMetrics::new().unwrap());
        let reporter = MetricsReporter::new(metrics, Duration::from_secs(3600), None);
        let shutdown = reporter.shutdown_handle();

        let handle = tokio::spawn(async move { reporter.run().await });
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop promptly")
            .unwrap();
    }
}
