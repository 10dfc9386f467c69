// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-job processor.
//!
//! Drives one job through its lifecycle:
//!
//! ```text
//! RECEIVED ──start→ PROVISIONING ──booted──→ UPLOADING
//!     │                 │ boot-err                │ stale VM or upload-err
//!     │                 ▼                         ▼
//!     │              REQUEUE                   REQUEUE (+stop)
//!     ▼ (bad payload)
//!   REJECT
//!                          UPLOADING ──ok→ RUNNING ──result→ REPORTING ──ok→ ACKED
//!                                             │ invocation-err        │ report-err
//!                                             ▼                       ▼
//!                                         REQUEUE (+stop)         REQUEUE (+stop)
//! ```
//!
//! Every error is caught at a phase boundary and mapped to a
//! disposition; nothing escapes to the pool loop. For every instance
//! the provider produces, exactly one `stop` happens on the way out,
//! including when the job context is cancelled mid-phase.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backend::{BackendError, Instance, Provider, StartAttributes};
use crate::job::Job;
use crate::metrics::{
    DISPOSITION_COMPLETED, DISPOSITION_REJECTED, DISPOSITION_REQUEUED, WorkerMetrics,
};
use crate::queue::{Delivery, JobSource};
use crate::reporter::{JobReport, Reporter};
use crate::script::ScriptGenerator;

/// Phase deadlines for one job.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Deadline for booting a VM.
    pub provision_timeout: Duration,
    /// Deadline for uploading the build script.
    pub upload_timeout: Duration,
    /// Default deadline for running the script; a job payload may
    /// override it.
    pub run_timeout: Duration,
    /// Deadline for tearing the VM down.
    pub stop_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(240),
            upload_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(3000),
            stop_timeout: Duration::from_secs(120),
        }
    }
}

/// Terminal disposition of a job, decided at a phase boundary.
enum Disposition {
    /// Job finished; acknowledge it.
    Ack,
    /// Something failed; give the job back for another worker.
    Requeue,
}

/// Drives jobs from a shared source through their lifecycle.
pub struct Processor {
    id: usize,
    source: Arc<dyn JobSource>,
    provider: Arc<dyn Provider>,
    generator: Arc<dyn ScriptGenerator>,
    reporter: Arc<dyn Reporter>,
    metrics: Arc<WorkerMetrics>,
    config: ProcessorConfig,
    token: CancellationToken,
}

impl Processor {
    /// Create one processor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        source: Arc<dyn JobSource>,
        provider: Arc<dyn Provider>,
        generator: Arc<dyn ScriptGenerator>,
        reporter: Arc<dyn Reporter>,
        metrics: Arc<WorkerMetrics>,
        config: ProcessorConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            source,
            provider,
            generator,
            reporter,
            metrics,
            config,
            token,
        }
    }

    /// Pull and process jobs until the source drains or the pool
    /// context is cancelled.
    pub async fn run(&self) {
        debug!(processor = self.id, "Processor started");

        loop {
            let delivery = tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    debug!(processor = self.id, "Pool cancelled, exiting");
                    break;
                }

                next = self.source.next() => match next {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => {
                        debug!(processor = self.id, "Source drained, exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(processor = self.id, error = %e, "Job source failed, exiting");
                        break;
                    }
                },
            };

            self.process(delivery).await;
        }

        debug!(processor = self.id, "Processor stopped");
    }

    /// Process a single delivery to its terminal acknowledgment.
    pub async fn process(&self, delivery: Box<dyn Delivery>) {
        let job = match Job::decode(delivery) {
            Ok(job) => job,
            Err((delivery, e)) => {
                // Structurally broken payloads can never succeed on
                // any worker; drop instead of bouncing them forever.
                warn!(error = %e, "Undeliverable job payload, dropping");
                self.metrics.mark_job(DISPOSITION_REJECTED);
                if let Err(e) = delivery.nack(false).await {
                    warn!(error = %e, "Failed to drop undeliverable message");
                }
                return;
            }
        };

        let span = info_span!(
            "job",
            job_id = %job.payload.id,
            repository = %job.payload.repository,
            correlation = job.payload.uuid.as_deref().unwrap_or_default(),
        );

        async {
            match self.run_lifecycle(&job).await {
                Disposition::Ack => {
                    self.metrics.mark_job(DISPOSITION_COMPLETED);
                    job.ack().await;
                }
                Disposition::Requeue => {
                    self.metrics.mark_job(DISPOSITION_REQUEUED);
                    job.requeue().await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_lifecycle(&self, job: &Job) -> Disposition {
        // Script production precedes the VM: a failure here is a
        // provisioning-equivalent requeue with nothing to tear down.
        let script = match self.generator.generate(&job.raw).await {
            Ok(script) => script,
            Err(e) => {
                warn!(error = %e, "Build script generation failed, requeueing");
                return Disposition::Requeue;
            }
        };

        let attrs = StartAttributes {
            language: job.payload.language.clone().unwrap_or_default(),
        };

        let phase = self.token.child_token();
        let instance = match tokio::time::timeout(
            self.config.provision_timeout,
            self.provider.start(&phase, &attrs),
        )
        .await
        {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                warn!(error = %e, "VM boot failed, requeueing");
                return Disposition::Requeue;
            }
            Err(_) => {
                phase.cancel();
                self.metrics.mark_boot_timeout(self.provider.name());
                warn!(
                    timeout_secs = self.config.provision_timeout.as_secs(),
                    "VM boot deadline expired, requeueing"
                );
                return Disposition::Requeue;
            }
        };

        info!(instance_id = %instance.id(), "Instance booted");

        let disposition = self.drive(job, instance.as_ref(), &script).await;

        // Unconditional teardown on every path out of the lifecycle.
        self.stop_instance(instance.as_ref()).await;

        disposition
    }

    /// UPLOADING → RUNNING → REPORTING against a booted instance.
    ///
    /// The caller owns teardown; this only decides the disposition.
    async fn drive(&self, job: &Job, instance: &dyn Instance, script: &[u8]) -> Disposition {
        let phase = self.token.child_token();
        match tokio::time::timeout(
            self.config.upload_timeout,
            instance.upload_script(&phase, script),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(BackendError::StaleVm)) => {
                warn!(instance_id = %instance.id(), "Stale VM, requeueing for a fresh one");
                return Disposition::Requeue;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Script upload failed, requeueing");
                return Disposition::Requeue;
            }
            Err(_) => {
                phase.cancel();
                warn!("Script upload deadline expired, requeueing");
                return Disposition::Requeue;
            }
        }

        let run_timeout = job
            .payload
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.run_timeout);

        let mut sink = self.reporter.log_sink(&job.payload.id);
        let phase = self.token.child_token();
        let result = match tokio::time::timeout(
            run_timeout,
            instance.run_script(&phase, sink.as_mut()),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = %e, "Script invocation failed, requeueing");
                return Disposition::Requeue;
            }
            Err(_) => {
                phase.cancel();
                warn!(
                    timeout_secs = run_timeout.as_secs(),
                    "Script run deadline expired, requeueing"
                );
                return Disposition::Requeue;
            }
        };

        info!(
            completed = result.completed,
            exit_code = result.exit_code,
            "Script finished"
        );

        let report = JobReport::from_run_result(&job.payload.id, &result);
        if let Err(e) = self.reporter.report(&report).await {
            warn!(error = %e, "Failed to report job result, requeueing");
            return Disposition::Requeue;
        }

        Disposition::Ack
    }

    /// Best-effort teardown under its own deadline.
    ///
    /// Uses a fresh token: teardown must still run after the job
    /// context was cancelled.
    async fn stop_instance(&self, instance: &dyn Instance) {
        let stop_token = CancellationToken::new();
        match tokio::time::timeout(self.config.stop_timeout, instance.stop(&stop_token)).await {
            Ok(Ok(())) => debug!(instance_id = %instance.id(), "Instance stopped"),
            Ok(Err(e)) => {
                warn!(instance_id = %instance.id(), error = %e, "Failed to stop instance")
            }
            Err(_) => warn!(instance_id = %instance.id(), "Instance stop deadline expired"),
        }
    }
}
