// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job result reporting.
//!
//! Terminal job states are published to `reporting.jobs.builds`; build
//! output is streamed as numbered log parts to `reporting.jobs.logs`.
//! A failure to publish the terminal report requeues the job, so the
//! report is delivered at least once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use serde::Serialize;
use thiserror::Error;

use crate::backend::{OutputSink, RunResult};

/// Routing key for terminal job states.
const BUILDS_KEY: &str = "reporting.jobs.builds";
/// Routing key for streamed log parts.
const LOGS_KEY: &str = "reporting.jobs.logs";

/// Errors from result reporting.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReportError {
    /// Publishing to the bus failed.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Report serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Script completed with exit code 0.
    Passed,
    /// Script completed with a non-zero exit code.
    Failed,
    /// The invocation itself failed to run to completion.
    Errored,
}

/// Terminal report for one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Job identifier.
    pub id: String,
    /// Terminal state.
    pub state: JobState,
    /// Exit code, present when the script ran to a natural exit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u8>,
    /// When the job reached its terminal state.
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    /// Map a run result onto a terminal report.
    pub fn from_run_result(id: &str, result: &RunResult) -> Self {
        let (state, exit_code) = if result.completed {
            let state = if result.exit_code == 0 {
                JobState::Passed
            } else {
                JobState::Failed
            };
            (state, Some(result.exit_code))
        } else {
            (JobState::Errored, None)
        };

        Self {
            id: id.to_string(),
            state,
            exit_code,
            finished_at: Utc::now(),
        }
    }
}

/// Emits terminal reports and per-job log streams.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Publish the terminal report for a job.
    async fn report(&self, report: &JobReport) -> Result<(), ReportError>;

    /// Open a log sink for a job's build output.
    fn log_sink(&self, job_id: &str) -> Box<dyn OutputSink>;
}

/// AMQP-backed reporter.
pub struct AmqpReporter {
    channel: Channel,
}

impl AmqpReporter {
    /// Open a publishing channel and declare the reporting queues.
    pub async fn open(conn: &Connection) -> Result<Self, ReportError> {
        let channel = conn.create_channel().await?;
        for queue in [BUILDS_KEY, LOGS_KEY] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(Self { channel })
    }
}

#[async_trait]
impl Reporter for AmqpReporter {
    async fn report(&self, report: &JobReport) -> Result<(), ReportError> {
        let payload = serde_json::to_vec(report)?;
        self.channel
            .basic_publish(
                "",
                BUILDS_KEY,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?;
        Ok(())
    }

    fn log_sink(&self, job_id: &str) -> Box<dyn OutputSink> {
        Box::new(AmqpLogSink {
            channel: self.channel.clone(),
            job_id: job_id.to_string(),
            number: 0,
        })
    }
}

/// Publishes build output as numbered log parts.
struct AmqpLogSink {
    channel: Channel,
    job_id: String,
    number: u64,
}

#[derive(Serialize)]
struct LogPart<'a> {
    id: &'a str,
    log: &'a str,
    number: u64,
}

#[async_trait]
impl OutputSink for AmqpLogSink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let log = String::from_utf8_lossy(chunk);
        let part = LogPart {
            id: &self.job_id,
            log: &log,
            number: self.number,
        };
        let payload = serde_json::to_vec(&part)?;
        self.channel
            .basic_publish(
                "",
                LOGS_KEY,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(std::io::Error::other)?;
        self.number += 1;
        Ok(())
    }
}
