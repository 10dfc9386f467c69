// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure: in-memory job source, recording
//! reporter, and a static script generator.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use gantry_worker::backend::OutputSink;
use gantry_worker::queue::{Delivery, JobSource, QueueError};
use gantry_worker::reporter::{JobReport, ReportError, Reporter};
use gantry_worker::script::{ScriptError, ScriptGenerator};

/// Terminal acknowledgment recorded for a test delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Acked,
    Requeued,
    Rejected,
}

/// Observer for one enqueued job's terminal acknowledgment.
#[derive(Clone)]
pub struct JobProbe {
    terminal: Arc<Mutex<Option<Terminal>>>,
}

impl JobProbe {
    pub fn terminal(&self) -> Option<Terminal> {
        *self.terminal.lock().unwrap()
    }
}

/// In-memory delivery recording its settlement; settling twice panics,
/// which is exactly the invariant the worker must uphold.
pub struct TestDelivery {
    payload: Vec<u8>,
    terminal: Arc<Mutex<Option<Terminal>>>,
}

impl TestDelivery {
    pub fn new(payload: impl Into<Vec<u8>>) -> (Self, JobProbe) {
        let terminal = Arc::new(Mutex::new(None));
        (
            Self {
                payload: payload.into(),
                terminal: terminal.clone(),
            },
            JobProbe { terminal },
        )
    }

    fn settle(&self, terminal: Terminal) {
        let mut slot = self.terminal.lock().unwrap();
        assert!(
            slot.is_none(),
            "delivery settled twice: {:?} then {:?}",
            slot.unwrap(),
            terminal
        );
        *slot = Some(terminal);
    }
}

#[async_trait]
impl Delivery for TestDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.settle(Terminal::Acked);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), QueueError> {
        self.settle(if requeue {
            Terminal::Requeued
        } else {
            Terminal::Rejected
        });
        Ok(())
    }
}

/// In-memory job source with drain semantics: after `drain`, `next`
/// returns `None` even while messages remain queued.
pub struct MemorySource {
    queue: Mutex<VecDeque<TestDelivery>>,
    drained: AtomicBool,
}

impl MemorySource {
    pub fn new(payloads: Vec<Vec<u8>>) -> (Self, Vec<JobProbe>) {
        let mut queue = VecDeque::new();
        let mut probes = Vec::new();
        for payload in payloads {
            let (delivery, probe) = TestDelivery::new(payload);
            queue.push_back(delivery);
            probes.push(probe);
        }
        (
            Self {
                queue: Mutex::new(queue),
                drained: AtomicBool::new(false),
            },
            probes,
        )
    }

    pub fn empty() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            drained: AtomicBool::new(false),
        }
    }

    /// Messages still sitting in the queue (never delivered).
    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[async_trait]
impl JobSource for MemorySource {
    async fn next(&self) -> Result<Option<Box<dyn Delivery>>, QueueError> {
        if self.drained.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let next = self.queue.lock().unwrap().pop_front();
        Ok(next.map(|d| Box::new(d) as Box<dyn Delivery>))
    }

    async fn drain(&self) -> Result<(), QueueError> {
        self.drained.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Reporter capturing reports and log streams in memory.
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<JobReport>>>,
    logs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_reports: AtomicBool,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self {
            reports: Arc::new(Mutex::new(Vec::new())),
            logs: Arc::new(Mutex::new(HashMap::new())),
            fail_reports: AtomicBool::new(false),
        }
    }

    pub fn failing() -> Self {
        let reporter = Self::new();
        reporter.fail_reports.store(true, Ordering::SeqCst);
        reporter
    }

    pub fn reports(&self) -> Vec<JobReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Captured log bytes for one job.
    pub fn log(&self, job_id: &str) -> Vec<u8> {
        self.logs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn report(&self, report: &JobReport) -> Result<(), ReportError> {
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(ReportError::Other("reporting channel gone".to_string()));
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    fn log_sink(&self, job_id: &str) -> Box<dyn OutputSink> {
        Box::new(RecordingSink {
            job_id: job_id.to_string(),
            logs: self.logs.clone(),
        })
    }
}

struct RecordingSink {
    job_id: String,
    logs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl OutputSink for RecordingSink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.logs
            .lock()
            .unwrap()
            .entry(self.job_id.clone())
            .or_default()
            .extend_from_slice(chunk);
        Ok(())
    }
}

/// Script generator returning a fixed script, or failing.
pub struct StaticGenerator {
    script: Vec<u8>,
    fail: bool,
}

impl StaticGenerator {
    pub fn new(script: impl Into<Vec<u8>>) -> Self {
        Self {
            script: script.into(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            script: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl ScriptGenerator for StaticGenerator {
    async fn generate(&self, _payload: &[u8]) -> Result<Vec<u8>, ScriptError> {
        if self.fail {
            return Err(ScriptError::Status(503));
        }
        Ok(self.script.clone())
    }
}

/// A well-formed job payload for tests.
pub fn job_payload(id: u64, language: &str) -> Vec<u8> {
    format!(
        r#"{{"id": {id}, "repository": "acme/widget", "language": "{language}", "uuid": "corr-{id}"}}"#
    )
    .into_bytes()
}
