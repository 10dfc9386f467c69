// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! A scriptable provider that simulates VM lifecycles without any
//! network I/O. Failure injection covers every disposition the
//! processor has to handle: boot errors, stale VMs, upload and run
//! transport failures, and runs that never complete until cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::traits::*;

/// How `Provider::start` should fail.
#[derive(Debug, Clone)]
pub enum StartFailure {
    /// Transport-level failure (API unreachable, 5xx).
    Transport(String),
    /// Structured control-plane operation error.
    Operation(Vec<OperationSubError>),
}

/// Behavior knobs for the mock backend.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Fail `start` instead of producing an instance.
    pub start_failure: Option<StartFailure>,
    /// Report the VM as already carrying a script on upload.
    pub stale_vm: bool,
    /// Fail uploads with a transport error.
    pub fail_upload: bool,
    /// Output lines streamed to the sink during a run.
    pub run_lines: Vec<String>,
    /// Exit code of a completed run.
    pub exit_code: u8,
    /// Stream the output lines, then fail the invocation.
    pub fail_run: bool,
    /// Block the run until the token is cancelled.
    pub never_complete: bool,
    /// Delay before a run completes.
    pub run_delay: Option<Duration>,
    /// Fail `stop` with a transport error.
    pub fail_stop: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            start_failure: None,
            stale_vm: false,
            fail_upload: false,
            run_lines: vec!["hi".to_string()],
            exit_code: 0,
            fail_run: false,
            never_complete: false,
            run_delay: None,
            fail_stop: false,
        }
    }
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    max_running: AtomicUsize,
}

/// Per-instance call accounting, exposed for test assertions.
pub struct InstanceProbe {
    id: String,
    uploads: AtomicUsize,
    runs: AtomicUsize,
    stops: AtomicUsize,
    uploaded_script: Mutex<Option<Vec<u8>>>,
}

impl InstanceProbe {
    /// Instance display id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of upload attempts.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Number of run attempts.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Number of stop calls.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// The script most recently uploaded, if any.
    pub async fn uploaded_script(&self) -> Option<Vec<u8>> {
        self.uploaded_script.lock().await.clone()
    }
}

/// Mock provider.
#[derive(Debug)]
pub struct MockProvider {
    behavior: MockBehavior,
    starts: AtomicUsize,
    counters: Arc<Counters>,
    instances: Mutex<Vec<Arc<InstanceProbe>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create a mock provider with happy-path behavior.
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    /// Create a mock provider with the given behavior.
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            starts: AtomicUsize::new(0),
            counters: Arc::new(Counters::default()),
            instances: Mutex::new(Vec::new()),
        }
    }

    /// Number of `start` calls observed.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Probes for every instance this provider produced.
    pub async fn instances(&self) -> Vec<Arc<InstanceProbe>> {
        self.instances.lock().await.clone()
    }

    /// Highest number of concurrently running scripts observed.
    pub fn max_concurrent_runs(&self) -> usize {
        self.counters.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
    ) -> Result<Box<dyn Instance>> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);

        if token.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        match &self.behavior.start_failure {
            Some(StartFailure::Transport(msg)) => {
                return Err(BackendError::Other(msg.clone()));
            }
            Some(StartFailure::Operation(errors)) => {
                return Err(BackendError::Operation(OperationError {
                    errors: errors.clone(),
                }));
            }
            None => {}
        }

        let probe = Arc::new(InstanceProbe {
            id: format!("mock-{}:{}", n, attrs.language),
            uploads: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            uploaded_script: Mutex::new(None),
        });
        self.instances.lock().await.push(probe.clone());

        Ok(Box::new(MockInstance {
            behavior: self.behavior.clone(),
            counters: self.counters.clone(),
            probe,
        }))
    }
}

/// Mock instance.
#[derive(Debug)]
pub struct MockInstance {
    behavior: MockBehavior,
    counters: Arc<Counters>,
    probe: Arc<InstanceProbe>,
}

#[async_trait]
impl Instance for MockInstance {
    fn id(&self) -> String {
        self.probe.id.clone()
    }

    async fn upload_script(&self, token: &CancellationToken, script: &[u8]) -> Result<()> {
        self.probe.uploads.fetch_add(1, Ordering::SeqCst);

        if token.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if self.behavior.stale_vm {
            return Err(BackendError::StaleVm);
        }
        if self.behavior.fail_upload {
            return Err(BackendError::Other("session torn down during upload".to_string()));
        }

        *self.probe.uploaded_script.lock().await = Some(script.to_vec());
        Ok(())
    }

    async fn run_script(
        &self,
        token: &CancellationToken,
        sink: &mut dyn OutputSink,
    ) -> Result<RunResult> {
        self.probe.runs.fetch_add(1, Ordering::SeqCst);

        let current = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_running.fetch_max(current, Ordering::SeqCst);

        let result = self.run_inner(token, sink).await;

        self.counters.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn stop(&self, token: &CancellationToken) -> Result<()> {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);

        if token.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        if self.behavior.fail_stop {
            return Err(BackendError::Other("teardown request failed".to_string()));
        }
        Ok(())
    }
}

impl MockInstance {
    async fn run_inner(
        &self,
        token: &CancellationToken,
        sink: &mut dyn OutputSink,
    ) -> Result<RunResult> {
        for line in &self.behavior.run_lines {
            let chunk = format!("{line}\n");
            sink.write(chunk.as_bytes()).await?;
        }

        if self.behavior.never_complete {
            token.cancelled().await;
            return Err(BackendError::Cancelled);
        }

        if let Some(delay) = self.behavior.run_delay {
            tokio::select! {
                _ = token.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.behavior.fail_run {
            return Err(BackendError::Other(
                "connection reset during script run".to_string(),
            ));
        }

        Ok(RunResult {
            completed: true,
            exit_code: self.behavior.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink(Vec<u8>);

    #[async_trait]
    impl OutputSink for VecSink {
        async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
            self.0.extend_from_slice(chunk);
            Ok(())
        }
    }

    fn attrs() -> StartAttributes {
        StartAttributes {
            language: "ruby".to_string(),
        }
    }

    #[tokio::test]
    async fn test_happy_path_run() {
        let provider = MockProvider::new();
        let token = CancellationToken::new();

        let instance = provider.start(&token, &attrs()).await.unwrap();
        instance.upload_script(&token, b"#!/bin/bash\necho hi").await.unwrap();

        let mut sink = VecSink(Vec::new());
        let result = instance.run_script(&token, &mut sink).await.unwrap();

        assert_eq!(
            result,
            RunResult {
                completed: true,
                exit_code: 0
            }
        );
        assert_eq!(sink.0, b"hi\n");
        assert_eq!(provider.instances().await[0].uploads(), 1);
    }

    #[tokio::test]
    async fn test_stale_vm_upload() {
        let provider = MockProvider::with_behavior(MockBehavior {
            stale_vm: true,
            ..Default::default()
        });
        let token = CancellationToken::new();

        let instance = provider.start(&token, &attrs()).await.unwrap();
        let err = instance.upload_script(&token, b"x").await.unwrap_err();
        assert!(matches!(err, BackendError::StaleVm));
    }

    #[tokio::test]
    async fn test_start_operation_error() {
        let provider = MockProvider::with_behavior(MockBehavior {
            start_failure: Some(StartFailure::Operation(vec![OperationSubError {
                code: "QUOTA_EXCEEDED".to_string(),
                location: "zone".to_string(),
                message: "out of quota".to_string(),
            }])),
            ..Default::default()
        });
        let token = CancellationToken::new();

        let err = provider.start(&token, &attrs()).await.unwrap_err();
        match err {
            BackendError::Operation(op) => {
                assert_eq!(op.errors.len(), 1);
                assert!(op.to_string().contains("QUOTA_EXCEEDED"));
            }
            other => panic!("expected operation error, got {other:?}"),
        }
        assert!(provider.instances().await.is_empty());
    }

    #[tokio::test]
    async fn test_never_complete_returns_on_cancel() {
        let provider = MockProvider::with_behavior(MockBehavior {
            never_complete: true,
            ..Default::default()
        });
        let token = CancellationToken::new();
        let instance = provider.start(&token, &attrs()).await.unwrap();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let mut sink = VecSink(Vec::new());
        let err = instance.run_script(&token, &mut sink).await.unwrap_err();
        assert!(matches!(err, BackendError::Cancelled));
    }

    #[tokio::test]
    async fn test_fail_run_streams_partial_output() {
        let provider = MockProvider::with_behavior(MockBehavior {
            run_lines: vec!["one".into(), "two".into()],
            fail_run: true,
            ..Default::default()
        });
        let token = CancellationToken::new();
        let instance = provider.start(&token, &attrs()).await.unwrap();

        let mut sink = VecSink(Vec::new());
        let err = instance.run_script(&token, &mut sink).await.unwrap_err();
        assert!(matches!(err, BackendError::Other(_)));
        assert_eq!(sink.0, b"one\ntwo\n");
    }
}
