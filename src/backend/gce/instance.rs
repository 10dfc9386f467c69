// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GCE instance: SSH/SFTP data plane and teardown.
//!
//! SSH sessions are blocking (ssh2), so every session lives on a
//! `spawn_blocking` thread. The session read timeout bounds how long a
//! blocked read can outlive a cancellation: the loop re-checks the
//! token after every timed-out read.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api::ComputeClient;
use crate::backend::traits::{BackendError, Instance, OutputSink, Result, RunResult};

/// Well-known script path inside the VM, relative to the auth user's
/// home directory.
const SCRIPT_PATH: &str = "build.sh";
/// Command that executes the uploaded script.
const RUN_COMMAND: &str = "bash ~/build.sh";

/// Freshly booted VMs refuse SSH for a while, so transport failures
/// are retried with backoff; a stale VM is terminal.
const UPLOAD_ATTEMPTS: usize = 10;
const UPLOAD_BACKOFF: Duration = Duration::from_secs(3);

/// SSH connection settings shared by all instances of a provider.
#[derive(Debug, Clone)]
pub(crate) struct SshConfig {
    /// Login user installed by the startup script.
    pub(crate) user: &'static str,
    /// PEM-encoded (optionally encrypted) private key.
    pub(crate) key_pem: String,
    /// Passphrase for the private key.
    pub(crate) passphrase: String,
    /// TCP connect timeout.
    pub(crate) connect_timeout: Duration,
    /// Session read timeout; bounds the cancellation wake delay.
    pub(crate) read_timeout_ms: u32,
}

/// One booted VM.
#[derive(Debug)]
pub struct GceInstance {
    client: Arc<ComputeClient>,
    zone: String,
    name: String,
    image_name: String,
    ip: String,
    ssh: SshConfig,
    poll_interval: Duration,
}

impl GceInstance {
    pub(crate) fn new(
        client: Arc<ComputeClient>,
        zone: String,
        name: String,
        image_name: String,
        ip: String,
        ssh: SshConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            zone,
            name,
            image_name,
            ip,
            ssh,
            poll_interval,
        }
    }
}

/// Open an authenticated SSH session to the instance.
fn ssh_connect(ssh: &SshConfig, ip: &str) -> Result<Session> {
    let addr: SocketAddr = format!("{ip}:22")
        .parse()
        .map_err(|e| BackendError::Other(format!("bad instance address {ip}: {e}")))?;

    let tcp = TcpStream::connect_timeout(&addr, ssh.connect_timeout)?;
    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_pubkey_memory(ssh.user, None, &ssh.key_pem, Some(&ssh.passphrase))?;
    session.set_timeout(ssh.read_timeout_ms);
    Ok(session)
}

/// One SFTP upload attempt: stat for contamination, then write.
fn upload_attempt(ssh: &SshConfig, ip: &str, script: &[u8]) -> Result<()> {
    let session = ssh_connect(ssh, ip)?;
    let sftp = session.sftp()?;

    if sftp.stat(Path::new(SCRIPT_PATH)).is_ok() {
        return Err(BackendError::StaleVm);
    }

    let mut file = sftp.create(Path::new(SCRIPT_PATH))?;
    file.write_all(script)?;
    Ok(())
}

/// Run the uploaded script under a PTY, feeding output to `tx`.
fn run_attempt(
    ssh: &SshConfig,
    ip: &str,
    token: &CancellationToken,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<RunResult> {
    let session = ssh_connect(ssh, ip)?;
    let mut channel = session.channel_session()?;

    channel.handle_extended_data(ssh2::ExtendedData::Merge)?;
    channel.request_pty("xterm", None, Some((80, 40, 0, 0)))?;
    channel.exec(RUN_COMMAND)?;

    let mut buf = [0u8; 4096];
    loop {
        if token.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // Receiver gone means the job was torn down.
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    return Err(BackendError::Cancelled);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                // Session read timeout: wake to re-check the token.
                continue;
            }
            Err(e) => return Err(BackendError::Io(e)),
        }
    }

    channel.wait_close()?;
    let status = channel.exit_status()?;
    Ok(RunResult {
        completed: true,
        exit_code: status.clamp(0, 255) as u8,
    })
}

#[async_trait]
impl Instance for GceInstance {
    fn id(&self) -> String {
        format!("{}:{}", self.name, self.image_name)
    }

    async fn upload_script(&self, token: &CancellationToken, script: &[u8]) -> Result<()> {
        let mut last_err: Option<BackendError> = None;

        for attempt in 1..=UPLOAD_ATTEMPTS {
            if token.is_cancelled() {
                return Err(BackendError::Cancelled);
            }

            let ssh = self.ssh.clone();
            let ip = self.ip.clone();
            let script = script.to_vec();
            let result =
                tokio::task::spawn_blocking(move || upload_attempt(&ssh, &ip, &script))
                    .await
                    .map_err(|e| BackendError::Other(format!("upload task failed: {e}")))?;

            match result {
                Ok(()) => {
                    debug!(instance = %self.name, attempt, "Script uploaded");
                    return Ok(());
                }
                // A contaminated VM is terminal; never retry onto it.
                Err(BackendError::StaleVm) => return Err(BackendError::StaleVm),
                Err(e) => {
                    debug!(instance = %self.name, attempt, error = %e, "Upload attempt failed");
                    last_err = Some(e);
                }
            }

            tokio::select! {
                _ = token.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(UPLOAD_BACKOFF) => {}
            }
        }

        Err(last_err
            .unwrap_or_else(|| BackendError::Other("script upload failed".to_string())))
    }

    async fn run_script(
        &self,
        token: &CancellationToken,
        sink: &mut dyn OutputSink,
    ) -> Result<RunResult> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

        let ssh = self.ssh.clone();
        let ip = self.ip.clone();
        let run_token = token.clone();
        let handle =
            tokio::task::spawn_blocking(move || run_attempt(&ssh, &ip, &run_token, &tx));

        // Forward output as it arrives. A sink failure is local
        // bookkeeping: log it and keep draining so the run proceeds.
        let mut sink_ok = true;
        while let Some(chunk) = rx.recv().await {
            if sink_ok
                && let Err(e) = sink.write(&chunk).await
            {
                warn!(instance = %self.name, error = %e, "Log sink write failed");
                sink_ok = false;
            }
        }

        handle
            .await
            .map_err(|e| BackendError::Other(format!("run task failed: {e}")))?
    }

    async fn stop(&self, token: &CancellationToken) -> Result<()> {
        let op = tokio::select! {
            _ = token.cancelled() => return Err(BackendError::Cancelled),
            result = self.client.delete_instance(&self.zone, &self.name) => result?,
        };

        match op {
            Some(op) => {
                self.client
                    .await_zone_operation(token, &self.zone, &op, self.poll_interval)
                    .await
            }
            // Already gone; stop is idempotent.
            None => Ok(()),
        }
    }
}
