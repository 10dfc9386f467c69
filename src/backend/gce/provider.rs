// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GCE provider: boots one VM per job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::api::{
    AccessConfigPayload, AttachedDisk, ComputeClient, Image, InitializeParams, InstancePayload,
    Metadata, MetadataItem, NetworkInterfacePayload, Scheduling, Tags,
};
use super::auth::{ServiceAccountKey, TokenSource};
use super::images;
use super::instance::{GceInstance, SshConfig};
use crate::backend::traits::{BackendError, Instance, Provider, Result, StartAttributes};
use crate::config::ProviderConfig;
use crate::metrics::WorkerMetrics;

const DEFAULT_ZONE: &str = "us-central1-a";
const DEFAULT_MACHINE_TYPE: &str = "n1-standard-2";
const DEFAULT_NETWORK: &str = "default";
const DEFAULT_DISK_SIZE_GB: i64 = 20;
const DEFAULT_LANGUAGE: &str = "minimal";
const DEFAULT_API_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";
const DEFAULT_TOKEN_URI: &str = "https://accounts.google.com/o/oauth2/token";
const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// SSH user baked into the images; the startup script installs the
/// operator key into this account.
const AUTH_USER: &str = "travis";

/// Startup script installing the operator's public key.
fn startup_script(public_key: &str) -> String {
    format!("#!/usr/bin/env bash\ncat > ~{AUTH_USER}/.ssh/authorized_keys <<EOF\n{public_key}\nEOF\n")
}

/// Parsed GCE provider configuration.
#[derive(Debug, Clone)]
pub struct GceProviderConfig {
    /// Project id.
    pub project_id: String,
    /// Zone name.
    pub zone: String,
    /// Machine type name.
    pub machine_type: String,
    /// Network name.
    pub network: String,
    /// Boot disk size in GB.
    pub disk_size_gb: i64,
    /// Service-account key.
    pub account_key: ServiceAccountKey,
    /// PEM-encoded (optionally encrypted) SSH private key.
    pub ssh_key_pem: String,
    /// SSH public key installed into booted VMs.
    pub ssh_pub_key: String,
    /// Passphrase for the SSH private key.
    pub ssh_key_passphrase: String,
    /// Language-to-image-language mappings.
    pub language_mappings: HashMap<String, String>,
    /// Fallback language when no image matches the job's.
    pub default_language: String,
    /// Request preemptible VMs.
    pub preemptible: bool,
    /// Compute REST root.
    pub api_endpoint: String,
    /// OAuth token endpoint.
    pub token_uri: String,
}

impl GceProviderConfig {
    /// Parse the backend keys out of the nested provider config.
    pub fn from_provider_config(cfg: &ProviderConfig) -> Result<Self> {
        let project_id = cfg
            .get("PROJECT_ID")
            .ok_or(BackendError::MissingConfig("PROJECT_ID"))?
            .to_string();

        let account_json = cfg
            .get("ACCOUNT_JSON")
            .ok_or(BackendError::MissingConfig("ACCOUNT_JSON"))?;
        let account_key = ServiceAccountKey::from_file(account_json)?;

        let ssh_key_path = cfg
            .get("SSH_KEY_PATH")
            .ok_or(BackendError::MissingConfig("SSH_KEY_PATH"))?;
        let ssh_key_pem = read_config_file("SSH_KEY_PATH", ssh_key_path)?;

        let ssh_pub_key_path = cfg
            .get("SSH_PUB_KEY_PATH")
            .ok_or(BackendError::MissingConfig("SSH_PUB_KEY_PATH"))?;
        let ssh_pub_key = read_config_file("SSH_PUB_KEY_PATH", ssh_pub_key_path)?;

        let ssh_key_passphrase = cfg
            .get("SSH_KEY_PASSPHRASE")
            .ok_or(BackendError::MissingConfig("SSH_KEY_PASSPHRASE"))?
            .to_string();

        let disk_size_gb = match cfg.get("DISK_SIZE") {
            Some(raw) => raw.parse().map_err(|_| BackendError::InvalidConfig {
                key: "DISK_SIZE",
                reason: format!("not an integer: {raw}"),
            })?,
            None => DEFAULT_DISK_SIZE_GB,
        };

        let preemptible = match cfg.get("PREEMPTIBLE") {
            Some(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => true,
        };

        Ok(Self {
            project_id,
            zone: cfg.get_or("ZONE", DEFAULT_ZONE).to_string(),
            machine_type: cfg.get_or("MACHINE_TYPE", DEFAULT_MACHINE_TYPE).to_string(),
            network: cfg.get_or("NETWORK", DEFAULT_NETWORK).to_string(),
            disk_size_gb,
            account_key,
            ssh_key_pem,
            ssh_pub_key,
            ssh_key_passphrase,
            language_mappings: parse_language_mappings(cfg.get("LANGUAGE_MAPPINGS")),
            default_language: cfg.get_or("DEFAULT_LANGUAGE", DEFAULT_LANGUAGE).to_string(),
            preemptible,
            api_endpoint: cfg.get_or("API_ENDPOINT", DEFAULT_API_ENDPOINT).to_string(),
            token_uri: cfg.get_or("TOKEN_URI", DEFAULT_TOKEN_URI).to_string(),
        })
    }
}

fn read_config_file(key: &'static str, path: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| BackendError::InvalidConfig {
        key,
        reason: format!("{path}: {e}"),
    })
}

/// Parse `key=value` comma-delimited language mappings.
fn parse_language_mappings(raw: Option<&str>) -> HashMap<String, String> {
    let mut mappings = HashMap::new();
    let Some(raw) = raw else {
        return mappings;
    };
    for pair in raw.split(',') {
        let mut kv = pair.trim().splitn(2, '=');
        if let (Some(key), Some(value)) = (kv.next(), kv.next())
            && !key.is_empty()
            && !value.is_empty()
        {
            mappings.insert(key.to_string(), value.to_string());
        }
    }
    mappings
}

/// GCE provider.
#[derive(Debug)]
pub struct GceProvider {
    client: Arc<ComputeClient>,
    config: GceProviderConfig,
    ssh: SshConfig,
    metrics: Arc<WorkerMetrics>,
    poll_interval: Duration,
}

impl GceProvider {
    /// Build a provider from the nested provider config.
    pub fn new(cfg: &ProviderConfig, metrics: Arc<WorkerMetrics>) -> Result<Self> {
        let config = GceProviderConfig::from_provider_config(cfg)?;
        Self::with_config(config, metrics)
    }

    /// Build a provider from an already-parsed configuration.
    pub fn with_config(config: GceProviderConfig, metrics: Arc<WorkerMetrics>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        let tokens = TokenSource::new(http.clone(), &config.account_key, config.token_uri.clone())?;
        let client = Arc::new(ComputeClient::new(
            http,
            tokens,
            config.api_endpoint.clone(),
            config.project_id.clone(),
        ));

        let ssh = SshConfig {
            user: AUTH_USER,
            key_pem: config.ssh_key_pem.clone(),
            passphrase: config.ssh_key_passphrase.clone(),
            connect_timeout: Duration::from_secs(10),
            read_timeout_ms: 1_000,
        };

        Ok(Self {
            client,
            config,
            ssh,
            metrics,
            poll_interval: OPERATION_POLL_INTERVAL,
        })
    }

    /// Find the newest image for the job's language.
    async fn resolve_image(&self, token: &CancellationToken, language: &str) -> Result<Image> {
        let candidates = images::candidate_languages(
            language,
            &self.config.language_mappings,
            &self.config.default_language,
        );

        for candidate in &candidates {
            let filter = images::image_filter(candidate);
            let listed = tokio::select! {
                _ = token.cancelled() => return Err(BackendError::Cancelled),
                result = self.client.list_images(&filter) => result?,
            };

            if let Some(best) = images::newest_image(listed) {
                debug!(language = %language, candidate = %candidate, image = %best.name, "Selected image");
                return Ok(best);
            }
        }

        Err(BackendError::NoImage(language.to_string()))
    }

    fn instance_payload(&self, name: &str, language: &str, image: &Image) -> InstancePayload {
        InstancePayload {
            name: name.to_string(),
            description: format!("Travis CI {language} test VM"),
            machine_type: self
                .client
                .machine_type_link(&self.config.zone, &self.config.machine_type),
            disks: vec![AttachedDisk {
                disk_type: "PERSISTENT",
                mode: "READ_WRITE",
                boot: true,
                auto_delete: true,
                initialize_params: InitializeParams {
                    source_image: image.self_link.clone(),
                    disk_type: self.client.disk_type_link(&self.config.zone),
                    disk_size_gb: self.config.disk_size_gb,
                },
            }],
            scheduling: Scheduling {
                preemptible: self.config.preemptible,
            },
            metadata: Metadata {
                items: vec![MetadataItem {
                    key: "startup-script",
                    value: startup_script(&self.config.ssh_pub_key),
                }],
            },
            network_interfaces: vec![NetworkInterfacePayload {
                network: self.client.network_link(&self.config.network),
                access_configs: vec![AccessConfigPayload {
                    name: "External NAT",
                    access_type: "ONE_TO_ONE_NAT",
                }],
            }],
            tags: Tags {
                items: vec!["testing".to_string(), language.to_string()],
            },
        }
    }
}

#[async_trait]
impl Provider for GceProvider {
    fn name(&self) -> &'static str {
        "gce"
    }

    async fn start(
        &self,
        token: &CancellationToken,
        attrs: &StartAttributes,
    ) -> Result<Box<dyn Instance>> {
        let boot_started = Instant::now();

        let image = self.resolve_image(token, &attrs.language).await?;

        let name = format!("testing-gce-{}", Uuid::new_v4());
        let payload = self.instance_payload(&name, &attrs.language, &image);

        debug!(instance = %name, image = %image.name, "Inserting instance");
        let op = tokio::select! {
            _ = token.cancelled() => return Err(BackendError::Cancelled),
            result = self.client.insert_instance(&self.config.zone, &payload) => result?,
        };

        self.client
            .await_zone_operation(token, &self.config.zone, &op, self.poll_interval)
            .await?;

        let api_instance = tokio::select! {
            _ = token.cancelled() => return Err(BackendError::Cancelled),
            result = self.client.get_instance(&self.config.zone, &name) => result?,
        };
        let ip = api_instance
            .nat_ip()
            .ok_or(BackendError::MissingIpAddress)?
            .to_string();

        self.metrics.observe_boot(self.name(), boot_started.elapsed());
        info!(
            instance = %name,
            image = %image.name,
            ip = %ip,
            boot_ms = boot_started.elapsed().as_millis() as u64,
            "Instance booted"
        );

        Ok(Box::new(GceInstance::new(
            self.client.clone(),
            self.config.zone.clone(),
            name,
            image.name.clone(),
            ip,
            self.ssh.clone(),
            self.poll_interval,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_language_mappings() {
        let mappings = parse_language_mappings(Some("py=python, rb=ruby,=bad,empty="));
        assert_eq!(mappings.get("py").map(String::as_str), Some("python"));
        assert_eq!(mappings.get("rb").map(String::as_str), Some("ruby"));
        assert_eq!(mappings.len(), 2);
    }

    #[test]
    fn test_parse_language_mappings_none() {
        assert!(parse_language_mappings(None).is_empty());
    }

    #[test]
    fn test_startup_script_installs_key() {
        let script = startup_script("ssh-rsa AAAA... worker");
        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.contains("~travis/.ssh/authorized_keys"));
        assert!(script.contains("ssh-rsa AAAA... worker"));
    }

    #[test]
    fn test_config_requires_project_id() {
        let cfg = ProviderConfig::default();
        let err = GceProviderConfig::from_provider_config(&cfg).unwrap_err();
        assert!(matches!(err, BackendError::MissingConfig("PROJECT_ID")));
    }

    #[test]
    fn test_config_requires_account_json() {
        let cfg = ProviderConfig::from_pairs([("PROJECT_ID", "p")]);
        let err = GceProviderConfig::from_provider_config(&cfg).unwrap_err();
        assert!(matches!(err, BackendError::MissingConfig("ACCOUNT_JSON")));
    }

    #[test]
    fn test_config_defaults_and_preemptible() {
        let dir = tempfile::tempdir().unwrap();
        let account = dir.path().join("account.json");
        std::fs::write(
            &account,
            r#"{"client_email": "w@p.example.com", "private_key": "pem"}"#,
        )
        .unwrap();
        let key = dir.path().join("id_rsa");
        std::fs::write(&key, "private").unwrap();
        let pubkey = dir.path().join("id_rsa.pub");
        std::fs::write(&pubkey, "ssh-rsa AAAA").unwrap();

        let cfg = ProviderConfig::from_pairs([
            ("PROJECT_ID", "proj"),
            ("ACCOUNT_JSON", account.to_str().unwrap()),
            ("SSH_KEY_PATH", key.to_str().unwrap()),
            ("SSH_PUB_KEY_PATH", pubkey.to_str().unwrap()),
            ("SSH_KEY_PASSPHRASE", "hunter2"),
        ]);

        let parsed = GceProviderConfig::from_provider_config(&cfg).unwrap();
        assert_eq!(parsed.zone, DEFAULT_ZONE);
        assert_eq!(parsed.machine_type, DEFAULT_MACHINE_TYPE);
        assert_eq!(parsed.network, DEFAULT_NETWORK);
        assert_eq!(parsed.disk_size_gb, DEFAULT_DISK_SIZE_GB);
        assert_eq!(parsed.default_language, DEFAULT_LANGUAGE);
        assert!(parsed.preemptible);

        let cfg = ProviderConfig::from_pairs([
            ("PROJECT_ID", "proj"),
            ("ACCOUNT_JSON", account.to_str().unwrap()),
            ("SSH_KEY_PATH", key.to_str().unwrap()),
            ("SSH_PUB_KEY_PATH", pubkey.to_str().unwrap()),
            ("SSH_KEY_PASSPHRASE", "hunter2"),
            ("PREEMPTIBLE", "false"),
            ("DISK_SIZE", "40"),
        ]);
        let parsed = GceProviderConfig::from_provider_config(&cfg).unwrap();
        assert!(!parsed.preemptible);
        assert_eq!(parsed.disk_size_gb, 40);
    }

    #[test]
    fn test_config_rejects_bad_disk_size() {
        let dir = tempfile::tempdir().unwrap();
        let account = dir.path().join("account.json");
        std::fs::write(
            &account,
            r#"{"client_email": "w@p.example.com", "private_key": "pem"}"#,
        )
        .unwrap();
        let key = dir.path().join("id_rsa");
        std::fs::write(&key, "private").unwrap();
        let pubkey = dir.path().join("id_rsa.pub");
        std::fs::write(&pubkey, "ssh-rsa AAAA").unwrap();

        let cfg = ProviderConfig::from_pairs([
            ("PROJECT_ID", "proj"),
            ("ACCOUNT_JSON", account.to_str().unwrap()),
            ("SSH_KEY_PATH", key.to_str().unwrap()),
            ("SSH_PUB_KEY_PATH", pubkey.to_str().unwrap()),
            ("SSH_KEY_PASSPHRASE", "hunter2"),
            ("DISK_SIZE", "lots"),
        ]);
        let err = GceProviderConfig::from_provider_config(&cfg).unwrap_err();
        assert!(matches!(
            err,
            BackendError::InvalidConfig {
                key: "DISK_SIZE",
                ..
            }
        ));
    }
}
