// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minimal Compute REST client.
//!
//! Only the handful of calls the backend needs: instance insert/get/
//! delete, image listing, and zone-operation polling. Wire types keep
//! the API's camelCase field names via serde renames.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::auth::TokenSource;
use crate::backend::traits::{BackendError, OperationError, OperationSubError, Result};

/// An asynchronous zone operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name, used for polling.
    pub name: String,
    /// `PENDING`, `RUNNING` or `DONE`.
    pub status: String,
    /// Populated when the finished operation failed.
    #[serde(default)]
    pub error: Option<OperationErrorBody>,
}

/// Error container of a finished operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationErrorBody {
    /// All sub-errors the operation reported.
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

/// One wire-level operation sub-error.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationErrorItem {
    /// Machine-readable code.
    #[serde(default)]
    pub code: String,
    /// Request location of the error.
    #[serde(default)]
    pub location: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

impl From<OperationErrorBody> for OperationError {
    fn from(body: OperationErrorBody) -> Self {
        OperationError {
            errors: body
                .errors
                .into_iter()
                .map(|e| OperationSubError {
                    code: e.code,
                    location: e.location,
                    message: e.message,
                })
                .collect(),
        }
    }
}

/// A boot image.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Image name; lexicographic order doubles as version order.
    pub name: String,
    /// Fully-qualified resource link.
    pub self_link: String,
}

#[derive(Debug, Deserialize)]
struct ImageList {
    #[serde(default)]
    items: Vec<Image>,
}

/// A running instance as reported by the API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiInstance {
    /// Instance name.
    pub name: String,
    /// Attached network interfaces.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl ApiInstance {
    /// First NAT address across all interfaces, if any.
    pub fn nat_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|ni| ni.access_configs.iter())
            .find_map(|ac| ac.nat_ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }
}

/// One network interface of an instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// NAT access configurations.
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// NAT access configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// External NAT address, when assigned.
    #[serde(rename = "natIP")]
    pub nat_ip: Option<String>,
}

/// Instance creation payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePayload {
    /// Instance name.
    pub name: String,
    /// Display description.
    pub description: String,
    /// Machine type resource link.
    pub machine_type: String,
    /// Attached disks; exactly one auto-delete boot disk.
    pub disks: Vec<AttachedDisk>,
    /// Scheduling options.
    pub scheduling: Scheduling,
    /// Instance metadata (startup script).
    pub metadata: Metadata,
    /// Network interfaces.
    pub network_interfaces: Vec<NetworkInterfacePayload>,
    /// Instance tags.
    pub tags: Tags,
}

/// Boot disk attachment.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    /// Disk type (`PERSISTENT`).
    #[serde(rename = "type")]
    pub disk_type: &'static str,
    /// Attachment mode.
    pub mode: &'static str,
    /// Whether this is the boot disk.
    pub boot: bool,
    /// Delete the disk with the instance.
    pub auto_delete: bool,
    /// Disk initialization parameters.
    pub initialize_params: InitializeParams,
}

/// Parameters for initializing a fresh boot disk.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Source image link.
    pub source_image: String,
    /// Disk type link.
    pub disk_type: String,
    /// Size in GB.
    pub disk_size_gb: i64,
}

/// Scheduling options.
#[derive(Debug, Serialize)]
pub struct Scheduling {
    /// Request a preemptible VM.
    pub preemptible: bool,
}

/// Metadata key/value items.
#[derive(Debug, Serialize)]
pub struct Metadata {
    /// Items.
    pub items: Vec<MetadataItem>,
}

/// One metadata entry.
#[derive(Debug, Serialize)]
pub struct MetadataItem {
    /// Entry key.
    pub key: &'static str,
    /// Entry value.
    pub value: String,
}

/// Network interface creation payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfacePayload {
    /// Network resource link.
    pub network: String,
    /// NAT access configurations.
    pub access_configs: Vec<AccessConfigPayload>,
}

/// NAT access configuration payload.
#[derive(Debug, Serialize)]
pub struct AccessConfigPayload {
    /// Display name.
    pub name: &'static str,
    /// Access type (`ONE_TO_ONE_NAT`).
    #[serde(rename = "type")]
    pub access_type: &'static str,
}

/// Instance tags.
#[derive(Debug, Serialize)]
pub struct Tags {
    /// Tag items.
    pub items: Vec<String>,
}

/// Thin client over the Compute REST API.
pub struct ComputeClient {
    http: reqwest::Client,
    tokens: TokenSource,
    base: String,
    project: String,
}

impl std::fmt::Debug for ComputeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeClient")
            .field("base", &self.base)
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

impl ComputeClient {
    /// Create a client for `project` against `base` (the REST root).
    pub fn new(http: reqwest::Client, tokens: TokenSource, base: String, project: String) -> Self {
        Self {
            http,
            tokens,
            base: base.trim_end_matches('/').to_string(),
            project,
        }
    }

    fn project_url(&self, rest: &str) -> String {
        format!("{}/projects/{}/{}", self.base, self.project, rest)
    }

    /// Machine type resource link.
    pub fn machine_type_link(&self, zone: &str, machine_type: &str) -> String {
        self.project_url(&format!("zones/{zone}/machineTypes/{machine_type}"))
    }

    /// Network resource link.
    pub fn network_link(&self, network: &str) -> String {
        self.project_url(&format!("global/networks/{network}"))
    }

    /// Standard persistent disk type link.
    pub fn disk_type_link(&self, zone: &str) -> String {
        self.project_url(&format!("zones/{zone}/diskTypes/pd-standard"))
    }

    /// List images matching the given filter expression.
    pub async fn list_images(&self, filter: &str) -> Result<Vec<Image>> {
        let token = self.tokens.bearer().await?;
        let list: ImageList = self
            .http
            .get(self.project_url("global/images"))
            .bearer_auth(token)
            .query(&[("filter", filter)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.items)
    }

    /// Create an instance; returns the pending zone operation.
    pub async fn insert_instance(&self, zone: &str, payload: &InstancePayload) -> Result<Operation> {
        let token = self.tokens.bearer().await?;
        let op = self
            .http
            .post(self.project_url(&format!("zones/{zone}/instances")))
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(op)
    }

    /// Fetch a running instance.
    pub async fn get_instance(&self, zone: &str, name: &str) -> Result<ApiInstance> {
        let token = self.tokens.bearer().await?;
        let instance = self
            .http
            .get(self.project_url(&format!("zones/{zone}/instances/{name}")))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(instance)
    }

    /// Delete an instance; `Ok(None)` when it is already gone.
    pub async fn delete_instance(&self, zone: &str, name: &str) -> Result<Option<Operation>> {
        let token = self.tokens.bearer().await?;
        let response = self
            .http
            .delete(self.project_url(&format!("zones/{zone}/instances/{name}")))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let op = response.error_for_status()?.json().await?;
        Ok(Some(op))
    }

    /// Fetch the current state of a zone operation.
    pub async fn get_zone_operation(&self, zone: &str, name: &str) -> Result<Operation> {
        let token = self.tokens.bearer().await?;
        let op = self
            .http
            .get(self.project_url(&format!("zones/{zone}/operations/{name}")))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(op)
    }

    /// Poll a zone operation until it is `DONE` or the token cancels.
    ///
    /// Operation-level errors surface as [`BackendError::Operation`],
    /// distinct from transport errors on the poll calls themselves.
    pub async fn await_zone_operation(
        &self,
        token: &CancellationToken,
        zone: &str,
        op: &Operation,
        poll_interval: std::time::Duration,
    ) -> Result<()> {
        let mut current = op.clone();
        loop {
            if current.status == "DONE" {
                return match current.error {
                    Some(body) if !body.errors.is_empty() => {
                        Err(BackendError::Operation(body.into()))
                    }
                    _ => Ok(()),
                };
            }

            debug!(operation = %current.name, status = %current.status, "Waiting for zone operation");

            tokio::select! {
                _ = token.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }

            current = tokio::select! {
                _ = token.cancelled() => return Err(BackendError::Cancelled),
                result = self.get_zone_operation(zone, &current.name) => result?,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_decodes_error_body() {
        let op: Operation = serde_json::from_str(
            r#"{
                "name": "operation-123",
                "status": "DONE",
                "error": {"errors": [
                    {"code": "QUOTA_EXCEEDED", "location": "zone", "message": "no quota"}
                ]}
            }"#,
        )
        .unwrap();

        let body = op.error.unwrap();
        let err: OperationError = body.into();
        assert_eq!(err.errors.len(), 1);
        assert!(err.to_string().contains("code=QUOTA_EXCEEDED"));
    }

    #[test]
    fn test_instance_nat_ip_lookup() {
        let instance: ApiInstance = serde_json::from_str(
            r#"{
                "name": "testing-gce-1",
                "networkInterfaces": [
                    {"accessConfigs": [{"natIP": null}]},
                    {"accessConfigs": [{"natIP": "203.0.113.7"}]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(instance.nat_ip(), Some("203.0.113.7"));
    }

    #[test]
    fn test_instance_without_nat_ip() {
        let instance: ApiInstance =
            serde_json::from_str(r#"{"name": "testing-gce-2", "networkInterfaces": []}"#).unwrap();
        assert!(instance.nat_ip().is_none());
    }

    #[test]
    fn test_instance_payload_wire_names() {
        let payload = InstancePayload {
            name: "testing-gce-abc".to_string(),
            description: "worker VM".to_string(),
            machine_type: "zones/z/machineTypes/n1-standard-2".to_string(),
            disks: vec![AttachedDisk {
                disk_type: "PERSISTENT",
                mode: "READ_WRITE",
                boot: true,
                auto_delete: true,
                initialize_params: InitializeParams {
                    source_image: "global/images/travis-ci-ruby-9".to_string(),
                    disk_type: "zones/z/diskTypes/pd-standard".to_string(),
                    disk_size_gb: 20,
                },
            }],
            scheduling: Scheduling { preemptible: true },
            metadata: Metadata {
                items: vec![MetadataItem {
                    key: "startup-script",
                    value: "#!/usr/bin/env bash".to_string(),
                }],
            },
            network_interfaces: vec![NetworkInterfacePayload {
                network: "global/networks/default".to_string(),
                access_configs: vec![AccessConfigPayload {
                    name: "External NAT",
                    access_type: "ONE_TO_ONE_NAT",
                }],
            }],
            tags: Tags {
                items: vec!["testing".to_string(), "ruby".to_string()],
            },
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["machineType"], "zones/z/machineTypes/n1-standard-2");
        assert_eq!(json["disks"][0]["type"], "PERSISTENT");
        assert_eq!(json["disks"][0]["autoDelete"], true);
        assert_eq!(
            json["disks"][0]["initializeParams"]["diskSizeGb"],
            serde_json::json!(20)
        );
        assert_eq!(json["scheduling"]["preemptible"], true);
        assert_eq!(
            json["networkInterfaces"][0]["accessConfigs"][0]["type"],
            "ONE_TO_ONE_NAT"
        );
    }
}
