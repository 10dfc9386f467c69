// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job messages.
//!
//! A [`Job`] is the typed view of one bus delivery: the decoded
//! payload, the raw bytes (handed verbatim to the script producer),
//! and the delivery handle. The settle methods consume the job, so
//! every job receives exactly one terminal acknowledgment.

use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::queue::Delivery;

/// Decoded build-job payload.
///
/// Unknown fields are ignored; the undecoded bytes are kept alongside
/// and passed through to the script producer untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct JobPayload {
    /// Opaque job identifier.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    /// Repository display slug (e.g. `acme/widget`).
    pub repository: String,
    /// Short language tag used to select a base image.
    #[serde(default)]
    pub language: Option<String>,
    /// Optional per-job run deadline override, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Optional correlation id attached by the enqueuer.
    #[serde(default)]
    pub uuid: Option<String>,
}

/// Deserialize an id from either a string or an integer.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct IdVisitor;

    impl Visitor<'_> for IdVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer job id")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<String, E> {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

/// One unit of work pulled from the bus.
pub struct Job {
    /// Decoded payload.
    pub payload: JobPayload,
    /// Raw delivery bytes, as received.
    pub raw: Vec<u8>,
    delivery: Box<dyn Delivery>,
}

impl Job {
    /// Decode a delivery into a job.
    ///
    /// On structural decode failure the delivery is handed back so the
    /// caller can drop it as undeliverable.
    pub fn decode(delivery: Box<dyn Delivery>) -> Result<Self, (Box<dyn Delivery>, serde_json::Error)> {
        let raw = delivery.payload().to_vec();
        match serde_json::from_slice::<JobPayload>(&raw) {
            Ok(payload) => Ok(Self {
                payload,
                raw,
                delivery,
            }),
            Err(e) => Err((delivery, e)),
        }
    }

    /// Acknowledge the job as fully processed.
    pub async fn ack(self) {
        if let Err(e) = self.delivery.ack().await {
            warn!(job_id = %self.payload.id, error = %e, "Failed to ack job");
        }
    }

    /// Return the job to the queue for redelivery to another worker.
    pub async fn requeue(self) {
        if let Err(e) = self.delivery.nack(true).await {
            warn!(job_id = %self.payload.id, error = %e, "Failed to requeue job");
        }
    }

    /// Drop the job as undeliverable.
    pub async fn reject(self) {
        if let Err(e) = self.delivery.nack(false).await {
            warn!(job_id = %self.payload.id, error = %e, "Failed to reject job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_decode_string_id() {
        let payload: JobPayload = serde_json::from_str(
            r#"{"id": "job-17", "repository": "acme/widget", "language": "ruby"}"#,
        )
        .unwrap();
        assert_eq!(payload.id, "job-17");
        assert_eq!(payload.repository, "acme/widget");
        assert_eq!(payload.language.as_deref(), Some("ruby"));
        assert!(payload.timeout_secs.is_none());
    }

    #[test]
    fn test_payload_decode_numeric_id() {
        let payload: JobPayload =
            serde_json::from_str(r#"{"id": 42, "repository": "acme/widget"}"#).unwrap();
        assert_eq!(payload.id, "42");
        assert!(payload.language.is_none());
    }

    #[test]
    fn test_payload_decode_ignores_unknown_fields() {
        let payload: JobPayload = serde_json::from_str(
            r#"{"id": 1, "repository": "a/b", "queue": "builds.linux", "config": {"env": "FOO=1"}}"#,
        )
        .unwrap();
        assert_eq!(payload.id, "1");
    }

    #[test]
    fn test_payload_decode_missing_repository_fails() {
        let result = serde_json::from_str::<JobPayload>(r#"{"id": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_payload_decode_timeout_and_uuid() {
        let payload: JobPayload = serde_json::from_str(
            r#"{"id": 7, "repository": "a/b", "timeout_secs": 120, "uuid": "c0ffee"}"#,
        )
        .unwrap();
        assert_eq!(payload.timeout_secs, Some(120));
        assert_eq!(payload.uuid.as_deref(), Some("c0ffee"));
    }
}
