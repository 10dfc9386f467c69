// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry - Build Job Worker Daemon
//!
//! A long-running worker that consumes build jobs from a message bus,
//! provisions one ephemeral cloud VM per job, uploads a generated build
//! script into it, streams the script's output back, reports a terminal
//! result, and tears the VM down.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Message Bus (AMQP)                      │
//! │        builds.linux → │ │ ← reporting.jobs.{builds,logs}        │
//! └───────────┬─────────────────────────────▲───────────────────────┘
//!             │ deliveries                  │ reports + log parts
//!             ▼                             │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    gantry-worker (this crate)                   │
//! │  ┌────────────┐  ┌─────────────────────────────┐  ┌──────────┐  │
//! │  │    Pool    │  │  Processor × POOL_SIZE      │  │ Metrics  │  │
//! │  │ Supervisor │  │  (per-job state machine)    │  │ Reporter │  │
//! │  └────────────┘  └──────────────┬──────────────┘  └──────────┘  │
//! └─────────────────────────────────┼───────────────────────────────┘
//!             script bytes ▲        │ start / upload / run / stop
//!                          │        ▼
//!            ┌──────────────────┐  ┌─────────────────────────────────┐
//!            │  Script Producer │  │  Compute Backend (GCE)          │
//!            │  (HTTP)          │  │  REST control plane + SSH/SFTP  │
//!            └──────────────────┘  └─────────────────────────────────┘
//! ```
//!
//! # Job lifecycle
//!
//! ```text
//!                     ┌──────────┐
//!                     │ RECEIVED │──bad payload──→ REJECT (drop)
//!                     └────┬─────┘
//!                          │ decode + script
//!                          ▼
//!                   ┌──────────────┐
//!                   │ PROVISIONING │──boot error──→ REQUEUE
//!                   └────┬─────────┘
//!                        │ booted
//!                        ▼
//!                   ┌───────────┐
//!                   │ UPLOADING │──stale VM / error──→ REQUEUE (+stop)
//!                   └────┬──────┘
//!                        │ uploaded
//!                        ▼
//!                   ┌─────────┐
//!                   │ RUNNING │──invocation error──→ REQUEUE (+stop)
//!                   └────┬────┘
//!                        │ exited (any code)
//!                        ▼
//!                   ┌───────────┐
//!                   │ REPORTING │──publish error──→ REQUEUE (+stop)
//!                   └────┬──────┘
//!                        │ reported
//!                        ▼
//!                   ACKED (+stop)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AMQP_URI` | Yes | - | Message bus endpoint |
//! | `BUILD_API_URI` | Yes | - | Script producer endpoint |
//! | `POOL_SIZE` | No | `2` | Concurrent processors |
//! | `QUEUE_NAME` | No | `builds.linux` | Consumed queue |
//! | `PROVIDER_NAME` | No | `gce` | Compute backend |
//! | `PROVIDER_CONFIG_*` | Per-backend | - | Nested backend keys |
//! | `PROVISION_TIMEOUT_SECS` | No | `240` | VM boot deadline |
//! | `UPLOAD_TIMEOUT_SECS` | No | `60` | Script upload deadline |
//! | `RUN_TIMEOUT_SECS` | No | `3000` | Default script deadline |
//! | `STOP_TIMEOUT_SECS` | No | `120` | Teardown deadline |
//! | `LIBRATO_{EMAIL,TOKEN,SOURCE}` | No | - | Metrics sink tag |
//!
//! # Modules
//!
//! - [`backend`]: Compute backends (provider/instance contract, GCE, mock)
//! - [`config`]: Worker configuration from environment variables
//! - [`error`]: Error types for worker operations
//! - [`job`]: Job payloads and terminal acknowledgment
//! - [`metrics`]: Prometheus registry and snapshot reporter
//! - [`pool`]: Processor pool supervisor and shutdown orchestration
//! - [`processor`]: Per-job lifecycle state machine
//! - [`queue`]: Message bus consumption
//! - [`reporter`]: Terminal state reports and log streaming
//! - [`script`]: Build-script producer client

#![deny(missing_docs)]

/// Compute backends (provider/instance contract, GCE, mock).
pub mod backend;

/// Worker configuration loaded from environment variables.
pub mod config;

/// Error types for worker operations.
pub mod error;

/// Job payloads and terminal acknowledgment.
pub mod job;

/// Prometheus registry and snapshot reporter.
pub mod metrics;

/// Processor pool supervisor and shutdown orchestration.
pub mod pool;

/// Per-job lifecycle state machine.
pub mod processor;

/// Message bus consumption.
pub mod queue;

/// Terminal state reports and log streaming.
pub mod reporter;

/// Build-script producer client.
pub mod script;

pub use config::Config;
pub use error::Error;
