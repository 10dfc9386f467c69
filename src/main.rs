// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry worker daemon.
//!
//! Connects to the message bus, instantiates the configured compute
//! backend, and runs the processor pool until shutdown. The first
//! interrupt drains the pool gracefully; a second interrupt cancels
//! every in-flight backend call.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use gantry_worker::backend;
use gantry_worker::config::Config;
use gantry_worker::metrics::WorkerMetrics;
use gantry_worker::pool::ProcessorPool;
use gantry_worker::queue::{AmqpJobSource, JobSource};
use gantry_worker::reporter::AmqpReporter;
use gantry_worker::script::HttpScriptGenerator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_worker=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        pool_size = config.pool_size,
        queue = %config.queue_name,
        provider = %config.provider_name,
        "Starting gantry worker"
    );

    let metrics = Arc::new(WorkerMetrics::new()?);

    // Connect to the message bus
    let conn = lapin::Connection::connect(
        &config.amqp_uri,
        lapin::ConnectionProperties::default(),
    )
    .await
    .context("couldn't connect to AMQP")?;

    info!("Connected to AMQP");

    let source = Arc::new(
        AmqpJobSource::open(&conn, &config.queue_name, config.pool_size)
            .await
            .context("couldn't open job consumer")?,
    );
    let reporter = Arc::new(
        AmqpReporter::open(&conn)
            .await
            .context("couldn't open reporting channel")?,
    );

    let generator = Arc::new(HttpScriptGenerator::new(&config.build_api_uri)?);

    let provider = backend::create_provider(
        &config.provider_name,
        &config.provider_config,
        metrics.clone(),
    )
    .context("couldn't create backend provider")?;

    let running = ProcessorPool::builder()
        .source(source.clone())
        .provider(provider)
        .generator(generator)
        .reporter(reporter)
        .metrics(metrics)
        .pool_size(config.pool_size)
        .processor_config(gantry_worker::processor::ProcessorConfig {
            provision_timeout: config.provision_timeout,
            upload_timeout: config.upload_timeout,
            run_timeout: config.run_timeout,
            stop_timeout: config.stop_timeout,
        })
        .metrics_source(config.librato.as_ref().map(|l| l.source.clone()))
        .build()?
        .start();

    // First interrupt drains, second cancels outright.
    let drain_source = source.clone();
    let hard_token = running.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Interrupt received, starting graceful shutdown");
        if let Err(e) = drain_source.drain().await {
            warn!(error = %e, "Failed to drain job source");
        }

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Second interrupt received, cancelling in-flight jobs");
        hard_token.cancel();
    });

    running.wait().await;

    if let Err(e) = conn.close(200, "worker shutting down").await {
        warn!(error = %e, "Couldn't close AMQP connection cleanly");
    }

    info!("Gantry worker shut down");

    Ok(())
}
