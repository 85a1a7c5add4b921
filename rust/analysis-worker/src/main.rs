/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Analysis worker — the consumer side of the dispatch bus.
//!
//! Subscribes to the completion and prescription job subjects at startup,
//! runs every received job through the fallback strategy chain in its own
//! task, and publishes each result to the job's reply subject (or the fixed
//! response subject when none was supplied).

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::process;
use std::sync::Arc;
use std::time::Duration;

use rxline_analysis::{Budgets, FallbackChain, ProviderClient, StrategyContext};
use rxline_config::Config;
use rxline_dispatch::{JobConsumer, JobKind, NatsTransport, Subjects, Transport};
use rxline_runtime::CircuitBreaker;
use tokio::sync::watch;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SERVICE_NAME: &str = "analysis-worker";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_HALF_OPEN_SECS: u64 = 30;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
enum WorkerError {
    #[error("transport error: {0}")]
    Transport(#[from] rxline_dispatch::TransportError),
    #[error("internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(1);
    });
    let config = Arc::new(config);

    let _telemetry_guard = rxline_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });

    info!(service = SERVICE_NAME, version = SERVICE_VERSION, "starting");

    let consumer = match init_consumer(&config).await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise");
            process::exit(1);
        }
    };

    // Graceful shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for kind in [JobKind::Completion, JobKind::Prescription] {
        let consumer = Arc::clone(&consumer);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = consumer.run_subscription(kind, rx).await {
                error!(error = %e, kind = kind.as_str(), "job subscription failed");
            }
        }));
    }

    rxline_runtime::shutdown_signal().await;

    info!("shutdown signal received, stopping subscriptions");
    let _ = shutdown_tx.send(true);

    // Give in-flight jobs time to publish their replies
    for handle in handles {
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "subscription task panicked"),
            Err(_) => warn!(
                "subscription did not stop within {}s, forcing shutdown",
                DRAIN_TIMEOUT.as_secs()
            ),
        }
    }

    let counters = consumer.counters();
    info!(
        jobs_received = counters.jobs_received(),
        replies_published = counters.replies_published(),
        degraded_results = counters.degraded_results(),
        "shutdown complete"
    );
}

async fn init_consumer(config: &Arc<Config>) -> Result<JobConsumer, WorkerError> {
    let transport = NatsTransport::connect(SERVICE_NAME, &config.nats).await?;

    // Shared HTTP client for provider calls and image downloads (rustls)
    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| WorkerError::Internal(format!("failed to create HTTP client: {e}")))?;

    let breaker = Arc::new(CircuitBreaker::new(
        "provider",
        CIRCUIT_FAILURE_THRESHOLD,
        CIRCUIT_HALF_OPEN_SECS,
    ));
    let provider = Arc::new(ProviderClient::new(http.clone(), &config.provider, breaker));

    let chain = Arc::new(FallbackChain::new(StrategyContext {
        provider,
        http,
        budgets: Budgets::from_config(config),
    }));

    Ok(JobConsumer::new(
        Arc::new(transport) as Arc<dyn Transport>,
        chain,
        Subjects::new(&config.nats.subject_prefix),
    ))
}
