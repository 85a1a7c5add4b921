/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Shared runtime utilities for RxLine services.
//!
//! Provides the building blocks every service needs:
//! - [`CircuitBreaker`]: failure tracking with half-open recovery, used to
//!   guard the completion provider endpoint
//! - [`shutdown_signal`]: graceful SIGINT/SIGTERM handler
//! - [`connect_nats`]: NATS connection with bounded reconnects

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Thread-safe circuit breaker: CLOSED → OPEN → HALF-OPEN.
///
/// After `threshold` consecutive failures the circuit opens and every call is
/// rejected for `half_open_secs`. Once that window elapses a single probe is
/// let through; a success closes the breaker again, a failure re-opens it.
pub struct CircuitBreaker {
    name: String,
    consecutive_failures: AtomicU32,
    last_failure_epoch_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    threshold: u32,
    half_open_secs: u64,
}

impl CircuitBreaker {
    /// Create a new breaker. `name` identifies it in errors and logs.
    #[must_use]
    pub fn new(name: &str, threshold: u32, half_open_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            consecutive_failures: AtomicU32::new(0),
            last_failure_epoch_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            threshold,
            half_open_secs,
        }
    }

    /// Returns `true` if the circuit is open and calls should be rejected.
    ///
    /// In the half-open window exactly one caller wins the compare-exchange
    /// and becomes the probe; everyone else keeps seeing the circuit as open
    /// until the probe reports back.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures < self.threshold {
            return false;
        }
        let last_ms = self.last_failure_epoch_ms.load(Ordering::Relaxed);
        let elapsed_secs = now_epoch_ms().saturating_sub(last_ms) / 1000;
        if elapsed_secs >= self.half_open_secs
            && self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return false; // this caller is the probe
        }
        true
    }

    /// Record a success — closes the circuit and clears the probe flag.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Record a failure. Clears the probe flag so the next half-open window
    /// can try again.
    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_epoch_ms
            .store(now_epoch_ms(), Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// `Ok(())` when calls may proceed, `Err(name)` when the circuit is open.
    ///
    /// # Errors
    ///
    /// Returns the breaker name when the circuit is open.
    pub fn check(&self) -> Result<(), String> {
        if self.is_open() {
            return Err(self.name.clone());
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Wait for SIGINT (ctrl-c) or SIGTERM, then return.
///
/// Use with `tokio::select!` or `axum::serve(...).with_graceful_shutdown(...)`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// NATS connection
// ---------------------------------------------------------------------------

/// Connect to NATS with the configured connect timeout, bounded reconnect
/// count and fixed reconnect delay. Connection-state transitions are logged
/// through the event callback.
///
/// # Errors
///
/// Returns `async_nats::ConnectError` if the initial connection fails.
pub async fn connect_nats(
    client_name: &str,
    config: &rxline_config::NatsConfig,
) -> Result<async_nats::Client, async_nats::ConnectError> {
    let reconnect_wait = Duration::from_secs(config.reconnect_wait_seconds);

    let client = async_nats::ConnectOptions::new()
        .name(client_name)
        .connection_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .max_reconnects(config.max_reconnects)
        .reconnect_delay_callback(move |_attempts| reconnect_wait)
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Connected => info!("nats connected"),
                async_nats::Event::Disconnected => warn!("nats disconnected"),
                other => debug!(event = %other, "nats event"),
            }
        })
        .connect(&config.url)
        .await?;

    info!(url = %config.url, "nats connection established");
    Ok(client)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::new("test", 3, 30);
        assert!(!cb.is_open());
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_circuit_breaker_opens_at_threshold() {
        let cb = CircuitBreaker::new("test", 3, 30);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open(), "still closed at 2 failures");
        cb.record_failure();
        assert!(cb.is_open(), "open at 3 failures");
        assert!(cb.check().is_err());
    }

    #[test]
    fn test_circuit_breaker_success_resets() {
        let cb = CircuitBreaker::new("test", 2, 30);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_open());
        cb.record_success();
        assert!(!cb.is_open());
    }

    #[test]
    fn test_circuit_breaker_half_open_allows_probe() {
        let cb = CircuitBreaker::new("test", 1, 0); // 0-second recovery window
        cb.record_failure();
        assert!(!cb.is_open(), "probe allowed once the window elapses");
    }

    #[test]
    fn test_circuit_breaker_check_names_the_breaker() {
        let cb = CircuitBreaker::new("provider", 1, 9999);
        cb.record_failure();
        assert_eq!(cb.check().unwrap_err(), "provider");
    }
}
