/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Worker-side job consumption. One subscription per job subject, opened at
//! process start; every received job runs through the fallback chain in its
//! own task so a slow job never blocks receipt of the next one. A parse
//! failure or handler error is logged and never terminates the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rxline_analysis::job::StrategyKind;
use rxline_analysis::FallbackChain;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::transport::{Transport, TransportError, WireMessage};
use crate::wire::{self, JobKind, Subjects};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Log-only counters, reported once per [`STATS_INTERVAL`].
#[derive(Default)]
pub struct ConsumerCounters {
    jobs_received: AtomicU64,
    replies_published: AtomicU64,
    degraded_results: AtomicU64,
}

impl ConsumerCounters {
    #[must_use]
    pub fn jobs_received(&self) -> u64 {
        self.jobs_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn replies_published(&self) -> u64 {
        self.replies_published.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn degraded_results(&self) -> u64 {
        self.degraded_results.load(Ordering::Relaxed)
    }

    fn log(&self, subject: &str) {
        info!(
            subject = %subject,
            jobs_received = self.jobs_received(),
            replies_published = self.replies_published(),
            degraded_results = self.degraded_results(),
            "consumer counters"
        );
    }
}

pub struct JobConsumer {
    transport: Arc<dyn Transport>,
    chain: Arc<FallbackChain>,
    subjects: Subjects,
    counters: Arc<ConsumerCounters>,
}

impl JobConsumer {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        chain: Arc<FallbackChain>,
        subjects: Subjects,
    ) -> Self {
        Self {
            transport,
            chain,
            subjects,
            counters: Arc::new(ConsumerCounters::default()),
        }
    }

    #[must_use]
    pub fn counters(&self) -> Arc<ConsumerCounters> {
        Arc::clone(&self.counters)
    }

    /// Subscribe to the submission subject for `kind` and consume jobs
    /// until the stream ends or shutdown is signalled.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] only if the initial subscribe fails;
    /// failures while handling individual jobs are logged and absorbed.
    pub async fn run_subscription(
        &self,
        kind: JobKind,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let subject = self.subjects.submit(kind);
        info!(subject = %subject, "subscribing to job subject");

        let mut subscription = self.transport.subscribe(&subject).await?;
        let mut stats_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + STATS_INTERVAL,
            STATS_INTERVAL,
        );

        loop {
            tokio::select! {
                msg = subscription.next() => {
                    match msg {
                        Some(msg) => self.handle_message(kind, msg),
                        None => {
                            warn!(subject = %subject, "job subscription stream ended");
                            break;
                        }
                    }
                }
                _ = stats_tick.tick() => {
                    self.counters.log(&subject);
                }
                _ = shutdown.changed() => {
                    info!(subject = %subject, "shutdown signal, stopping job subscription");
                    break;
                }
            }
        }

        if let Err(e) = subscription.unsubscribe().await {
            warn!(subject = %subject, error = %e, "failed to unsubscribe job subject");
        }
        Ok(())
    }

    /// Parse one received message and hand it to a fresh task. The reply
    /// goes to the message's reply-to, or to the fixed response subject for
    /// `kind` when none was supplied.
    fn handle_message(&self, kind: JobKind, msg: WireMessage) {
        self.counters.jobs_received.fetch_add(1, Ordering::Relaxed);

        let job = match wire::decode_request(kind, &msg.payload, msg.reply_to.as_deref()) {
            Ok(job) => job,
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "failed to parse job payload");
                return;
            }
        };

        let reply_subject = msg
            .reply_to
            .unwrap_or_else(|| self.subjects.response(kind));
        let transport = Arc::clone(&self.transport);
        let chain = Arc::clone(&self.chain);
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            info!(job_id = %job.id, "processing job");
            let result = chain.run(&job).await;
            if result.strategy == StrategyKind::None {
                counters.degraded_results.fetch_add(1, Ordering::Relaxed);
            }

            let payload = match wire::encode_reply(kind, &result) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to encode reply");
                    return;
                }
            };

            match transport.publish(&reply_subject, payload).await {
                Ok(()) => {
                    counters.replies_published.fetch_add(1, Ordering::Relaxed);
                    info!(
                        job_id = %job.id,
                        subject = %reply_subject,
                        strategy = %result.strategy,
                        "reply published"
                    );
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to publish reply");
                }
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
