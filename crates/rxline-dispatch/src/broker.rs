/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Request/reply correlation for synchronous callers, and the in-process
//! background path for fire-and-forget jobs.
//!
//! One synchronous call owns exactly one reply subject for its lifetime:
//! subscribe, publish with reply-to, wait for a single reply, unsubscribe on
//! every exit. A reply arriving after the wait expired finds no
//! subscription and is dropped — at most one result ever reaches the
//! caller, and no cancellation message is sent upstream.

use std::sync::Arc;
use std::time::Duration;

use rxline_analysis::job::{AnalysisJob, AnalysisResult};
use rxline_analysis::FallbackChain;
use rxline_store::{ChatStore, NewMessage};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::transport::{Transport, TransportError};
use crate::wire;

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// No reply within the caller's wait budget. The worker may still
    /// finish the job; its late reply is dropped.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("reply decoding failed: {0}")]
    Decode(String),
    /// Image jobs never cross the bus; use `dispatch_async`.
    #[error("image jobs are processed in-process, not over the bus")]
    ImageJob,
}

pub struct DispatchBroker {
    transport: Arc<dyn Transport>,
    chain: Arc<FallbackChain>,
    chats: Arc<dyn ChatStore>,
    subjects: wire::Subjects,
}

impl DispatchBroker {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        chain: Arc<FallbackChain>,
        chats: Arc<dyn ChatStore>,
        subjects: wire::Subjects,
    ) -> Self {
        Self {
            transport,
            chain,
            chats,
            subjects,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Publish `job` and block for its single reply, up to `wait`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Timeout`] when no reply arrives in time,
    /// [`DispatchError::Transport`] when the bus rejects the subscribe or
    /// publish, [`DispatchError::ImageJob`] for jobs that cannot cross the
    /// bus.
    pub async fn dispatch_sync(
        &self,
        job: AnalysisJob,
        wait: Duration,
    ) -> Result<AnalysisResult, DispatchError> {
        let kind = wire::job_kind(&job).ok_or(DispatchError::ImageJob)?;
        let payload = wire::encode_request(&job)?;

        let reply_subject = self.transport.new_reply_subject();
        let job = job.with_id(&reply_subject);
        let mut subscription = self.transport.subscribe(&reply_subject).await?;

        info!(
            job_id = %job.id,
            subject = %self.subjects.submit(kind),
            wait_secs = wait.as_secs(),
            "dispatching job"
        );

        if let Err(e) = self
            .transport
            .publish_with_reply(&self.subjects.submit(kind), &reply_subject, payload)
            .await
        {
            let _ = subscription.unsubscribe().await;
            return Err(e.into());
        }

        let outcome = subscription.next_message(wait).await;
        if let Err(e) = subscription.unsubscribe().await {
            warn!(job_id = %job.id, error = %e, "failed to unsubscribe reply subject");
        }

        match outcome {
            Ok(msg) => {
                let result = wire::decode_reply(kind, &msg.payload)
                    .map_err(|e| DispatchError::Decode(e.to_string()))?;
                info!(
                    job_id = %job.id,
                    strategy = %result.strategy,
                    length = result.length,
                    "reply received"
                );
                Ok(result)
            }
            Err(TransportError::Timeout) => {
                warn!(job_id = %job.id, wait_secs = wait.as_secs(), "no reply within wait budget");
                Err(DispatchError::Timeout(wait))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run `job` through the fallback chain in-process and hand the result
    /// straight back. The synchronous fallback for a disconnected bus.
    pub async fn run_inline(&self, job: &AnalysisJob) -> AnalysisResult {
        info!(job_id = %job.id, "running analysis in-process");
        self.chain.run(job).await
    }

    /// Run `job` through the fallback chain in a background task and append
    /// the result to `chat_id` — exactly once, degraded message included.
    /// The caller is not blocked and receives no synchronous result.
    pub fn dispatch_async(&self, job: AnalysisJob, chat_id: i64) {
        let chain = Arc::clone(&self.chain);
        let chats = Arc::clone(&self.chats);
        tokio::spawn(async move {
            info!(job_id = %job.id, chat_id, "running analysis in background");
            let result = chain.run(&job).await;
            persist_result(chats.as_ref(), chat_id, &result).await;
        });
    }
}

/// Append one finished result to the chat as an assistant message, with the
/// produced length in metadata, then verify the stored length against it.
pub async fn persist_result(chats: &dyn ChatStore, chat_id: i64, result: &AnalysisResult) {
    let message = NewMessage {
        chat_id,
        role: "assistant".to_string(),
        content: result.text.clone(),
        content_type: "text".to_string(),
        metadata: json!({
            "length": result.length,
            "strategy": result.strategy.as_str(),
        }),
    };

    match chats.append_message(message).await {
        Ok(saved) => {
            let saved_length = saved.content.chars().count();
            if saved_length == result.length {
                debug!(chat_id, length = result.length, "analysis message persisted");
            } else {
                warn!(
                    chat_id,
                    produced = result.length,
                    saved = saved_length,
                    "persisted analysis length mismatch, content may be truncated"
                );
            }
        }
        Err(e) => {
            error!(chat_id, error = %e, "failed to persist analysis result");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::consumer::JobConsumer;
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use rxline_analysis::job::{ResultStatus, StrategyKind};
    use rxline_analysis::provider::ProviderClient;
    use rxline_analysis::{Strategy, StrategyContext, StrategyError};
    use rxline_store::MemoryChatStore;
    use rxline_runtime::CircuitBreaker;
    use tokio::sync::watch;

    fn test_ctx() -> StrategyContext {
        let provider_config = rxline_config::ProviderConfig {
            base_url: "https://provider.test/v1".to_string(),
            api_key: "sk-test".to_string(),
            model: "test-model".to_string(),
            completion_max_tokens: 2000,
            analysis_max_tokens: 8000,
            temperature: 0.7,
        };
        StrategyContext {
            provider: Arc::new(ProviderClient::new(
                reqwest::Client::new(),
                &provider_config,
                Arc::new(CircuitBreaker::new("provider", 5, 30)),
            )),
            http: reqwest::Client::new(),
            budgets: rxline_analysis::chain::Budgets {
                text_timeout: Duration::from_secs(30),
                vision_timeout: Duration::from_secs(45),
                download_timeout: Duration::from_secs(20),
                completion_max_tokens: 2000,
                analysis_max_tokens: 8000,
            },
        }
    }

    /// Strategy that answers every job with a fixed text.
    struct Fixed(&'static str);

    #[async_trait]
    impl Strategy for Fixed {
        fn kind(&self) -> StrategyKind {
            StrategyKind::TextDescription
        }

        async fn attempt(
            &self,
            _job: &AnalysisJob,
            _ctx: &StrategyContext,
        ) -> Result<String, StrategyError> {
            Ok(self.0.to_string())
        }
    }

    /// Strategy that always fails.
    struct Failing;

    #[async_trait]
    impl Strategy for Failing {
        fn kind(&self) -> StrategyKind {
            StrategyKind::Multimodal
        }

        async fn attempt(
            &self,
            _job: &AnalysisJob,
            _ctx: &StrategyContext,
        ) -> Result<String, StrategyError> {
            Err(StrategyError::Provider(
                rxline_analysis::ProviderError::Request("down".to_string()),
            ))
        }
    }

    fn fixed_chain(text: &'static str) -> Arc<FallbackChain> {
        Arc::new(FallbackChain::with_strategies(
            test_ctx(),
            vec![Box::new(Fixed(text))],
        ))
    }

    fn broker_with_consumer(
        chain: Arc<FallbackChain>,
    ) -> (DispatchBroker, watch::Sender<bool>, Arc<MemoryChatStore>) {
        let transport = Arc::new(MemoryTransport::new());
        let chats = Arc::new(MemoryChatStore::new());
        let subjects = wire::Subjects::new("rxline");

        let consumer = JobConsumer::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&chain),
            subjects.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn({
            let rx = shutdown_rx.clone();
            async move {
                let _ = consumer.run_subscription(wire::JobKind::Prescription, rx).await;
            }
        });

        let broker = DispatchBroker::new(
            transport,
            chain,
            Arc::clone(&chats) as Arc<dyn ChatStore>,
            subjects,
        );
        (broker, shutdown_tx, chats)
    }

    #[tokio::test]
    async fn test_dispatch_sync_returns_consumer_reply() {
        let (broker, shutdown, _) = broker_with_consumer(fixed_chain("تحلیل نسخه کامل شد."));

        // Give the consumer task a chance to subscribe before publishing.
        tokio::task::yield_now().await;

        let result = broker
            .dispatch_sync(
                AnalysisJob::prescription_text("نسخه: آموکسی‌سیلین"),
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.text, "تحلیل نسخه کامل شد.");
        assert_eq!(result.strategy, StrategyKind::TextDescription);
        let _ = shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_sync_times_out_without_consumer() {
        let transport = Arc::new(MemoryTransport::new());
        let broker = DispatchBroker::new(
            transport,
            fixed_chain("unused"),
            Arc::new(MemoryChatStore::new()),
            wire::Subjects::new("rxline"),
        );

        let started = tokio::time::Instant::now();
        let err = broker
            .dispatch_sync(
                AnalysisJob::prescription_text("نسخه: ..."),
                Duration::from_secs(30),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_dispatch_sync_rejects_image_jobs() {
        let transport = Arc::new(MemoryTransport::new());
        let broker = DispatchBroker::new(
            transport,
            fixed_chain("unused"),
            Arc::new(MemoryChatStore::new()),
            wire::Subjects::new("rxline"),
        );

        let err = broker
            .dispatch_sync(
                AnalysisJob::prescription_image("https://img.test/rx.jpg"),
                Duration::from_secs(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ImageJob));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_dropped_not_delivered() {
        let transport = Arc::new(MemoryTransport::new());
        let subjects = wire::Subjects::new("rxline");

        // Hand-rolled consumer that replies well after the caller gave up.
        {
            let transport = MemoryTransport::clone(&transport);
            let subjects = subjects.clone();
            tokio::spawn(async move {
                let mut sub = transport
                    .subscribe(&subjects.submit(wire::JobKind::Prescription))
                    .await
                    .unwrap();
                if let Some(msg) = sub.next().await {
                    tokio::time::sleep(Duration::from_secs(120)).await;
                    let result = AnalysisResult::success(
                        "late analysis".to_string(),
                        StrategyKind::TextDescription,
                    );
                    let payload = wire::encode_reply(wire::JobKind::Prescription, &result).unwrap();
                    let reply_to = msg.reply_to.unwrap();
                    // Nobody is subscribed any more; the publish succeeds
                    // and the message evaporates.
                    transport.publish(&reply_to, payload).await.unwrap();
                }
            });
        }

        let broker = DispatchBroker::new(
            Arc::new(MemoryTransport::clone(&transport)),
            fixed_chain("unused"),
            Arc::new(MemoryChatStore::new()),
            subjects,
        );

        tokio::task::yield_now().await;
        let err = broker
            .dispatch_sync(
                AnalysisJob::prescription_text("نسخه: ..."),
                Duration::from_secs(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));

        // Let the late reply fire; nothing to assert beyond "no panic, no
        // delivery" — the subscription is gone.
        tokio::time::sleep(Duration::from_secs(150)).await;
    }

    #[tokio::test]
    async fn test_dispatch_async_persists_exactly_one_message() {
        let transport = Arc::new(MemoryTransport::new());
        let chats = Arc::new(MemoryChatStore::new());
        let broker = DispatchBroker::new(
            transport,
            fixed_chain("با سلام همکار گرامی، تحلیل انجام شد."),
            Arc::clone(&chats) as Arc<dyn ChatStore>,
            wire::Subjects::new("rxline"),
        );

        broker.dispatch_async(AnalysisJob::prescription_image("https://img.test/rx.jpg"), 42);

        // The background task owns persistence; wait for it to land.
        for _ in 0..100 {
            if !chats.messages_for(42).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let messages = chats.messages_for(42).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "assistant");
        assert_eq!(messages[0].content, "با سلام همکار گرامی، تحلیل انجام شد.");
        assert_eq!(messages[0].metadata["strategy"], "text-description");
    }

    #[tokio::test]
    async fn test_dispatch_async_persists_degraded_message_on_exhaustion() {
        let chain = Arc::new(FallbackChain::with_strategies(
            test_ctx(),
            vec![Box::new(Failing)],
        ));
        let chats = Arc::new(MemoryChatStore::new());
        let broker = DispatchBroker::new(
            Arc::new(MemoryTransport::new()),
            chain,
            Arc::clone(&chats) as Arc<dyn ChatStore>,
            wire::Subjects::new("rxline"),
        );

        let job = AnalysisJob::prescription_image("https://img.test/rx.jpg");
        let degraded = job.degraded_text();
        broker.dispatch_async(job, 7);

        for _ in 0..100 {
            if !chats.messages_for(7).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let messages = chats.messages_for(7).unwrap();
        assert_eq!(messages.len(), 1, "exactly one message per job");
        assert_eq!(messages[0].content, degraded);
        assert_eq!(messages[0].metadata["strategy"], "none");
    }
}
