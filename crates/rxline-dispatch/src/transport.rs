/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Message-bus abstraction: publish with reply-to, blocking receive with a
//! deadline, and fresh reply subjects. [`NatsTransport`] is the production
//! implementation; [`MemoryTransport`] routes messages in-process for tests
//! and single-binary deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    /// No message arrived within the deadline passed to
    /// [`Subscription::next_message`].
    #[error("no message within the deadline")]
    Timeout,
    #[error("subscription closed")]
    Closed,
}

/// A message as seen above the transport: subject, optional reply address,
/// opaque payload bytes.
#[derive(Clone, Debug)]
pub struct WireMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// A live subscription. Callers must `unsubscribe` on every exit path;
/// dropping releases local resources but may leave the bus-side interest
/// lingering until the connection notices.
#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` when the subscription ends.
    async fn next(&mut self) -> Option<WireMessage>;

    /// Next message within `deadline`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] when the deadline elapses first,
    /// [`TransportError::Closed`] when the subscription ends.
    async fn next_message(&mut self, deadline: Duration) -> Result<WireMessage, TransportError>;

    /// Tear the subscription down.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the bus rejects the teardown.
    async fn unsubscribe(&mut self) -> Result<(), TransportError>;
}

/// Shared bus handle, safe for concurrent publish/subscribe from any task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// A fresh, unpredictable subject, unique for the connection lifetime.
    fn new_reply_subject(&self) -> String;

    /// Current connection state; callers use this to pick the in-process
    /// fallback path when the bus is down.
    fn is_connected(&self) -> bool;

    /// Fire-and-forget send.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Send carrying a reply-to address for request/reply correlation.
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, TransportError>;
}

// ---------------------------------------------------------------------------
// NATS transport
// ---------------------------------------------------------------------------

pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    /// Connect with the configured timeout, bounded reconnects and fixed
    /// reconnect delay.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the initial connection
    /// cannot be established.
    pub async fn connect(
        client_name: &str,
        config: &rxline_config::NatsConfig,
    ) -> Result<Self, TransportError> {
        let client = rxline_runtime::connect_nats(client_name, config)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn new_reply_subject(&self) -> String {
        self.client.new_inbox()
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.client
            .publish_with_reply(subject.to_string(), reply_to.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, TransportError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        Ok(Box::new(NatsSubscription { inner: subscriber }))
    }
}

struct NatsSubscription {
    inner: async_nats::Subscriber,
}

fn convert(msg: async_nats::Message) -> WireMessage {
    WireMessage {
        subject: msg.subject.to_string(),
        reply_to: msg.reply.map(|s| s.to_string()),
        payload: msg.payload.to_vec(),
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<WireMessage> {
        self.inner.next().await.map(convert)
    }

    async fn next_message(&mut self, deadline: Duration) -> Result<WireMessage, TransportError> {
        match tokio::time::timeout(deadline, self.inner.next()).await {
            Ok(Some(msg)) => Ok(convert(msg)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        self.inner
            .unsubscribe()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// Exact-subject in-process router. No wildcard support; the dispatch
/// subjects never need it.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    connected: AtomicBool,
    next_subscriber_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<WireMessage>)>>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                connected: AtomicBool::new(true),
                next_subscriber_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Flip the simulated connection state; a disconnected transport fails
    /// every publish/subscribe so callers exercise their fallback paths.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Relaxed);
    }

    fn route(&self, subject: &str, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Publish("transport disconnected".to_string()));
        }
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .map_err(|_| TransportError::Publish("router lock poisoned".to_string()))?;
        if let Some(senders) = subscribers.get_mut(subject) {
            // Prune receivers that unsubscribed or were dropped. A message
            // with no remaining subscribers is silently dropped, matching
            // bus semantics for a reply nobody is waiting on.
            senders.retain(|(_, sender)| sender.send(message.clone()).is_ok());
        } else {
            debug!(subject = %subject, "no subscribers, message dropped");
        }
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn new_reply_subject(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.route(
            subject,
            WireMessage {
                subject: subject.to_string(),
                reply_to: None,
                payload,
            },
        )
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.route(
            subject,
            WireMessage {
                subject: subject.to_string(),
                reply_to: Some(reply_to.to_string()),
                payload,
            },
        )
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Subscribe(
                "transport disconnected".to_string(),
            ));
        }
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .map_err(|_| TransportError::Subscribe("router lock poisoned".to_string()))?;
            subscribers
                .entry(subject.to_string())
                .or_default()
                .push((id, tx));
        }
        Ok(Box::new(MemorySubscription {
            subject: subject.to_string(),
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemorySubscription {
    subject: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<WireMessage>,
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    async fn next_message(&mut self, deadline: Duration) -> Result<WireMessage, TransportError> {
        match tokio::time::timeout(deadline, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .map_err(|_| TransportError::Subscribe("router lock poisoned".to_string()))?;
        if let Some(senders) = subscribers.get_mut(&self.subject) {
            senders.retain(|(id, _)| *id != self.id);
        }
        self.rx.close();
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_publish_reaches_subscriber() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("jobs.test").await.unwrap();

        transport
            .publish("jobs.test", b"{\"prompt\":\"hi\"}".to_vec())
            .await
            .unwrap();

        let msg = sub.next_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.subject, "jobs.test");
        assert_eq!(msg.payload, b"{\"prompt\":\"hi\"}");
        assert!(msg.reply_to.is_none());
    }

    #[tokio::test]
    async fn test_memory_reply_to_travels_with_the_message() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("jobs.test").await.unwrap();

        transport
            .publish_with_reply("jobs.test", "_INBOX.abc", b"{}".to_vec())
            .await
            .unwrap();

        let msg = sub.next_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.reply_to.as_deref(), Some("_INBOX.abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_next_message_times_out() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("jobs.test").await.unwrap();

        let err = sub
            .next_message(Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_memory_unsubscribe_stops_delivery() {
        let transport = MemoryTransport::new();
        let mut sub = transport.subscribe("jobs.test").await.unwrap();
        sub.unsubscribe().await.unwrap();

        // Publishing to a subject with no live subscribers drops silently.
        transport
            .publish("jobs.test", b"late".to_vec())
            .await
            .unwrap();
        let err = sub
            .next_message(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_memory_disconnected_fails_publish_and_subscribe() {
        let transport = MemoryTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());
        assert!(transport.publish("jobs.test", Vec::new()).await.is_err());
        assert!(transport.subscribe("jobs.test").await.is_err());

        transport.set_connected(true);
        assert!(transport.subscribe("jobs.test").await.is_ok());
    }

    #[tokio::test]
    async fn test_reply_subjects_never_repeat() {
        let transport = MemoryTransport::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let subject = transport.new_reply_subject();
            assert!(subject.starts_with("_INBOX."));
            assert!(seen.insert(subject), "reply subject reused");
        }
    }
}
