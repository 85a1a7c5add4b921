/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! External-collaborator interfaces consumed by the analysis pipeline.
//!
//! The pipeline only ever appends assistant messages to a chat and resolves
//! an uploaded object key to a fetchable URL, so that is all these traits
//! expose. Each trait ships one thin real implementation and one in-memory
//! implementation for tests.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("object not resolvable: {0}")]
    Object(String),
    #[error("poisoned lock")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Chat store
// ---------------------------------------------------------------------------

/// A message to append to a chat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_id: i64,
    pub role: String,
    pub content: String,
    pub content_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A persisted chat message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub role: String,
    pub content: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Conversation-history collaborator. The pipeline appends exactly one
/// assistant message per finished job.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Append a message and return the persisted row.
    async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError>;
}

/// Postgres-backed chat store.
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
        let row = sqlx::query(
            "INSERT INTO messages (chat_id, role, content, content_type, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             RETURNING id, chat_id, role, content, content_type, metadata, created_at",
        )
        .bind(msg.chat_id)
        .bind(&msg.role)
        .bind(&msg.content)
        .bind(&msg.content_type)
        .bind(&msg.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(Message {
            id: row.try_get("id")?,
            chat_id: row.try_get("chat_id")?,
            role: row.try_get("role")?,
            content: row.try_get("content")?,
            content_type: row.try_get("content_type")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// In-memory chat store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryChatStore {
    next_id: AtomicI64,
    messages: Mutex<Vec<Message>>,
}

impl MemoryChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all messages appended to `chat_id`, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if the inner lock is poisoned.
    pub fn messages_for(&self, chat_id: i64) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stored = Message {
            id,
            chat_id: msg.chat_id,
            role: msg.role,
            content: msg.content,
            content_type: msg.content_type,
            metadata: msg.metadata,
            created_at: Utc::now(),
        };
        let mut messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        messages.push(stored.clone());
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

/// Object-storage collaborator: resolves a previously uploaded object key to
/// a URL the image downloader can fetch within `ttl`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn temporary_url(&self, object_key: &str, ttl: Duration) -> Result<String, StoreError>;
}

/// Resolves object keys against a public bucket base URL. The TTL is
/// irrelevant for public buckets and is ignored. With no base URL
/// configured, every key is rejected at resolution time.
pub struct PublicUrlObjectStore {
    base_url: String,
}

impl PublicUrlObjectStore {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for PublicUrlObjectStore {
    async fn temporary_url(&self, object_key: &str, _ttl: Duration) -> Result<String, StoreError> {
        if self.base_url.is_empty() {
            return Err(StoreError::Object(
                "storage.public_base_url is not configured".to_string(),
            ));
        }
        if object_key.is_empty() {
            return Err(StoreError::Object("empty object key".to_string()));
        }
        Ok(format!(
            "{}/{}",
            self.base_url,
            object_key.trim_start_matches('/')
        ))
    }
}

/// In-memory object store mapping keys to fixed URLs.
#[derive(Default)]
pub struct MemoryObjectStore {
    urls: Mutex<HashMap<String, String>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] if the inner lock is poisoned.
    pub fn insert(&self, object_key: &str, url: &str) -> Result<(), StoreError> {
        let mut urls = self.urls.lock().map_err(|_| StoreError::Poisoned)?;
        urls.insert(object_key.to_string(), url.to_string());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn temporary_url(&self, object_key: &str, _ttl: Duration) -> Result<String, StoreError> {
        let urls = self.urls.lock().map_err(|_| StoreError::Poisoned)?;
        urls.get(object_key)
            .cloned()
            .ok_or_else(|| StoreError::Object(format!("unknown object key: {object_key}")))
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
    async fn test_memory_chat_store_appends_in_order() {
        let store = MemoryChatStore::new();

        let first = store
            .append_message(NewMessage {
                chat_id: 7,
                role: "user".to_string(),
                content: "نسخه: آموکسی‌سیلین ۵۰۰".to_string(),
                content_type: "text".to_string(),
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap();
        let second = store
            .append_message(NewMessage {
                chat_id: 7,
                role: "assistant".to_string(),
                content: "تحلیل نسخه".to_string(),
                content_type: "text".to_string(),
                metadata: serde_json::json!({"length": 10}),
            })
            .await
            .unwrap();

        assert!(second.id > first.id);
        let messages = store.messages_for(7).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].metadata["length"], 10);
    }

    #[tokio::test]
    async fn test_memory_chat_store_filters_by_chat() {
        let store = MemoryChatStore::new();
        for chat_id in [1, 2, 1] {
            store
                .append_message(NewMessage {
                    chat_id,
                    role: "user".to_string(),
                    content: "hi".to_string(),
                    content_type: "text".to_string(),
                    metadata: serde_json::Value::Null,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.messages_for(1).unwrap().len(), 2);
        assert_eq!(store.messages_for(2).unwrap().len(), 1);
        assert!(store.messages_for(3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_public_url_store_joins_key() {
        let store = PublicUrlObjectStore::new("https://images.rxline.ir/uploads/");
        let url = store
            .temporary_url("chats/9/rx.jpg", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(url, "https://images.rxline.ir/uploads/chats/9/rx.jpg");
    }

    #[tokio::test]
    async fn test_public_url_store_without_base_rejects_keys() {
        let store = PublicUrlObjectStore::new("");
        assert!(store
            .temporary_url("chats/9/rx.jpg", Duration::from_secs(3600))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_object_store_resolves_known_keys_only() {
        let store = MemoryObjectStore::new();
        store.insert("k1", "http://example.test/rx.png").unwrap();

        let url = store
            .temporary_url("k1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(url, "http://example.test/rx.png");
        assert!(store
            .temporary_url("missing", Duration::from_secs(60))
            .await
            .is_err());
    }
}
