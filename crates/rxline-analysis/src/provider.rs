/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Client for the external completion provider.
//!
//! The provider speaks the OpenAI-compatible chat-completions shape over
//! HTTPS; generated text is read from `choices[0].message.content`. The
//! client exposes a typed path ([`complete_text`](ProviderClient::complete_text),
//! [`complete_vision`](ProviderClient::complete_vision)) and a raw path
//! ([`complete_raw`](ProviderClient::complete_raw)) that posts a caller-built
//! JSON body and parses the response by hand; both present the same
//! contract upward. A circuit breaker guards the endpoint so an outage fails
//! tiers fast instead of consuming their full timeout budget.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rxline_runtime::CircuitBreaker;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    /// The call exceeded its timeout budget. Kept distinct from other
    /// failures so callers can tell a slow provider from a broken one.
    #[error("provider call timed out")]
    Timeout,
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider response malformed: {0}")]
    Malformed(String),
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("circuit open: {0}")]
    CircuitOpen(String),
}

// ---------------------------------------------------------------------------
// Chat-completions wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
pub struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

impl ChatMessage {
    #[must_use]
    pub fn system(text: &str) -> Self {
        Self {
            role: "system",
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[must_use]
    pub fn user(text: &str) -> Self {
        Self {
            role: "user",
            content: MessageContent::Text(text.to_string()),
        }
    }

    /// User message pairing `text` with an inline base64 image.
    #[must_use]
    pub fn user_with_image(text: &str, data_uri: String) -> Self {
        Self {
            role: "user",
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: text.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_uri },
                },
            ]),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    breaker: Arc<CircuitBreaker>,
}

impl ProviderClient {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        config: &rxline_config::ProviderConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            breaker,
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    #[must_use]
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Text-only completion. `system` is optional; plain completions send
    /// the user prompt alone.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on timeout, non-2xx status, transport
    /// failure, malformed response body, or an open circuit.
    pub async fn complete_text(
        &self,
        system: Option<&str>,
        user: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(user));
        self.send_chat(messages, max_tokens, timeout).await
    }

    /// Multimodal completion: the image travels inline as a base64 data URI.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on timeout, non-2xx status, transport
    /// failure, malformed response body, or an open circuit.
    pub async fn complete_vision(
        &self,
        system: &str,
        user_text: &str,
        image_bytes: &[u8],
        mime_type: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let data_uri = format!("data:{};base64,{}", mime_type, BASE64.encode(image_bytes));
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user_with_image(user_text, data_uri),
        ];
        self.send_chat(messages, max_tokens, timeout).await
    }

    /// Raw path: post a caller-built JSON body to the completions endpoint
    /// and pull `choices[0].message.content` out of the untyped response.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on timeout, non-2xx status, transport
    /// failure, a response without extractable content, or an open circuit.
    pub async fn complete_raw(
        &self,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        self.breaker.check().map_err(ProviderError::CircuitOpen)?;

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.record_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            self.breaker.record_failure();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: snippet(&body, 300).to_string(),
            });
        }

        let value: serde_json::Value = response.json().await.map_err(|e| {
            self.breaker.record_failure();
            ProviderError::Malformed(e.to_string())
        })?;

        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(serde_json::Value::as_str);

        match content {
            Some(text) => {
                self.breaker.record_success();
                Ok(text.to_string())
            }
            None => {
                self.breaker.record_failure();
                Err(ProviderError::Malformed(
                    "no choices[0].message.content in response".to_string(),
                ))
            }
        }
    }

    async fn send_chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        self.breaker.check().map_err(ProviderError::CircuitOpen)?;

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens,
            temperature: self.temperature,
        };

        debug!(model = %self.model, max_tokens, "sending chat completion");

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.record_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            self.breaker.record_failure();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: snippet(&body, 300).to_string(),
            });
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            self.breaker.record_failure();
            ProviderError::Malformed(e.to_string())
        })?;

        self.breaker.record_success();

        // An empty choices list is not a protocol error; the caller decides
        // what empty text means.
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    fn record_send_error(&self, e: &reqwest::Error) -> ProviderError {
        self.breaker.record_failure();
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Request(e.to_string())
        }
    }
}

/// First `max` chars of `s`, for keeping provider error bodies loggable.
#[must_use]
pub fn snippet(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_serializes_as_plain_string() {
        let msg = ChatMessage::user("سلام، حالت چطوره؟");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "سلام، حالت چطوره؟");
    }

    #[test]
    fn test_vision_message_serializes_as_part_list() {
        let msg = ChatMessage::user_with_image(
            "لطفا این نسخه تصویری را تحلیل کنید:",
            "data:image/jpeg;base64,/9j/4A==".to_string(),
        );
        let json = serde_json::to_value(&msg).unwrap();

        let parts = json["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/jpeg;base64,/9j/4A=="
        );
    }

    #[test]
    fn test_request_carries_model_and_budget() {
        let request = ChatCompletionRequest {
            model: "gemini-2.0-flash-thinking-exp-01-21",
            messages: vec![ChatMessage::user("hi")],
            max_tokens: 2000,
            temperature: 0.7,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gemini-2.0-flash-thinking-exp-01-21");
        assert_eq!(json["max_tokens"], 2000);
    }

    #[test]
    fn test_response_parses_content() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"با سلام همکار گرامی."}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap();
        assert_eq!(text, "با سلام همکار گرامی.");
    }

    #[test]
    fn test_response_tolerates_missing_choices() {
        let parsed: ChatCompletionResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.choices.is_empty());
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        let s = "عوارض شایع و مهم";
        let cut = snippet(s, 6);
        assert_eq!(cut.chars().count(), 6);
        assert!(s.starts_with(cut));
        assert_eq!(snippet("short", 300), "short");
    }
}
