/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! The prioritized fallback chain.
//!
//! Strategies run strictly in order, never concurrently; a later tier is
//! only attempted after an earlier one has conclusively failed. Empty or
//! whitespace-only output counts as failure, so the chain never produces a
//! successful result with an empty body. When every tier is exhausted the
//! job's fixed degraded message is returned with no producing strategy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::image::{fetch_image, sniff_mime, ImageFetchError};
use crate::job::{AnalysisJob, AnalysisResult, JobPayload, StrategyKind};
use crate::prompts;
use crate::provider::{snippet, ProviderClient, ProviderError};

/// Sentence-final characters, Latin and Persian (including the Persian
/// question mark and Arabic full stop). A result that ends on anything else
/// is probably truncated mid-sentence.
const SENTENCE_TERMINATORS: [char; 8] = ['.', '?', '!', '؟', '۔', '،', ':', '\n'];

#[derive(thiserror::Error, Debug)]
pub enum StrategyError {
    /// This tier cannot handle the job's payload shape; the chain advances
    /// exactly as it would on any other failure.
    #[error("strategy not applicable to this job")]
    NotApplicable,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Download(#[from] ImageFetchError),
}

// ---------------------------------------------------------------------------
// Timeout and token budgets
// ---------------------------------------------------------------------------

/// Per-tier budgets. The worst case for one job is the sum of the tier
/// timeouts, so synchronous callers must wait at least that long.
#[derive(Clone, Debug)]
pub struct Budgets {
    pub text_timeout: Duration,
    pub vision_timeout: Duration,
    pub download_timeout: Duration,
    pub completion_max_tokens: u32,
    pub analysis_max_tokens: u32,
}

impl Budgets {
    #[must_use]
    pub fn from_config(config: &rxline_config::Config) -> Self {
        Self {
            text_timeout: Duration::from_secs(config.analysis.text_timeout_seconds),
            vision_timeout: Duration::from_secs(config.analysis.vision_timeout_seconds),
            download_timeout: Duration::from_secs(config.analysis.download_timeout_seconds),
            completion_max_tokens: config.provider.completion_max_tokens,
            analysis_max_tokens: config.provider.analysis_max_tokens,
        }
    }
}

/// Everything a strategy needs to attempt a job. Strategies themselves stay
/// stateless; the chain owns ordering.
pub struct StrategyContext {
    pub provider: Arc<ProviderClient>,
    pub http: reqwest::Client,
    pub budgets: Budgets,
}

/// One named technique for obtaining a completion.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Attempt the job once. Returning text does not yet mean success: the
    /// chain still rejects empty bodies.
    async fn attempt(
        &self,
        job: &AnalysisJob,
        ctx: &StrategyContext,
    ) -> Result<String, StrategyError>;
}

// ---------------------------------------------------------------------------
// Tier 1: multimodal
// ---------------------------------------------------------------------------

/// Downloads the referenced image and sends it inline to the vision model.
pub struct MultimodalStrategy;

#[async_trait]
impl Strategy for MultimodalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Multimodal
    }

    async fn attempt(
        &self,
        job: &AnalysisJob,
        ctx: &StrategyContext,
    ) -> Result<String, StrategyError> {
        let JobPayload::PrescriptionImage { image } = &job.payload else {
            return Err(StrategyError::NotApplicable);
        };

        let (bytes, mime_type) = match &image.bytes {
            Some(bytes) => (bytes.clone(), sniff_mime(bytes).to_string()),
            None => {
                let downloaded =
                    fetch_image(&ctx.http, &image.url, ctx.budgets.download_timeout).await?;
                (downloaded.bytes, downloaded.mime_type)
            }
        };

        let text = ctx
            .provider
            .complete_vision(
                &prompts::vision_system_prompt(),
                prompts::VISION_USER_TEXT,
                &bytes,
                &mime_type,
                ctx.budgets.analysis_max_tokens,
                ctx.budgets.vision_timeout,
            )
            .await?;
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Tier 2: text description
// ---------------------------------------------------------------------------

/// Text-only prompt; image jobs embed their URL in the prompt body instead
/// of attaching bytes.
pub struct TextDescriptionStrategy;

#[async_trait]
impl Strategy for TextDescriptionStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TextDescription
    }

    async fn attempt(
        &self,
        job: &AnalysisJob,
        ctx: &StrategyContext,
    ) -> Result<String, StrategyError> {
        let budgets = &ctx.budgets;
        let text = match &job.payload {
            JobPayload::Completion { prompt } => {
                ctx.provider
                    .complete_text(
                        None,
                        prompt,
                        budgets.completion_max_tokens,
                        budgets.text_timeout,
                    )
                    .await?
            }
            JobPayload::PrescriptionText { text } => {
                ctx.provider
                    .complete_text(
                        Some(&prompts::prescription_system_prompt()),
                        text,
                        budgets.analysis_max_tokens,
                        budgets.text_timeout,
                    )
                    .await?
            }
            JobPayload::PrescriptionImage { image } => {
                ctx.provider
                    .complete_text(
                        None,
                        &prompts::image_url_prompt(&image.url),
                        budgets.analysis_max_tokens,
                        budgets.text_timeout,
                    )
                    .await?
            }
        };
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Tier 3: direct HTTP
// ---------------------------------------------------------------------------

/// Last resort: hand-built JSON body through the raw provider path, in case
/// the typed path itself is misconfigured.
pub struct DirectHttpStrategy;

#[async_trait]
impl Strategy for DirectHttpStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DirectHttp
    }

    async fn attempt(
        &self,
        job: &AnalysisJob,
        ctx: &StrategyContext,
    ) -> Result<String, StrategyError> {
        let budgets = &ctx.budgets;
        let model = ctx.provider.model();
        let temperature = ctx.provider.temperature();

        let (body, timeout) = match &job.payload {
            JobPayload::Completion { prompt } => (
                json!({
                    "model": model,
                    "messages": [{"role": "user", "content": prompt}],
                    "max_tokens": budgets.completion_max_tokens,
                    "temperature": temperature,
                }),
                budgets.text_timeout,
            ),
            JobPayload::PrescriptionText { text } => (
                json!({
                    "model": model,
                    "messages": [
                        {"role": "system", "content": prompts::prescription_system_prompt()},
                        {"role": "user", "content": text},
                    ],
                    "max_tokens": budgets.analysis_max_tokens,
                    "temperature": temperature,
                }),
                budgets.text_timeout,
            ),
            JobPayload::PrescriptionImage { image } => {
                let (bytes, mime_type) = match &image.bytes {
                    Some(bytes) => (bytes.clone(), sniff_mime(bytes).to_string()),
                    None => {
                        let downloaded =
                            fetch_image(&ctx.http, &image.url, budgets.download_timeout).await?;
                        (downloaded.bytes, downloaded.mime_type)
                    }
                };
                let data_uri = format!("data:{};base64,{}", mime_type, BASE64.encode(&bytes));
                (
                    json!({
                        "model": model,
                        "messages": [
                            {"role": "system", "content": prompts::vision_system_prompt()},
                            {"role": "user", "content": [
                                {"type": "text", "text": prompts::VISION_USER_TEXT},
                                {"type": "image_url", "image_url": {"url": data_uri}},
                            ]},
                        ],
                        "max_tokens": budgets.analysis_max_tokens,
                        "temperature": temperature,
                    }),
                    budgets.vision_timeout,
                )
            }
        };

        let text = ctx.provider.complete_raw(body, timeout).await?;
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// The chain
// ---------------------------------------------------------------------------

pub struct FallbackChain {
    ctx: StrategyContext,
    strategies: Vec<Box<dyn Strategy>>,
}

impl FallbackChain {
    /// The standard tier order: multimodal, text description, direct HTTP.
    #[must_use]
    pub fn new(ctx: StrategyContext) -> Self {
        Self::with_strategies(
            ctx,
            vec![
                Box::new(MultimodalStrategy),
                Box::new(TextDescriptionStrategy),
                Box::new(DirectHttpStrategy),
            ],
        )
    }

    /// Custom tier list, for tests and future reordering.
    #[must_use]
    pub fn with_strategies(ctx: StrategyContext, strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { ctx, strategies }
    }

    /// Run the job to exactly one result. Never fails: exhaustion produces
    /// the degraded result instead.
    pub async fn run(&self, job: &AnalysisJob) -> AnalysisResult {
        for strategy in &self.strategies {
            let kind = strategy.kind();
            match strategy.attempt(job, &self.ctx).await {
                Ok(text) if text.trim().is_empty() => {
                    warn!(
                        job_id = %job.id,
                        strategy = %kind,
                        "strategy returned empty text, advancing"
                    );
                }
                Ok(text) => {
                    if !ends_with_terminator(&text) {
                        // Advisory only; the text is returned as-is.
                        warn!(
                            job_id = %job.id,
                            strategy = %kind,
                            length = text.chars().count(),
                            "analysis text does not end with a sentence terminator, may be truncated"
                        );
                    }
                    info!(
                        job_id = %job.id,
                        strategy = %kind,
                        length = text.chars().count(),
                        "analysis produced"
                    );
                    return AnalysisResult::success(text, kind);
                }
                Err(StrategyError::NotApplicable) => {
                    debug!(job_id = %job.id, strategy = %kind, "strategy not applicable");
                }
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        strategy = %kind,
                        error = snippet(&e.to_string(), 200),
                        "strategy failed, advancing"
                    );
                }
            }
        }

        info!(job_id = %job.id, "all strategies exhausted, returning degraded result");
        AnalysisResult::degraded(job)
    }
}

/// `true` when the final character closes a sentence.
fn ends_with_terminator(text: &str) -> bool {
    text.chars()
        .last()
        .is_some_and(|c| SENTENCE_TERMINATORS.contains(&c))
}

// ===========================================================================
// Tests
// ===========================================================================
