/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Job and result data model. A job is immutable once dispatched; exactly
//! one result is produced for it on the consumer side.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::prompts;

/// Reference to an uploaded prescription image. `bytes` is populated once
/// the multimodal strategy has downloaded the image, so a retry within the
/// same job does not fetch it twice.
#[derive(Clone, Debug)]
pub struct ImageRef {
    pub url: String,
    pub bytes: Option<Vec<u8>>,
}

/// What one analysis job carries.
#[derive(Clone, Debug)]
pub enum JobPayload {
    /// Free-text completion: a single user prompt, no pharmacology framing.
    Completion { prompt: String },
    /// Prescription text to analyze under the pharmacology system prompt.
    PrescriptionText { text: String },
    /// Prescription image to analyze; resolved to a fetchable URL already.
    PrescriptionImage { image: ImageRef },
}

/// One unit of analysis work, immutable once dispatched.
#[derive(Clone, Debug)]
pub struct AnalysisJob {
    pub id: String,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
}

impl AnalysisJob {
    #[must_use]
    pub fn completion(prompt: &str) -> Self {
        Self::with_payload(JobPayload::Completion {
            prompt: prompt.to_string(),
        })
    }

    #[must_use]
    pub fn prescription_text(text: &str) -> Self {
        Self::with_payload(JobPayload::PrescriptionText {
            text: text.to_string(),
        })
    }

    #[must_use]
    pub fn prescription_image(url: &str) -> Self {
        Self::with_payload(JobPayload::PrescriptionImage {
            image: ImageRef {
                url: url.to_string(),
                bytes: None,
            },
        })
    }

    fn with_payload(payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Reuse a transport-level correlation id (e.g. the reply subject) as
    /// the job id so worker logs line up with broker logs.
    #[must_use]
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// The fixed degraded-service text for this job's kind.
    #[must_use]
    pub fn degraded_text(&self) -> &'static str {
        match self.payload {
            JobPayload::Completion { .. } => prompts::DEGRADED_COMPLETION,
            JobPayload::PrescriptionText { .. } => prompts::DEGRADED_PRESCRIPTION,
            JobPayload::PrescriptionImage { .. } => prompts::DEGRADED_IMAGE,
        }
    }
}

/// Which fallback tier produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Multimodal,
    TextDescription,
    DirectHttp,
    /// Every tier exhausted; the result carries the degraded message.
    None,
}

impl StrategyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Multimodal => "multimodal",
            Self::TextDescription => "text-description",
            Self::DirectHttp => "direct-http",
            Self::None => "none",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "multimodal" => Some(Self::Multimodal),
            "text-description" => Some(Self::TextDescription),
            "direct-http" => Some(Self::DirectHttp),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    Error,
}

impl ResultStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// The single outcome of one job.
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub status: ResultStatus,
    pub text: String,
    pub strategy: StrategyKind,
    /// Character count at production time, recorded for truncation auditing
    /// when the text is later persisted.
    pub length: usize,
}

impl AnalysisResult {
    #[must_use]
    pub fn success(text: String, strategy: StrategyKind) -> Self {
        let length = text.chars().count();
        Self {
            status: ResultStatus::Success,
            text,
            strategy,
            length,
        }
    }

    /// The degraded result for an exhausted job: visible text, error status,
    /// no producing strategy.
    #[must_use]
    pub fn degraded(job: &AnalysisJob) -> Self {
        let text = job.degraded_text().to_string();
        let length = text.chars().count();
        Self {
            status: ResultStatus::Error,
            text,
            strategy: StrategyKind::None,
            length,
        }
    }
}
