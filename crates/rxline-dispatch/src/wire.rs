/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Bus wire contract: subjects and the JSON payloads that cross them.
//!
//! Two job kinds cross the bus — plain completions (`{"prompt"}` /
//! `{"completion"}`) and prescription analyses (`{"text"}` / `{"analysis"}`).
//! Image jobs never do; they run in-process on the async dispatch path.
//! Replies carry an optional `strategy` field for auditing which fallback
//! tier produced them; legacy producers omit it.

use rxline_analysis::job::{AnalysisJob, AnalysisResult, JobPayload, ResultStatus, StrategyKind};
use serde::{Deserialize, Serialize};

/// Which bus lane a job travels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Completion,
    Prescription,
}

impl JobKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Prescription => "prescription",
        }
    }
}

/// Subject names derived from the configured prefix.
#[derive(Clone, Debug)]
pub struct Subjects {
    prefix: String,
}

impl Subjects {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('.').to_string(),
        }
    }

    /// Submission subject for one job kind.
    #[must_use]
    pub fn submit(&self, kind: JobKind) -> String {
        format!("{}.{}", self.prefix, kind.as_str())
    }

    /// Fixed response subject used when a job carries no reply-to.
    #[must_use]
    pub fn response(&self, kind: JobKind) -> String {
        format!("{}.{}.response", self.prefix, kind.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug)]
pub struct CompletionRequest {
    pub prompt: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AnalysisRequest {
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CompletionReply {
    pub status: String,
    #[serde(default)]
    pub completion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AnalysisReply {
    pub status: String,
    #[serde(default)]
    pub analysis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

// ---------------------------------------------------------------------------
// Job <-> payload conversions
// ---------------------------------------------------------------------------

/// The bus lane for `job`, or `None` for image jobs, which stay in-process.
#[must_use]
pub fn job_kind(job: &AnalysisJob) -> Option<JobKind> {
    match job.payload {
        JobPayload::Completion { .. } => Some(JobKind::Completion),
        JobPayload::PrescriptionText { .. } => Some(JobKind::Prescription),
        JobPayload::PrescriptionImage { .. } => None,
    }
}

/// Encode a job for submission.
///
/// # Errors
///
/// Returns `serde_json::Error` if serialization fails.
pub fn encode_request(job: &AnalysisJob) -> Result<Vec<u8>, serde_json::Error> {
    match &job.payload {
        JobPayload::Completion { prompt } => serde_json::to_vec(&CompletionRequest {
            prompt: prompt.clone(),
        }),
        JobPayload::PrescriptionText { text } => {
            serde_json::to_vec(&AnalysisRequest { text: text.clone() })
        }
        // Callers gate on `job_kind` first; an image job that reaches the
        // bus anyway degrades to its URL as analysis text.
        JobPayload::PrescriptionImage { image } => serde_json::to_vec(&AnalysisRequest {
            text: image.url.clone(),
        }),
    }
}

/// Decode a received job payload. The job id is taken from `reply_to` when
/// present so worker logs correlate with broker logs.
///
/// # Errors
///
/// Returns `serde_json::Error` on malformed payloads.
pub fn decode_request(
    kind: JobKind,
    payload: &[u8],
    reply_to: Option<&str>,
) -> Result<AnalysisJob, serde_json::Error> {
    let job = match kind {
        JobKind::Completion => {
            let request: CompletionRequest = serde_json::from_slice(payload)?;
            AnalysisJob::completion(&request.prompt)
        }
        JobKind::Prescription => {
            let request: AnalysisRequest = serde_json::from_slice(payload)?;
            AnalysisJob::prescription_text(&request.text)
        }
    };
    Ok(match reply_to {
        Some(reply_to) => job.with_id(reply_to),
        None => job,
    })
}

/// Encode a finished result as the reply payload for `kind`.
///
/// # Errors
///
/// Returns `serde_json::Error` if serialization fails.
pub fn encode_reply(kind: JobKind, result: &AnalysisResult) -> Result<Vec<u8>, serde_json::Error> {
    let status = result.status.as_str().to_string();
    let strategy = Some(result.strategy.as_str().to_string());
    match kind {
        JobKind::Completion => serde_json::to_vec(&CompletionReply {
            status,
            completion: result.text.clone(),
            strategy,
        }),
        JobKind::Prescription => serde_json::to_vec(&AnalysisReply {
            status,
            analysis: result.text.clone(),
            strategy,
        }),
    }
}

/// Decode a reply payload back into a result. A missing `strategy` field
/// (legacy producers) decodes as [`StrategyKind::None`].
///
/// # Errors
///
/// Returns `serde_json::Error` on malformed payloads.
pub fn decode_reply(kind: JobKind, payload: &[u8]) -> Result<AnalysisResult, serde_json::Error> {
    let (status, text, strategy) = match kind {
        JobKind::Completion => {
            let reply: CompletionReply = serde_json::from_slice(payload)?;
            (reply.status, reply.completion, reply.strategy)
        }
        JobKind::Prescription => {
            let reply: AnalysisReply = serde_json::from_slice(payload)?;
            (reply.status, reply.analysis, reply.strategy)
        }
    };
    let status = if status == "success" {
        ResultStatus::Success
    } else {
        ResultStatus::Error
    };
    let strategy = strategy
        .as_deref()
        .and_then(StrategyKind::parse)
        .unwrap_or(StrategyKind::None);
    let length = text.chars().count();
    Ok(AnalysisResult {
        status,
        text,
        strategy,
        length,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
