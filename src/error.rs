/*
 * Meeting Minutes Pipeline - Rust Edition
 * Copyright (c) 2024 Meeting Minutes Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use thiserror::Error;

/// Stable machine-readable codes reported in API envelopes and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadInput,
    UnsupportedFormat,
    DurationExceeded,
    UpstreamTimeout,
    UpstreamUnavailable,
    UpstreamAuth,
    RateLimited,
    ContextLength,
    VectorDimMismatch,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::BadInput => "BAD_INPUT",
            ErrorKind::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorKind::DurationExceeded => "DURATION_EXCEEDED",
            ErrorKind::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::UpstreamAuth => "UPSTREAM_AUTH",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ContextLength => "CONTEXT_LENGTH",
            ErrorKind::VectorDimMismatch => "VECTOR_DIM_MISMATCH",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Typed failure surface for every pipeline stage and provider call.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("audio duration {actual:.1}s exceeds cap of {cap:.0}s")]
    DurationExceeded { actual: f64, cap: f64 },

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream auth failure: {0}")]
    UpstreamAuth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("prompt exceeds context length: {0}")]
    ContextLength(String),

    #[error("vector dimension mismatch: collection expects {expected}, embedding has {actual}")]
    VectorDimMismatch { expected: usize, actual: usize },

    #[error("request cancelled")]
    Cancelled,

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::BadInput(_) => ErrorKind::BadInput,
            PipelineError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            PipelineError::DurationExceeded { .. } => ErrorKind::DurationExceeded,
            PipelineError::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            PipelineError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            PipelineError::UpstreamAuth(_) => ErrorKind::UpstreamAuth,
            PipelineError::RateLimited(_) => ErrorKind::RateLimited,
            PipelineError::ContextLength(_) => ErrorKind::ContextLength,
            PipelineError::VectorDimMismatch { .. } => ErrorKind::VectorDimMismatch,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient kinds are eligible for retry; everything else surfaces as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UpstreamTimeout | ErrorKind::UpstreamUnavailable | ErrorKind::RateLimited
        )
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Classify a reqwest transport failure against an upstream service.
    pub fn from_transport(service: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::UpstreamTimeout(format!("{service}: {err}"))
        } else {
            PipelineError::UpstreamUnavailable(format!("{service}: {err}"))
        }
    }

    /// Classify a non-2xx HTTP status from an upstream service.
    pub fn from_status(service: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("{service} returned {status}: {body}");
        match status.as_u16() {
            401 | 403 => PipelineError::UpstreamAuth(detail),
            408 => PipelineError::UpstreamTimeout(detail),
            429 => PipelineError::RateLimited(detail),
            s if s >= 500 => PipelineError::UpstreamUnavailable(detail),
            _ => PipelineError::Internal(detail),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
