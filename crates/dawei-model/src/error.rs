// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the LLM transport layer.
///
/// Retryability drives the circuit breaker: only `RateLimit`, `Timeout` and
/// `Connection` are retried; everything else fails fast.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Bad input shape (empty message list, malformed tool args, invalid
    /// schedule fields).  Never retried; surfaced to the user.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or invalid configuration.  Fail fast at startup or at the
    /// request boundary.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// HTTP 401 from the provider.
    #[error("{provider} rejected credentials: {message}")]
    Auth { provider: String, message: String },

    /// HTTP 429 or provider-signalled rate limiting.  Retryable; also halves
    /// the adaptive rate limiter.
    #[error("{provider} rate limited: {message}")]
    RateLimit { provider: String, message: String },

    /// Network timeout.  Retryable.
    #[error("{provider} request timed out: {message}")]
    Timeout { provider: String, message: String },

    /// HTTP 5xx or transport-level failure.  Retryable.
    #[error("{provider} connection failed: {message}")]
    Connection { provider: String, message: String },

    /// Non-429 4xx.  Typically a request-shape problem; not retried.
    #[error("{provider} api error (status {status}): {message}")]
    Api { provider: String, status: u16, message: String },

    /// Fast-fail while the provider's circuit breaker is OPEN.
    #[error("circuit breaker open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// The bounded request queue rejected the submission.
    #[error("request queue is full")]
    QueueFull,

    /// The submission timed out waiting in or running through the queue.
    #[error("request timed out in queue")]
    QueueTimeout,

    /// The queue is not accepting submissions (stopped or stopping).
    #[error("request queue is not running")]
    QueueStopped,

    /// Malformed stream payload from the provider.
    #[error("stream decode error: {0}")]
    Decode(String),
}

impl LlmError {
    /// Whether the circuit breaker may retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimit { .. } | LlmError::Timeout { .. } | LlmError::Connection { .. }
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimit { .. })
    }

    /// Classify a non-2xx HTTP response.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        let provider = provider.to_string();
        match status {
            401 => LlmError::Auth { provider, message: body },
            429 => LlmError::RateLimit { provider, message: body },
            500..=599 => LlmError::Connection { provider, message: format!("HTTP {status}: {body}") },
            _ => LlmError::Api { provider, status, message: body },
        }
    }

    /// Classify a reqwest transport error.
    pub fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        let provider = provider.to_string();
        if err.is_timeout() {
            LlmError::Timeout { provider, message: err.to_string() }
        } else {
            LlmError::Connection { provider, message: err.to_string() }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
