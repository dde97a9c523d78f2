//! Store error types and failure classification.

use std::time::Duration;

/// Whether a failed call may be retried as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blip, timeout, rate limit or server error.
    Transient,
    /// Auth, not-found, conflict or malformed data.
    Permanent,
}

/// Errors produced by object store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid store config: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Classifies this error for the retry policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() => {
                FailureKind::Transient
            }
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } | Self::Server { .. } => {
                FailureKind::Transient
            }
            _ => FailureKind::Permanent,
        }
    }

    /// Returns `true` if the same call may succeed when retried.
    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Maps a non-success HTTP status to an error.
    ///
    /// `rate_limit_exhausted` marks a 403 that is really a rate limit
    /// (the remaining request budget is zero), which is transient.
    pub fn from_status(
        status: u16,
        body: String,
        rate_limit_exhausted: bool,
        retry_after: Option<Duration>,
    ) -> Self {
        match status {
            429 => Self::RateLimited { retry_after },
            403 if rate_limit_exhausted => Self::RateLimited { retry_after },
            401 | 403 => Self::Unauthorized(body),
            404 => Self::NotFound(body),
            409 | 422 => Self::Conflict(body),
            500..=599 => Self::Server { status, body },
            _ => Self::Api { status, body },
        }
    }
}
