//! Error taxonomy shared by the orchestrator, the inference gateway and the
//! client retry controller.
//!
//! Every failure path carries an [`ErrorKind`]. The kind is what crosses the
//! wire and what the client's retry policy is keyed on; the message is for
//! humans and logs only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed classification tag for failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request
    Validation,
    /// Missing or rejected credential
    AuthRequired,
    /// Upstream throttled the call (may carry a retry-after hint)
    RateLimited,
    /// Backend 5xx-class failure
    UpstreamService,
    /// Network unreachable or timed out
    Connectivity,
    /// Local persistence failure
    CacheError,
    /// No usable item data
    Extraction,
    /// Unclassified fallback
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamService => "upstream_service",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::CacheError => "cache_error",
            ErrorKind::Extraction => "extraction",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// HTTP status used when this kind is returned by the server.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::AuthRequired => 401,
            ErrorKind::RateLimited => 429,
            ErrorKind::UpstreamService => 502,
            ErrorKind::Connectivity => 503,
            ErrorKind::CacheError => 500,
            ErrorKind::Extraction => 422,
            ErrorKind::Unknown => 500,
        }
    }

    /// Best-effort classification of a bare HTTP status (used by the client
    /// when the server did not send a structured error body).
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 404 | 405 | 413 => ErrorKind::Validation,
            401 | 403 => ErrorKind::AuthRequired,
            422 => ErrorKind::Extraction,
            429 => ErrorKind::RateLimited,
            502 | 504 | 529 => ErrorKind::UpstreamService,
            503 => ErrorKind::Connectivity,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an analysis operation, classified.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Authentication required: {0}")]
    AuthRequired(String),
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("Upstream service error: {0}")]
    UpstreamService(String),
    #[error("Connection failed: {0}")]
    Connectivity(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("No usable item data: {0}")]
    Extraction(String),
    #[error("{0}")]
    Unknown(String),
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Validation(_) => ErrorKind::Validation,
            AnalysisError::AuthRequired(_) => ErrorKind::AuthRequired,
            AnalysisError::RateLimited { .. } => ErrorKind::RateLimited,
            AnalysisError::UpstreamService(_) => ErrorKind::UpstreamService,
            AnalysisError::Connectivity(_) => ErrorKind::Connectivity,
            AnalysisError::Cache(_) => ErrorKind::CacheError,
            AnalysisError::Extraction(_) => ErrorKind::Extraction,
            AnalysisError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Server-provided delay before a retry makes sense, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnalysisError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            AnalysisError::Validation(m)
            | AnalysisError::AuthRequired(m)
            | AnalysisError::UpstreamService(m)
            | AnalysisError::Connectivity(m)
            | AnalysisError::Cache(m)
            | AnalysisError::Extraction(m)
            | AnalysisError::Unknown(m) => m,
            AnalysisError::RateLimited { message, .. } => message,
        }
    }

    /// Rebuild an error from its wire representation.
    pub fn from_parts(kind: ErrorKind, message: String, retry_after: Option<Duration>) -> Self {
        match kind {
            ErrorKind::Validation => AnalysisError::Validation(message),
            ErrorKind::AuthRequired => AnalysisError::AuthRequired(message),
            ErrorKind::RateLimited => AnalysisError::RateLimited {
                message,
                retry_after,
            },
            ErrorKind::UpstreamService => AnalysisError::UpstreamService(message),
            ErrorKind::Connectivity => AnalysisError::Connectivity(message),
            ErrorKind::CacheError => AnalysisError::Cache(message),
            ErrorKind::Extraction => AnalysisError::Extraction(message),
            ErrorKind::Unknown => AnalysisError::Unknown(message),
        }
    }

    /// Classify a transport-level failure from `reqwest`.
    pub fn from_transport(err: &reqwest::Error, target: &str) -> Self {
        if err.is_timeout() {
            AnalysisError::Connectivity(format!("Request to {} timed out", target))
        } else if err.is_connect() || err.is_request() {
            AnalysisError::Connectivity(format!("Could not connect to {}", target))
        } else if err.is_decode() || err.is_body() {
            AnalysisError::UpstreamService(format!("Malformed response from {}", target))
        } else {
            AnalysisError::Unknown(format!("Request to {} failed: {}", target, err))
        }
    }
}
