#![forbid(unsafe_code)]

//! Failure taxonomy shared by the resolver, the scheduler and the HTTP layer.
//!
//! Every variant maps to exactly one HTTP status so that handlers never have
//! to re-classify an error. Variants that can only happen after the response
//! head went out (`ClientDisconnected`, `Truncated`) still get a status, but
//! nothing ever sends it.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("server overloaded: {0}")]
    Overloaded(String),

    #[error("queue is full ({depth} pending)")]
    QueueFull { depth: usize },

    #[error("request timed out")]
    Timeout,

    #[error("video unavailable")]
    VideoUnavailable,

    #[error("video is private")]
    PrivateVideo,

    #[error("authentication required to access this video")]
    AuthenticationRequired,

    #[error("transient failure: {0}")]
    TransientFailure(String),

    #[error("could not parse extractor output: {0}")]
    ParseError(String),

    #[error("extraction failed: {0}")]
    GenericFailure(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("stream ended early: {0}")]
    Truncated(String),
}

impl FetchError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Overloaded(_) | Self::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::VideoUnavailable => StatusCode::NOT_FOUND,
            Self::PrivateVideo => StatusCode::FORBIDDEN,
            Self::ClientDisconnected => StatusCode::BAD_REQUEST,
            Self::AuthenticationRequired
            | Self::TransientFailure(_)
            | Self::ParseError(_)
            | Self::GenericFailure(_)
            | Self::Truncated(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::RateLimited { .. } => "rate_limited",
            Self::Overloaded(_) => "overloaded",
            Self::QueueFull { .. } => "queue_full",
            Self::Timeout => "timeout",
            Self::VideoUnavailable => "video_unavailable",
            Self::PrivateVideo => "private_video",
            Self::AuthenticationRequired => "authentication_required",
            Self::TransientFailure(_) | Self::GenericFailure(_) => "extraction_failed",
            Self::ParseError(_) => "parse_error",
            Self::ClientDisconnected => "client_disconnected",
            Self::Truncated(_) => "truncated",
        }
    }

    /// Remediation text for failures the client (or operator) can act on.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::AuthenticationRequired => Some(
                "the video requires a signed-in session; configure GATEWAY_COOKIES_FILE with exported cookies",
            ),
            Self::RateLimited { .. } => Some("slow down and retry after the indicated delay"),
            Self::Overloaded(_) | Self::QueueFull { .. } => {
                Some("the server is busy; retry after the indicated delay")
            }
            Self::Timeout => Some("the request took too long; retrying later may succeed"),
            Self::TransientFailure(_) | Self::GenericFailure(_) => {
                Some("the extractor failed; retrying later may succeed")
            }
            _ => None,
        }
    }

    /// Seconds a client should wait before retrying, if the failure implies one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::Overloaded(_) => Some(Duration::from_secs(30)),
            Self::QueueFull { .. } => Some(Duration::from_secs(60)),
            _ => None,
        }
    }

    /// Whether the scheduler may requeue the request that produced this error.
    /// Parse errors are deterministic and never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFailure(_))
    }
}
