//! Error types for the edge gateway
//!
//! Two layers:
//! - [`Error`]: process-level failures (configuration, I/O, broker) that abort
//!   startup or a background task.
//! - [`GatewayError`]: the request-level taxonomy every pipeline stage and the
//!   dispatcher reject with. It renders into the shared error envelope.

use std::fmt;
use std::io;
use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Result type alias for the edge gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared broker error
    #[error("Broker error: {0}")]
    Broker(String),

    /// Credential encoding error
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Request-level failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing, malformed, badly signed or expired credential
    Unauthorized,
    /// Rate limit exceeded for the client key
    Throttled,
    /// No route prefix matches the path
    RouteNotFound,
    /// A route matched but has no target configured
    RouteUnconfigured,
    /// Connection to the target failed after retries
    UpstreamUnreachable,
    /// The target did not answer within the route timeout
    UpstreamTimeout,
    /// Malformed client input
    ValidationFailed,
    /// Anything unexpected
    Internal,
}

impl ErrorKind {
    /// HTTP status for this kind
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Throttled => StatusCode::TOO_MANY_REQUESTS,
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::RouteUnconfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Throttled => "TOO_MANY_REQUESTS",
            Self::RouteNotFound => "ROUTE_NOT_FOUND",
            Self::RouteUnconfigured => "ROUTE_UNCONFIGURED",
            Self::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Message returned to the client when no caller-safe override exists
    #[must_use]
    pub fn public_message(self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Throttled => "Too many requests, please try again later",
            Self::RouteNotFound => "Route not found",
            Self::RouteUnconfigured => "Service is not configured",
            Self::UpstreamUnreachable => "Bad gateway",
            Self::UpstreamTimeout => "Upstream timed out",
            Self::ValidationFailed => "Validation failed",
            Self::Internal => "Internal Server Error",
        }
    }
}

/// A rejected unit of work
///
/// `detail` is diagnostic text for logs only. `message` is a caller-safe
/// override and is only ever set for [`ErrorKind::ValidationFailed`].
#[derive(Debug, Clone)]
pub struct GatewayError {
    kind: ErrorKind,
    detail: Option<String>,
    message: Option<String>,
    retry_after: Option<Duration>,
    path: Option<String>,
}

impl GatewayError {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            message: None,
            retry_after: None,
            path: None,
        }
    }

    /// Credential rejected. The reason never reaches the client.
    #[must_use]
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self {
            detail: Some(reason.into()),
            ..Self::new(ErrorKind::Unauthorized)
        }
    }

    /// Rate limit exceeded; `retry_after` becomes the `Retry-After` header
    #[must_use]
    pub fn throttled(retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(ErrorKind::Throttled)
        }
    }

    /// No route matched
    #[must_use]
    pub fn route_not_found() -> Self {
        Self::new(ErrorKind::RouteNotFound)
    }

    /// Route matched but is disabled
    #[must_use]
    pub fn route_unconfigured(route: &str) -> Self {
        Self {
            detail: Some(format!("route '{route}' has no target")),
            ..Self::new(ErrorKind::RouteUnconfigured)
        }
    }

    /// Transport-level failure talking to the target
    #[must_use]
    pub fn upstream_unreachable(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(ErrorKind::UpstreamUnreachable)
        }
    }

    /// Target exceeded the route timeout
    #[must_use]
    pub fn upstream_timeout(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(ErrorKind::UpstreamTimeout)
        }
    }

    /// Malformed client input; `message` is returned verbatim
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            detail: Some(message.clone()),
            message: Some(message),
            ..Self::new(ErrorKind::ValidationFailed)
        }
    }

    /// Unexpected failure
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(ErrorKind::Internal)
        }
    }

    /// Attach the request path reported in the envelope
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Failure kind
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Diagnostic detail (never sent to clients)
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Retry hint for throttled requests
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Whether the dispatcher may retry the attempt that produced this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::UpstreamUnreachable | ErrorKind::UpstreamTimeout
        )
    }

    /// Client-facing message
    #[must_use]
    pub fn public_message(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or_else(|| self.kind.public_message())
    }

    /// Build the shared envelope for this error
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status: "error",
            message: self.public_message().to_string(),
            code: self.kind.code(),
            timestamp: Utc::now(),
            path: self.path.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.kind.code()),
            None => f.write_str(self.kind.code()),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Error body shared by every rejection
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// Always `"error"`
    pub status: &'static str,
    /// Client-safe message
    pub message: String,
    /// Stable code, see [`ErrorKind::code`]
    pub code: &'static str,
    /// When the error was produced
    pub timestamp: DateTime<Utc>,
    /// Request path
    pub path: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let path = self.path.as_deref().unwrap_or_default();
        match self.kind {
            ErrorKind::Internal | ErrorKind::UpstreamUnreachable | ErrorKind::UpstreamTimeout => {
                warn!(code = self.kind.code(), path = %path, detail = ?self.detail, "Request failed");
            }
            _ => {
                debug!(code = self.kind.code(), path = %path, detail = ?self.detail, "Request rejected");
            }
        }
        telemetry_metrics::counter!("gateway_rejections_total", "code" => self.kind.code())
            .increment(1);

        let mut response = (self.kind.status(), Json(self.envelope())).into_response();
        let headers = response.headers_mut();
        match self.kind {
            ErrorKind::Unauthorized => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            ErrorKind::Throttled => {
                let secs = self
                    .retry_after
                    .map_or(1, |d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
                    .max(1);
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            _ => {}
        }
        response
    }
}
