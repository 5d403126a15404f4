use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::ResponseMetrics;
use crate::stream_timeout::StreamTimeoutError;
use crate::workflow::PlanHash;

/// Retry metadata surfaced on transport/API errors when retries were attempted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryMetadata {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Field-level validation error returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: Option<String>,
    pub message: String,
}

/// Structured validation error raised before a request leaves the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "{}: {}", field, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<String> for ValidationError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ValidationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Structured error envelope returned by the API, either as an HTTP error
/// response or as an in-band `error` record on a token stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct APIError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
    pub request_id: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryMetadata>,
    /// Raw response body for debugging (when available).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
    /// Partial stream metrics collected before an in-band stream error.
    #[serde(skip)]
    pub metrics: Option<ResponseMetrics>,
}

impl APIError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            request_id: None,
            fields: Vec::new(),
            retries: None,
            raw_body: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ResponseMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl fmt::Display for APIError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "{} ({}): {}", code, self.status, self.message)
        } else {
            write!(f, "{}: {}", self.status, self.message)
        }
    }
}

impl std::error::Error for APIError {}

/// Convenience alias for fallible SDK results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transport-level error (timeouts, DNS/TLS/connectivity).
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub source: Option<reqwest::Error>,
    pub retries: Option<RetryMetadata>,
}

impl TransportError {
    pub(crate) fn from_reqwest(err: reqwest::Error, retries: Option<RetryMetadata>) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_request() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
            retries,
        }
    }
}

/// Broad transport error kinds for classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    /// The server answered successfully but with nothing usable.
    EmptyResponse,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Request => "request",
            TransportErrorKind::EmptyResponse => "empty response",
            TransportErrorKind::Other => "transport",
        };
        write!(f, "{label}")
    }
}

/// Unified error type surfaced by the SDK.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Api(#[from] APIError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(String),

    /// A stream record could not be decoded or failed validation.
    #[error("stream protocol error: {message}")]
    StreamProtocol {
        message: String,
        raw_data: Option<String>,
    },

    /// The streaming endpoint answered with something other than NDJSON
    /// (typically an intermediary's HTML error page).
    #[error("unexpected stream content type: expected {expected}, got {received} (status {status})")]
    StreamContentType {
        expected: &'static str,
        received: String,
        status: u16,
    },

    #[error("{0}")]
    StreamTimeout(#[from] StreamTimeoutError),

    #[error("plan hash mismatch: expected {expected}, got {received}")]
    PlanHashMismatch {
        expected: PlanHash,
        received: PlanHash,
    },

    #[error("stream backpressure: dropped {dropped} events")]
    StreamBackpressure { dropped: usize },

    #[error("operation canceled")]
    Canceled,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stream_timeout::StreamTimeoutKind;

    #[test]
    fn validation_error_formats_with_field() {
        let err = ValidationError::new("is required").with_field("nodes[0].id");
        assert_eq!(err.to_string(), "nodes[0].id: is required");
    }

    #[test]
    fn api_error_keeps_status_and_body() {
        let api_err = APIError {
            status: 429,
            code: Some("rate_limit".into()),
            message: "too many requests".into(),
            request_id: Some("req_123".into()),
            fields: Vec::new(),
            retries: Some(RetryMetadata {
                attempts: 2,
                last_status: Some(429),
                last_error: None,
            }),
            raw_body: Some("{\"error\":\"rate limit\"}".into()),
            metrics: None,
        };

        assert_eq!(api_err.to_string(), "rate_limit (429): too many requests");
        assert!(api_err.raw_body.is_some());
    }

    #[test]
    fn stream_timeout_error_names_kind() {
        let err: Error = StreamTimeoutError {
            kind: StreamTimeoutKind::Idle,
            timeout: Duration::from_millis(250),
        }
        .into();
        assert_eq!(err.to_string(), "stream idle timeout after 250ms");
    }

    #[test]
    fn content_type_error_reports_received_type() {
        let err = Error::StreamContentType {
            expected: "application/x-ndjson",
            received: "text/html".into(),
            status: 502,
        };
        assert!(err.to_string().contains("text/html"));
        assert!(err.to_string().contains("502"));
    }
}
