use std::time::Duration;

use reqwest::{header::HeaderMap, Method, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{APIError, Error, FieldError, RetryMetadata, ValidationError},
    stream_timeout::StreamTimeouts,
    REQUEST_ID_HEADER,
};

/// Per-call options for streamed response requests.
#[derive(Clone, Debug, Default)]
pub struct ResponseOptions {
    pub request_id: Option<String>,
    pub headers: HeaderList,
    pub timeout: Option<Duration>,
    pub stream_timeouts: StreamTimeouts,
    pub retry: Option<RetryConfig>,
    /// External cancellation; the stream also stops when this token fires.
    pub cancel: Option<CancellationToken>,
}

impl ResponseOptions {
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Adds a header; blank keys or values are rejected.
    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        self.headers.push(HeaderEntry::new(key, value))?;
        Ok(self)
    }

    /// Override the overall request timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stream_timeouts(mut self, timeouts: StreamTimeouts) -> Self {
        self.stream_timeouts = timeouts;
        self
    }

    /// Override the retry policy for this call.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Disable retries for this call.
    pub fn disable_retry(mut self) -> Self {
        self.retry = Some(RetryConfig::disabled());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Retry/backoff configuration (defaults use 3 attempts + jittered exponential backoff).
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_post: bool,
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether the given status code should trigger a retry for this method.
    pub fn should_retry_status(&self, method: &Method, status: StatusCode) -> bool {
        let retryable = status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error();
        retryable && self.allow_for_method(method)
    }

    /// Whether the given transport error should trigger a retry.
    pub fn should_retry_error(&self, method: &Method, err: &reqwest::Error) -> bool {
        (err.is_timeout() || err.is_connect()) && self.allow_for_method(method)
    }

    /// Jittered exponential backoff for the given attempt (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(10);
        let base = self.base_backoff.saturating_mul(2u32.saturating_pow(exp));
        let capped = std::cmp::min(base, self.max_backoff);
        let jitter = 0.5 + fastrand::f64(); // 0.5x .. 1.5x
        let seconds = (capped.as_secs_f64() * jitter).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }

    fn allow_for_method(&self, method: &Method) -> bool {
        method != Method::POST || self.retry_post
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            retry_post: true,
        }
    }
}

/// Ordered list of extra request headers.
#[derive(Clone, Debug, Default)]
pub struct HeaderList(Vec<HeaderEntry>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, entry: HeaderEntry) -> Result<(), ValidationError> {
        if !entry.is_valid() {
            return Err(ValidationError::new(format!(
                "header key and value must be non-empty (got key={:?})",
                entry.key
            ))
            .with_field("headers"));
        }
        self.0.push(entry);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !(self.key.trim().is_empty() || self.value.trim().is_empty())
    }
}

pub(crate) fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    [REQUEST_ID_HEADER, "X-Request-Id"]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn str_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn field_errors(obj: &Value) -> Vec<FieldError> {
    obj.get("fields")
        .and_then(|v| serde_json::from_value::<Vec<FieldError>>(v.clone()).ok())
        .unwrap_or_default()
}

/// Builds an `Error::Api` from a non-2xx response.
///
/// Understands `{"error": {code, message, fields, status}}` and flat
/// `{code, message, fields}` bodies; anything else becomes the message verbatim.
pub(crate) fn parse_api_error_parts(
    status: StatusCode,
    headers: &HeaderMap,
    body: String,
    retries: Option<RetryMetadata>,
) -> Error {
    let header_request_id = request_id_from_headers(headers);
    let status_code = status.as_u16();
    let status_text = status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string();

    let mut api_err = APIError::new(status_code, status_text.clone());
    api_err.request_id = header_request_id;
    api_err.retries = retries;

    if body.is_empty() {
        return api_err.into();
    }

    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        let body_request_id =
            str_field(&value, "request_id").or_else(|| str_field(&value, "requestId"));

        let nested = value.get("error").filter(|v| v.is_object());
        let envelope = match nested {
            Some(err_obj) => Some(err_obj),
            None if value.get("message").and_then(Value::as_str).is_some() => Some(&value),
            None => None,
        };

        if let Some(obj) = envelope {
            api_err.code = str_field(obj, "code");
            api_err.message = str_field(obj, "message").unwrap_or(status_text);
            api_err.fields = field_errors(obj);
            if nested.is_some() {
                if let Some(status_override) = obj.get("status").and_then(Value::as_u64) {
                    api_err.status = status_override as u16;
                }
            }
            if body_request_id.is_some() {
                api_err.request_id = body_request_id;
            }
            api_err.raw_body = Some(body);
            return api_err.into();
        }
    }

    api_err.message = body.clone();
    api_err.raw_body = Some(body);
    api_err.into()
}
