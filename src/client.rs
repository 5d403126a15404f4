use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use reqwest::{
    header::{HeaderName, HeaderValue, ACCEPT},
    Method,
};
use serde::de::DeserializeOwned;
use tokio::time::sleep;

use crate::{
    core::RetryState,
    errors::{Error, Result, RetryMetadata, TransportError, TransportErrorKind},
    http::{parse_api_error_parts, request_id_from_headers, HeaderList, RetryConfig},
    responses::ResponsesClient,
    runs::RunsClient,
    telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext, Telemetry},
    workflow::ModelId,
    API_KEY_HEADER, DEFAULT_BASE_URL, DEFAULT_CLIENT_HEADER, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT, REQUEST_ID_HEADER,
};

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub client_header: Option<String>,
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 5s).
    pub connect_timeout: Option<Duration>,
    /// Override the request timeout (defaults to 60s). Streaming calls ignore it.
    pub timeout: Option<Duration>,
    /// Retry/backoff policy (defaults to 3 attempts, exponential backoff + jitter).
    pub retry: Option<RetryConfig>,
    /// Default extra headers applied to all requests.
    pub default_headers: Option<HeaderList>,
    /// Optional metrics callbacks (HTTP latency, first-token latency, token usage).
    pub metrics: Option<MetricsCallbacks>,
}

/// Entry point: owns the HTTP client and hands out per-resource clients.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    base_url: reqwest::Url,
    api_key: Option<String>,
    access_token: Option<String>,
    client_header: Option<String>,
    http: reqwest::Client,
    request_timeout: Duration,
    pub(crate) retry: RetryConfig,
    default_headers: Option<HeaderList>,
    pub(crate) telemetry: Telemetry,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl Client {
    pub fn new(cfg: Config) -> Result<Self> {
        let base_source = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        // Url::join replaces the last segment unless the base ends with '/'.
        let base = format!("{}/", base_source.trim().trim_end_matches('/'));
        let base_url = reqwest::Url::parse(&base)
            .map_err(|err| Error::Config(format!("invalid base url: {err}")))?;

        let api_key = non_blank(cfg.api_key);
        let access_token = non_blank(cfg.access_token);
        if api_key.is_none() && access_token.is_none() {
            return Err(Error::Config(
                "api key or access token is required".to_string(),
            ));
        }

        let connect_timeout = cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .map_err(|err| TransportError {
                    kind: TransportErrorKind::Connect,
                    message: "failed to build http client".to_string(),
                    source: Some(err),
                    retries: None,
                })?,
        };

        let client_header =
            non_blank(cfg.client_header).or_else(|| Some(DEFAULT_CLIENT_HEADER.to_string()));

        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url,
                api_key,
                access_token,
                client_header,
                http,
                request_timeout: cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                retry: cfg.retry.unwrap_or_default(),
                default_headers: cfg.default_headers,
                telemetry: Telemetry::new(cfg.metrics),
            }),
        })
    }

    /// Workflow runs: create, inspect, stream events, submit tool results.
    pub fn runs(&self) -> RunsClient {
        RunsClient {
            inner: self.inner.clone(),
        }
    }

    /// Streamed LLM responses.
    pub fn responses(&self) -> ResponsesClient {
        ResponsesClient {
            inner: self.inner.clone(),
        }
    }
}

fn apply_header_list(
    mut builder: reqwest::RequestBuilder,
    headers: &HeaderList,
) -> Result<reqwest::RequestBuilder> {
    for entry in headers.iter().filter(|entry| entry.is_valid()) {
        let name = HeaderName::from_bytes(entry.key.trim().as_bytes())
            .map_err(|err| Error::Config(format!("invalid header name: {err}")))?;
        let val = HeaderValue::from_str(entry.value.trim())
            .map_err(|err| Error::Config(format!("invalid header value: {err}")))?;
        builder = builder.header(name, val);
    }
    Ok(builder)
}

impl ClientInner {
    pub(crate) fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| Error::Config(format!("invalid path: {err}")))?;
        Ok(self.http.request(method, url))
    }

    pub(crate) fn with_headers(
        &self,
        mut builder: reqwest::RequestBuilder,
        request_id: Option<&str>,
        headers: &HeaderList,
        accept: Option<&str>,
    ) -> Result<reqwest::RequestBuilder> {
        if let Some(accept) = accept {
            builder = builder.header(ACCEPT, accept);
        }
        if let Some(req_id) = request_id.filter(|id| !id.trim().is_empty()) {
            builder = builder.header(REQUEST_ID_HEADER, req_id);
        }
        if let Some(client_header) = self.client_header.as_deref() {
            builder = builder.header("X-ModelRelay-Client", client_header);
        }
        builder = self.apply_auth(builder);

        if let Some(defaults) = &self.default_headers {
            builder = apply_header_list(builder, defaults)?;
        }
        apply_header_list(builder, headers)
    }

    /// Applies `timeout`, or the client default when `use_default` is set.
    /// Streaming requests pass `use_default = false` so long streams are bounded
    /// only by their stream timeouts.
    pub(crate) fn with_timeout(
        &self,
        builder: reqwest::RequestBuilder,
        timeout: Option<Duration>,
        use_default: bool,
    ) -> reqwest::RequestBuilder {
        match timeout {
            Some(duration) => builder.timeout(duration),
            None if use_default => builder.timeout(self.request_timeout),
            None => builder,
        }
    }

    fn apply_auth(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.access_token {
            let token = token.trim();
            let bearer = token
                .strip_prefix("Bearer ")
                .or_else(|| token.strip_prefix("bearer "))
                .unwrap_or(token);
            builder = builder.bearer_auth(bearer);
        }
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
    }

    pub(crate) fn make_context(
        &self,
        method: &Method,
        path: &str,
        model: Option<ModelId>,
        request_id: Option<String>,
    ) -> RequestContext {
        RequestContext::new(method.clone(), path, model, request_id)
    }

    /// Sends with retries and decodes a JSON body.
    pub(crate) async fn execute_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        method: Method,
        retry: Option<RetryConfig>,
        ctx: RequestContext,
    ) -> Result<T> {
        let retry_cfg = retry.unwrap_or_else(|| self.retry.clone());
        let resp = self
            .send_with_retry(builder, method, retry_cfg, ctx)
            .await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| self.to_transport_error(err, None))?;
        let parsed = serde_json::from_slice::<T>(&bytes)?;
        Ok(parsed)
    }

    pub(crate) async fn send_with_retry(
        &self,
        builder: reqwest::RequestBuilder,
        method: Method,
        retry: RetryConfig,
        ctx: RequestContext,
    ) -> Result<reqwest::Response> {
        let max_attempts = retry.max_attempts.max(1);
        let mut state = RetryState::new();
        let start = Instant::now();

        for attempt in 1..=max_attempts {
            let attempt_builder = builder
                .try_clone()
                .ok_or_else(|| Error::Config("request body is not cloneable for retry".into()))?;
            let send = attempt_builder.send();
            // Instrumented rather than entered: the future must stay Send.
            #[cfg(feature = "tracing")]
            let send = tracing::Instrument::instrument(
                send,
                tracing::debug_span!(
                    "modelrelay.http",
                    method = %ctx.method,
                    path = %ctx.path,
                    attempt,
                    max_attempts
                ),
            );

            match send.await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        self.record_http(&ctx, &resp, start, Some(status.as_u16()), None, &state);
                        #[cfg(feature = "tracing")]
                        tracing::debug!(
                            status = %status,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "request completed"
                        );
                        return Ok(resp);
                    }
                    state.record_attempt(attempt);
                    state.record_status(status);

                    if retry.should_retry_status(&method, status) && attempt < max_attempts {
                        sleep(retry.backoff_delay(attempt)).await;
                        continue;
                    }

                    self.record_http(
                        &ctx,
                        &resp,
                        start,
                        Some(status.as_u16()),
                        Some(format!("http {}", status.as_u16())),
                        &state,
                    );
                    #[cfg(feature = "tracing")]
                    tracing::warn!(status = %status, attempt, "request failed; returning error");
                    let headers = resp.headers().clone();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(parse_api_error_parts(status, &headers, body, state.metadata()));
                }
                Err(err) => {
                    state.record_attempt(attempt);
                    state.record_error(&err);
                    if retry.should_retry_error(&method, &err) && attempt < max_attempts {
                        sleep(retry.backoff_delay(attempt)).await;
                        continue;
                    }

                    let retries = state.metadata();
                    self.telemetry.record_http(|| HttpRequestMetrics {
                        latency: start.elapsed(),
                        status: None,
                        error: Some(err.to_string()),
                        retries: retries.clone(),
                        context: ctx.clone(),
                    });
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt, error = %err, "transport error");
                    return Err(self.to_transport_error(err, retries));
                }
            }
        }

        Err(Error::Transport(TransportError {
            kind: TransportErrorKind::Other,
            message: "request failed".to_string(),
            source: None,
            retries: state.metadata(),
        }))
    }

    fn record_http(
        &self,
        ctx: &RequestContext,
        resp: &reqwest::Response,
        start: Instant,
        status: Option<u16>,
        error: Option<String>,
        state: &RetryState,
    ) {
        self.telemetry.record_http(|| {
            let mut context = ctx.clone();
            if context.request_id.is_none() {
                context.set_request_id(request_id_from_headers(resp.headers()));
            }
            HttpRequestMetrics {
                latency: start.elapsed(),
                status,
                error,
                retries: state.metadata(),
                context,
            }
        });
    }

    pub(crate) fn to_transport_error(
        &self,
        err: reqwest::Error,
        retries: Option<RetryMetadata>,
    ) -> Error {
        TransportError::from_reqwest(err, retries).into()
    }
}
