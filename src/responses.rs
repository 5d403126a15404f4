use std::{sync::Arc, time::Duration};

use reqwest::Method;
use tokio::time::Instant;

use crate::{
    client::ClientInner,
    errors::{Error, Result, TransportError, TransportErrorKind},
    http::{request_id_from_headers, ResponseOptions, RetryConfig},
    identifiers::ProviderId,
    ndjson::{ensure_ndjson, StreamHandle},
    stream_timeout::{StreamTimeoutMonitor, StreamTimeouts},
    types::{InputItem, Response, ResponseRequest, Tool},
    workflow::ModelId,
    NDJSON_CONTENT_TYPE,
};

const RESPONSES_PATH: &str = "/responses";

/// Client for `POST /responses` token streams.
#[derive(Clone)]
pub struct ResponsesClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl ResponsesClient {
    /// Opens a streamed response.
    ///
    /// The returned handle is governed by a child of `options.cancel` and, when
    /// any of `options.stream_timeouts` is set, by a [`StreamTimeoutMonitor`]
    /// that starts with the request, so TTFT includes connection time.
    pub async fn stream(&self, req: ResponseRequest, options: ResponseOptions) -> Result<StreamHandle> {
        req.validate()?;
        let cancel = options.cancel.as_ref().map_or_else(Default::default, |c| c.child_token());
        let monitor = StreamTimeoutMonitor::start(options.stream_timeouts, &cancel);

        let mut builder = self.inner.request(Method::POST, RESPONSES_PATH)?.json(&req);
        builder = self.inner.with_headers(
            builder,
            options.request_id.as_deref(),
            &options.headers,
            Some(NDJSON_CONTENT_TYPE),
        )?;
        builder = self.inner.with_timeout(builder, options.timeout, false);
        let retry = options
            .retry
            .clone()
            .unwrap_or_else(|| self.inner.retry.clone());

        let mut ctx = self.inner.make_context(
            &Method::POST,
            RESPONSES_PATH,
            req.model.clone(),
            options.request_id.clone(),
        );
        let started = Instant::now();
        let send = self
            .inner
            .send_with_retry(builder, Method::POST, retry, ctx.clone());
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(match monitor.error() {
                    Some(err) => Error::StreamTimeout(err),
                    None => Error::Canceled,
                });
            }
            resp = send => resp?,
        };
        ensure_ndjson(&resp)?;

        let request_id = request_id_from_headers(resp.headers()).or(options.request_id);
        ctx.set_request_id(request_id.clone());
        let stream_telemetry = self.inner.telemetry.stream(ctx, started);

        #[cfg(feature = "tracing")]
        tracing::debug!(request_id = ?request_id, "response stream opened");

        Ok(StreamHandle::new(
            resp,
            request_id,
            cancel,
            monitor,
            stream_telemetry,
            started,
        ))
    }

    /// Streams and aggregates into one [`Response`].
    pub async fn create(&self, req: ResponseRequest, options: ResponseOptions) -> Result<Response> {
        self.stream(req, options).await?.collect().await
    }
}

/// Builder for `POST /responses`.
///
/// Request body fields and transport options are kept apart; the latter are
/// turned into [`ResponseOptions`] when the request is sent.
#[derive(Clone, Debug, Default)]
pub struct ResponseBuilder {
    pub(crate) request: ResponseRequest,
    pub(crate) request_id: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) stream_timeouts: StreamTimeouts,
    pub(crate) retry: Option<RetryConfig>,
    pub(crate) cancel: Option<tokio_util::sync::CancellationToken>,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.request.provider = Some(provider.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<ModelId>) -> Self {
        self.request.model = Some(model.into());
        self
    }

    /// Append a single input item.
    #[must_use]
    pub fn item(mut self, item: InputItem) -> Self {
        self.request.input.push(item);
        self
    }

    #[must_use]
    pub fn system(self, content: impl Into<String>) -> Self {
        self.item(InputItem::system(content))
    }

    #[must_use]
    pub fn user(self, content: impl Into<String>) -> Self {
        self.item(InputItem::user(content))
    }

    #[must_use]
    pub fn assistant(self, content: impl Into<String>) -> Self {
        self.item(InputItem::assistant(content))
    }

    /// Append a tool result message for a given tool call id.
    #[must_use]
    pub fn tool_result(self, tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        self.item(InputItem::tool_result(tool_call_id, content))
    }

    #[must_use]
    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.request.tools = Some(tools);
        self
    }

    #[must_use]
    pub fn max_output_tokens(mut self, max_output_tokens: i64) -> Self {
        self.request.max_output_tokens = Some(max_output_tokens);
        self
    }

    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.request.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Add a header; validated when the request is sent.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Override the HTTP request timeout. Streams are otherwise bounded only by
    /// their stream timeouts.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Time allowed until the first content (text, reasoning or tool use).
    #[must_use]
    pub fn stream_ttft_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeouts = self.stream_timeouts.with_ttft(timeout);
        self
    }

    /// Maximum gap between received chunks.
    #[must_use]
    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeouts = self.stream_timeouts.with_idle(timeout);
        self
    }

    #[must_use]
    pub fn stream_total_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeouts = self.stream_timeouts.with_total(timeout);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn cancel(mut self, cancel: tokio_util::sync::CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub(crate) fn build_options(&self) -> Result<ResponseOptions> {
        let mut opts = ResponseOptions::default().with_stream_timeouts(self.stream_timeouts);
        if let Some(req_id) = &self.request_id {
            opts = opts.with_request_id(req_id.clone());
        }
        for (k, v) in &self.headers {
            opts = opts.with_header(k.clone(), v.clone())?;
        }
        if let Some(timeout) = self.timeout {
            opts = opts.with_timeout(timeout);
        }
        if let Some(retry) = &self.retry {
            opts = opts.with_retry(retry.clone());
        }
        if let Some(cancel) = &self.cancel {
            opts = opts.with_cancel(cancel.clone());
        }
        Ok(opts)
    }

    pub async fn stream(self, client: &ResponsesClient) -> Result<StreamHandle> {
        let options = self.build_options()?;
        client.stream(self.request, options).await
    }

    pub async fn send(self, client: &ResponsesClient) -> Result<Response> {
        self.stream(client).await?.collect().await
    }

    /// Send the request and return the assistant text.
    ///
    /// Returns an `EmptyResponse` transport error if the response has no text.
    pub async fn send_text(self, client: &ResponsesClient) -> Result<String> {
        let response = self.send(client).await?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(Error::Transport(TransportError {
                kind: TransportErrorKind::EmptyResponse,
                message: "response contained no assistant text output".to_string(),
                source: None,
                retries: None,
            }));
        }
        Ok(text)
    }
}
