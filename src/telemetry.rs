use std::{fmt, sync::Arc, time::Duration};

use reqwest::Method;
use tokio::time::Instant;

use crate::{
    errors::{Error, RetryMetadata},
    types::{StreamEvent, StreamEventKind, Usage},
    workflow::ModelId,
};

type Callback<T> = Option<Arc<dyn Fn(T) + Send + Sync>>;

/// Metric hooks for callers that do not want a tracing subscriber.
#[derive(Clone, Default)]
pub struct MetricsCallbacks {
    /// One call per logical request, after retries settle.
    pub http_request: Callback<HttpRequestMetrics>,
    /// One call per response stream: at first content, or when the stream
    /// fails or closes without any.
    pub stream_first_token: Callback<StreamFirstTokenMetrics>,
    /// Usage reported by `message_stop`.
    pub usage: Callback<TokenUsageMetrics>,
}

impl fmt::Debug for MetricsCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |cb: bool| if cb { "set" } else { "unset" };
        f.debug_struct("MetricsCallbacks")
            .field("http_request", &set(self.http_request.is_some()))
            .field("stream_first_token", &set(self.stream_first_token.is_some()))
            .field("usage", &set(self.usage.is_some()))
            .finish()
    }
}

/// Which request a metric belongs to.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub model: Option<ModelId>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub(crate) fn new(
        method: Method,
        path: impl Into<String>,
        model: Option<ModelId>,
        request_id: Option<String>,
    ) -> Self {
        let mut ctx = Self {
            method,
            path: path.into(),
            model,
            request_id: None,
        };
        ctx.set_request_id(request_id);
        ctx
    }

    /// Replaces the request id unless `request_id` is missing or blank.
    pub(crate) fn set_request_id(&mut self, request_id: Option<String>) {
        if let Some(id) = request_id.filter(|id| !id.trim().is_empty()) {
            self.request_id = Some(id);
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpRequestMetrics {
    /// From the first attempt to the final response or error.
    pub latency: Duration,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub retries: Option<RetryMetadata>,
    pub context: RequestContext,
}

/// Time to first content, measured like [`ResponseMetrics::ttft`].
///
/// `ttft` is `None` when the stream failed or closed first; `error` then says
/// why.
///
/// [`ResponseMetrics::ttft`]: crate::ResponseMetrics::ttft
#[derive(Clone, Debug)]
pub struct StreamFirstTokenMetrics {
    pub ttft: Option<Duration>,
    pub error: Option<String>,
    pub response_id: Option<String>,
    pub context: RequestContext,
}

#[derive(Clone, Debug)]
pub struct TokenUsageMetrics {
    pub usage: Usage,
    pub response_id: Option<String>,
    pub context: RequestContext,
}

/// The client's copy of the registered callbacks.
#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    callbacks: MetricsCallbacks,
}

impl Telemetry {
    pub fn new(callbacks: Option<MetricsCallbacks>) -> Self {
        Self {
            callbacks: callbacks.unwrap_or_default(),
        }
    }

    /// Builds and emits HTTP metrics; `build` only runs when a callback is set.
    pub fn record_http(&self, build: impl FnOnce() -> HttpRequestMetrics) {
        if let Some(cb) = &self.callbacks.http_request {
            cb(build());
        }
    }

    /// Per-stream state, or `None` when no stream callback is registered.
    ///
    /// `started` must be the same instant the stream's aggregator measures
    /// from so both report the same TTFT.
    pub fn stream(&self, context: RequestContext, started: Instant) -> Option<StreamTelemetry> {
        if self.callbacks.stream_first_token.is_none() && self.callbacks.usage.is_none() {
            return None;
        }
        Some(StreamTelemetry {
            callbacks: self.callbacks.clone(),
            context,
            started,
            first_token_sent: false,
        })
    }
}

/// Owned by one response stream. Dropping it before first content reports
/// the stream as closed.
pub(crate) struct StreamTelemetry {
    callbacks: MetricsCallbacks,
    context: RequestContext,
    started: Instant,
    first_token_sent: bool,
}

impl StreamTelemetry {
    pub fn observe(&mut self, item: &Result<StreamEvent, Error>) {
        match item {
            Ok(evt) => {
                if evt.has_content() {
                    let ttft = self.started.elapsed();
                    self.first_token(Some(ttft), None, evt.response_id.clone());
                }
                if let (StreamEventKind::MessageStop, Some(usage)) = (&evt.kind, &evt.usage) {
                    if let Some(cb) = &self.callbacks.usage {
                        cb(TokenUsageMetrics {
                            usage: usage.clone(),
                            response_id: evt.response_id.clone(),
                            context: self.context.clone(),
                        });
                    }
                }
            }
            Err(err) => self.first_token(None, Some(err.to_string()), None),
        }
    }

    fn first_token(
        &mut self,
        ttft: Option<Duration>,
        error: Option<String>,
        response_id: Option<String>,
    ) {
        if std::mem::replace(&mut self.first_token_sent, true) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            path = %self.context.path,
            ttft_ms = ttft.map(|d| d.as_millis() as u64),
            error = ?error,
            "stream first token"
        );
        if let Some(cb) = &self.callbacks.stream_first_token {
            cb(StreamFirstTokenMetrics {
                ttft,
                error,
                response_id,
                context: self.context.clone(),
            });
        }
    }
}

impl Drop for StreamTelemetry {
    fn drop(&mut self) {
        self.first_token(None, Some("stream closed".to_string()), None);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn context() -> RequestContext {
        RequestContext::new(
            Method::POST,
            "/responses",
            Some(ModelId::from("gpt-4o")),
            Some("req-1".into()),
        )
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<dyn Fn(T) + Send + Sync>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        (calls, Arc::new(move |m: T| sink.lock().unwrap().push(m)))
    }

    #[tokio::test(start_paused = true)]
    async fn first_content_fires_once_with_elapsed_ttft() {
        let (first, first_cb) = recorder();
        let (usage, usage_cb) = recorder();
        let telemetry = Telemetry::new(Some(MetricsCallbacks {
            stream_first_token: Some(first_cb),
            usage: Some(usage_cb),
            ..Default::default()
        }));
        let mut stream = telemetry.stream(context(), Instant::now()).unwrap();

        // Neither a start record nor an empty delta is content.
        tokio::time::advance(Duration::from_millis(10)).await;
        stream.observe(&Ok(StreamEvent::new(StreamEventKind::MessageStart)));
        stream.observe(&Ok(StreamEvent::new(StreamEventKind::MessageDelta).with_text("")));
        assert!(first.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(30)).await;
        let mut delta = StreamEvent::new(StreamEventKind::MessageDelta).with_text("hi");
        delta.response_id = Some("resp-1".into());
        stream.observe(&Ok(delta.clone()));
        stream.observe(&Ok(delta.clone()));

        let mut stop = StreamEvent::new(StreamEventKind::MessageStop);
        stop.response_id = Some("resp-1".into());
        stop.usage = Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        });
        stream.observe(&Ok(stop));
        drop(stream);

        let first = first.lock().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ttft, Some(Duration::from_millis(40)));
        assert_eq!(first[0].error, None);
        assert_eq!(first[0].response_id.as_deref(), Some("resp-1"));
        assert_eq!(first[0].context.request_id.as_deref(), Some("req-1"));

        let usage = usage.lock().unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].usage.total_tokens, 15);
        assert_eq!(usage[0].response_id.as_deref(), Some("resp-1"));
    }

    #[tokio::test]
    async fn error_before_content_is_reported_once() {
        let (first, first_cb) = recorder();
        let telemetry = Telemetry::new(Some(MetricsCallbacks {
            stream_first_token: Some(first_cb),
            ..Default::default()
        }));
        let mut stream = telemetry.stream(context(), Instant::now()).unwrap();
        stream.observe(&Err(Error::Canceled));
        stream.observe(&Err(Error::Canceled));
        drop(stream);

        let first = first.lock().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ttft, None);
        assert_eq!(first[0].error.as_deref(), Some("operation canceled"));
    }

    #[tokio::test]
    async fn drop_without_content_reports_closed() {
        let (first, first_cb) = recorder();
        let telemetry = Telemetry::new(Some(MetricsCallbacks {
            stream_first_token: Some(first_cb),
            ..Default::default()
        }));
        drop(telemetry.stream(context(), Instant::now()));

        let first = first.lock().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].error.as_deref(), Some("stream closed"));
    }

    #[test]
    fn no_stream_state_or_http_build_without_callbacks() {
        let telemetry = Telemetry::new(None);
        assert!(telemetry.stream(context(), Instant::now()).is_none());
        telemetry.record_http(|| unreachable!("metrics built without a callback"));
    }

    #[test]
    fn blank_request_id_is_ignored() {
        let mut ctx = RequestContext::new(Method::GET, "/runs", None, Some("  ".into()));
        assert_eq!(ctx.request_id, None);
        ctx.set_request_id(Some("req-2".into()));
        ctx.set_request_id(None);
        assert_eq!(ctx.request_id.as_deref(), Some("req-2"));
    }
}
