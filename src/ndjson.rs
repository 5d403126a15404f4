use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use reqwest::{header::CONTENT_TYPE, Response as HttpResponse};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::StreamAggregator,
    core::{map_event, NdjsonDecoder, RawEvent},
    errors::{Error, Result, TransportError},
    stream_timeout::StreamTimeoutMonitor,
    telemetry::StreamTelemetry,
    types::{Response, StreamEvent},
    NDJSON_CONTENT_TYPE,
};

/// Decoded token records buffered from one chunk before the consumer falls behind.
const MAX_PENDING_EVENTS: usize = 512;

/// Rejects a streaming response whose content type is not NDJSON.
pub(crate) fn ensure_ndjson(resp: &HttpResponse) -> Result<()> {
    let received = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<missing>");
    let essence = received
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence == NDJSON_CONTENT_TYPE || essence == "application/ndjson" {
        return Ok(());
    }
    Err(Error::StreamContentType {
        expected: NDJSON_CONTENT_TYPE,
        received: received.to_string(),
        status: resp.status().as_u16(),
    })
}

/// Streaming handle over NDJSON response events.
///
/// Yields [`StreamEvent`]s until the body ends, the handle is cancelled, or a
/// stream deadline fires (which surfaces once as [`Error::StreamTimeout`]).
/// Dropping the handle cancels the underlying request.
pub struct StreamHandle {
    request_id: Option<String>,
    stream: Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>,
    cancel: CancellationToken,
    started: Instant,
}

impl StreamHandle {
    pub(crate) fn new(
        response: HttpResponse,
        request_id: Option<String>,
        cancel: CancellationToken,
        monitor: StreamTimeoutMonitor,
        telemetry: Option<StreamTelemetry>,
        started: Instant,
    ) -> Self {
        let monitor = Arc::new(monitor);
        let content_monitor = monitor.clone();
        let mapper_request_id = request_id.clone();
        let limit = Some(MAX_PENDING_EVENTS);
        let events = decode_ndjson(response, cancel.clone(), monitor, limit, move |raw| {
            let evt = map_event(raw, mapper_request_id.clone())?;
            if evt.as_ref().is_some_and(StreamEvent::has_content) {
                content_monitor.signal_first_content();
            }
            Ok(evt)
        });
        Self {
            request_id,
            stream: Box::pin(observe(events, telemetry)),
            cancel,
            started,
        }
    }

    /// Build a stream handle from a sequence of events (useful for tests/mocks).
    pub fn from_events(events: impl IntoIterator<Item = StreamEvent>) -> Self {
        Self::from_events_with_request_id(events, None)
    }

    /// Build a stream handle from events and an explicit request id.
    pub fn from_events_with_request_id(
        events: impl IntoIterator<Item = StreamEvent>,
        request_id: Option<String>,
    ) -> Self {
        let collected: Vec<StreamEvent> = events.into_iter().collect();
        let req_id = request_id.or_else(|| collected.iter().find_map(|evt| evt.request_id.clone()));
        let cancel = CancellationToken::new();
        let items = stream::iter(collected.into_iter().map(Ok))
            .take_until(cancel.clone().cancelled_owned());
        Self {
            request_id: req_id,
            stream: Box::pin(items),
            cancel,
            started: Instant::now(),
        }
    }

    /// Request identifier returned by the server (if any).
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Cancel the in-flight streaming request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drives the stream through a [`StreamAggregator`] into one [`Response`].
    ///
    /// Stops at `message_stop`. A body that ends without one still yields the
    /// content collected so far.
    pub async fn collect(mut self) -> Result<Response> {
        let mut aggregator = StreamAggregator::with_start(self.started, self.request_id.clone());
        while let Some(item) = self.next().await {
            if aggregator.push(item?)? {
                break;
            }
        }
        Ok(aggregator.finish())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Stream for StreamHandle {
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.as_mut().poll_next(cx)
    }
}

struct DecodeState<B, T, F> {
    body: Pin<Box<B>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<T>,
    map: F,
    cancel: CancellationToken,
    monitor: Arc<StreamTimeoutMonitor>,
    max_pending: Option<usize>,
    eof: bool,
    terminated: bool,
}

impl<B, T, F> DecodeState<B, T, F>
where
    F: FnMut(RawEvent) -> Result<Option<T>>,
{
    fn enqueue(&mut self, lines: impl IntoIterator<Item = RawEvent>) -> Result<()> {
        for raw in lines {
            if let Some(item) = (self.map)(raw)? {
                self.pending.push_back(item);
                if self.max_pending.is_some_and(|max| self.pending.len() > max) {
                    return Err(Error::StreamBackpressure {
                        dropped: self.pending.len(),
                    });
                }
            }
        }
        Ok(())
    }

    fn fail(mut self, err: Error) -> Option<(Result<T>, Self)> {
        self.terminated = true;
        self.pending.clear();
        self.monitor.finish();
        Some((Err(err), self))
    }
}

/// Decodes an NDJSON body into records produced by `map`.
///
/// Every chunk counts as activity for `monitor`. When `cancel` fires the
/// stream ends, yielding one [`Error::StreamTimeout`] first if the monitor
/// was the reason. With `max_pending` set, a chunk that decodes to more
/// records than that fails with [`Error::StreamBackpressure`]; `None` buffers
/// whatever one chunk holds.
pub(crate) fn decode_ndjson<T, F>(
    response: HttpResponse,
    cancel: CancellationToken,
    monitor: Arc<StreamTimeoutMonitor>,
    max_pending: Option<usize>,
    map: F,
) -> impl Stream<Item = Result<T>> + Send
where
    T: Send + 'static,
    F: FnMut(RawEvent) -> Result<Option<T>> + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(response.bytes_stream()),
        decoder: NdjsonDecoder::new(),
        pending: VecDeque::new(),
        map,
        cancel,
        monitor,
        max_pending,
        eof: false,
        terminated: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.terminated {
                return None;
            }
            if st.cancel.is_cancelled() {
                st.terminated = true;
                st.pending.clear();
                let timeout = st.monitor.error();
                st.monitor.finish();
                return timeout.map(|err| (Err(Error::StreamTimeout(err)), st));
            }
            if let Some(item) = st.pending.pop_front() {
                return Some((Ok(item), st));
            }
            if st.eof {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = st.cancel.cancelled() => continue,
                next = st.body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    st.monitor.signal_activity();
                    let queued = st.decoder.push(&chunk).and_then(|lines| st.enqueue(lines));
                    if let Err(err) = queued {
                        return st.fail(err);
                    }
                }
                Some(Err(err)) => {
                    return st.fail(TransportError::from_reqwest(err, None).into());
                }
                None => {
                    st.eof = true;
                    st.monitor.finish();
                    let queued = st.decoder.finish().and_then(|tail| st.enqueue(tail));
                    if let Err(err) = queued {
                        return st.fail(err);
                    }
                }
            }
        }
    })
}

/// Feeds every item to the stream's metrics; they settle when the stream is
/// dropped.
fn observe<S>(
    events: S,
    telemetry: Option<StreamTelemetry>,
) -> impl Stream<Item = Result<StreamEvent>> + Send
where
    S: Stream<Item = Result<StreamEvent>> + Send + 'static,
{
    stream::unfold(
        (Box::pin(events), telemetry),
        |(mut events, mut telemetry)| async move {
            let item = events.next().await?;
            if let Some(t) = telemetry.as_mut() {
                t.observe(&item);
            }
            Some((item, (events, telemetry)))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamEventKind;

    #[tokio::test]
    async fn from_events_collects_into_response() {
        let mut stop = StreamEvent::new(StreamEventKind::MessageStop);
        stop.response_id = Some("resp_1".into());
        let mut start = StreamEvent::new(StreamEventKind::MessageStart);
        start.request_id = Some("req_1".into());
        let handle = StreamHandle::from_events(vec![
            start,
            StreamEvent::new(StreamEventKind::MessageDelta).with_text("hi "),
            StreamEvent::new(StreamEventKind::MessageDelta).with_text("there"),
            stop,
            StreamEvent::new(StreamEventKind::MessageDelta).with_text("ignored"),
        ]);
        assert_eq!(handle.request_id(), Some("req_1"));
        let response = handle.collect().await.unwrap();
        assert_eq!(response.text(), "hi there");
        assert_eq!(response.id, "resp_1");
        assert!(response.metrics.is_some());
    }

    #[tokio::test]
    async fn cancelled_handle_yields_nothing() {
        let mut handle = StreamHandle::from_events(vec![
            StreamEvent::new(StreamEventKind::MessageDelta).with_text("a"),
        ]);
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn collect_without_stop_keeps_partial_text() {
        let handle = StreamHandle::from_events(vec![
            StreamEvent::new(StreamEventKind::MessageDelta).with_text("partial"),
        ]);
        let response = handle.collect().await.unwrap();
        assert_eq!(response.text(), "partial");
    }
}
