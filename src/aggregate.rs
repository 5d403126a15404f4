//! Collapses a token stream into one [`Response`].

use std::time::Duration;

use tokio::time::Instant;

use crate::{
    errors::{APIError, Error, Result},
    tools::ToolCallAccumulator,
    types::{
        ContentPart, MessageRole, OutputItem, Response, StopReason, StreamEvent, StreamEventKind,
        ToolCall, Usage,
    },
    workflow::ModelId,
};

/// Status reported for an in-band error record that carries none.
const DEFAULT_STREAM_ERROR_STATUS: u16 = 500;

/// Timing and usage observed while consuming a stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseMetrics {
    /// Time from request start to the last consumed event.
    pub elapsed: Duration,
    /// Time to first content (text, reasoning, or tool use).
    pub ttft: Option<Duration>,
    pub usage: Option<Usage>,
}

/// Accumulates [`StreamEvent`]s into a final [`Response`].
///
/// Text deltas append; a `message_stop` that carries content is the
/// authoritative final text and replaces what was accumulated. Reasoning is
/// kept apart from the answer but still counts toward TTFT.
#[derive(Debug)]
pub struct StreamAggregator {
    started: Instant,
    request_id: Option<String>,
    response_id: Option<String>,
    model: Option<ModelId>,
    text: String,
    reasoning: String,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
    tool_acc: ToolCallAccumulator,
    tool_calls: Option<Vec<ToolCall>>,
    ttft: Option<Duration>,
    finished: bool,
}

impl StreamAggregator {
    pub fn new(request_id: Option<String>) -> Self {
        Self::with_start(Instant::now(), request_id)
    }

    /// Measures TTFT and elapsed time from `started` (usually request start).
    pub fn with_start(started: Instant, request_id: Option<String>) -> Self {
        Self {
            started,
            request_id,
            response_id: None,
            model: None,
            text: String::new(),
            reasoning: String::new(),
            stop_reason: None,
            usage: None,
            tool_acc: ToolCallAccumulator::new(),
            tool_calls: None,
            ttft: None,
            finished: false,
        }
    }

    /// Folds one event in. Returns `Ok(true)` once `message_stop` was seen.
    ///
    /// An in-band error record ends aggregation with [`Error::Api`] carrying
    /// the metrics collected so far.
    pub fn push(&mut self, evt: StreamEvent) -> Result<bool> {
        if self.ttft.is_none() && evt.has_content() {
            self.ttft = Some(self.started.elapsed());
        }

        if evt.kind == StreamEventKind::Error {
            let payload = evt.error.unwrap_or_default();
            let status = if payload.status > 0 {
                payload.status
            } else {
                DEFAULT_STREAM_ERROR_STATUS
            };
            let mut api_err = APIError::new(status, payload.message);
            api_err.code = payload.code;
            api_err.request_id = evt.request_id.or_else(|| self.request_id.clone());
            api_err.raw_body = Some(evt.raw).filter(|raw| !raw.is_empty());
            return Err(Error::Api(api_err.with_metrics(self.metrics())));
        }

        let is_stop = evt.kind == StreamEventKind::MessageStop;
        if is_stop {
            // Stop record wins for identifiers and accounting.
            self.response_id = evt.response_id.or(self.response_id.take());
            self.model = evt.model.or(self.model.take());
        } else {
            if self.response_id.is_none() {
                self.response_id = evt.response_id;
            }
            if self.model.is_none() {
                self.model = evt.model;
            }
        }
        if evt.usage.is_some() {
            self.usage = evt.usage;
        }
        if evt.stop_reason.is_some() {
            self.stop_reason = evt.stop_reason;
        }

        match evt.kind {
            StreamEventKind::MessageDelta => {
                if let Some(delta) = evt.text_delta {
                    self.text.push_str(&delta);
                }
            }
            StreamEventKind::ReasoningDelta => {
                if let Some(delta) = evt.text_delta {
                    self.reasoning.push_str(&delta);
                }
            }
            StreamEventKind::ToolUseStart | StreamEventKind::ToolUseDelta => {
                if let Some(delta) = evt.tool_call_delta {
                    self.tool_acc.process_delta(&delta);
                }
            }
            StreamEventKind::ToolUseStop => {
                if let Some(delta) = evt.tool_call_delta {
                    self.tool_acc.process_delta(&delta);
                }
                if evt.tool_calls.is_some() {
                    self.tool_calls = evt.tool_calls;
                }
            }
            StreamEventKind::MessageStop => {
                if let Some(content) = evt.text_delta.filter(|c| !c.is_empty()) {
                    self.text = content;
                }
                if evt.tool_calls.is_some() {
                    self.tool_calls = evt.tool_calls;
                }
            }
            _ => {}
        }

        if is_stop {
            self.finished = true;
        }
        Ok(self.finished)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn metrics(&self) -> ResponseMetrics {
        ResponseMetrics {
            elapsed: self.started.elapsed(),
            ttft: self.ttft,
            usage: self.usage.clone(),
        }
    }

    /// Builds the final response, attaching metrics.
    pub fn finish(mut self) -> Response {
        let metrics = self.metrics();
        let tool_calls = self.tool_calls.take().or_else(|| {
            let calls = self.tool_acc.get_tool_calls();
            (!calls.is_empty()).then_some(calls)
        });

        let output = vec![OutputItem::Message {
            role: MessageRole::Assistant,
            content: vec![ContentPart::text(self.text)],
            tool_calls,
        }];

        Response {
            id: self
                .response_id
                .or_else(|| self.request_id.clone())
                .unwrap_or_else(|| "stream".to_string()),
            model: self.model.unwrap_or_default(),
            provider: None,
            stop_reason: self.stop_reason,
            output,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            usage: self.usage.unwrap_or_default(),
            request_id: self.request_id,
            metrics: Some(metrics),
        }
    }
}
