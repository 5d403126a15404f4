use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::Stream;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    client::ClientInner,
    core::{truncate_for_error, RawEvent},
    errors::{Error, Result, ValidationError},
    http::{request_id_from_headers, HeaderList},
    ndjson::{decode_ndjson, ensure_ndjson},
    stream_timeout::StreamTimeoutMonitor,
    workflow::{
        NodeId, NodeResultV0, PlanHash, RequestId, RunCostSummaryV0, RunEventV0, RunId,
        RunStatusV0, ToolCallId, ToolName, WorkflowSpecV0,
    },
    NDJSON_CONTENT_TYPE,
};

#[derive(Clone)]
pub struct RunsClient {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive(Debug, Clone, Serialize)]
struct RunsCreateRequest<'a> {
    spec: &'a WorkflowSpecV0,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunsCreateResponse {
    pub run_id: RunId,
    pub status: RunStatusV0,
    pub plan_hash: PlanHash,
}

/// Snapshot returned by `GET /runs/{run_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunsGetResponse {
    pub run_id: RunId,
    pub status: RunStatusV0,
    pub plan_hash: PlanHash,
    #[serde(default)]
    pub cost_summary: RunCostSummaryV0,
    #[serde(default)]
    pub nodes: Vec<NodeResultV0>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunsToolResultItemV0 {
    pub tool_call_id: ToolCallId,
    pub name: ToolName,
    pub output: String,
}

/// Results for one waiting batch, addressed by `(node_id, step, request_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunsToolResultsRequest {
    pub node_id: NodeId,
    pub step: i64,
    pub request_id: RequestId,
    pub results: Vec<RunsToolResultItemV0>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunsToolResultsResponse {
    pub accepted: i64,
    pub status: RunStatusV0,
}

fn require_run_id(run_id: &RunId) -> Result<()> {
    if run_id.is_nil() {
        return Err(Error::Validation(
            ValidationError::new("run_id is required").with_field("run_id"),
        ));
    }
    Ok(())
}

impl RunsClient {
    /// Submits a workflow spec. The spec is validated locally first.
    pub async fn create(&self, spec: &WorkflowSpecV0) -> Result<RunsCreateResponse> {
        spec.validate()?;
        let mut builder = self.inner.request(Method::POST, "/runs")?;
        builder = builder.json(&RunsCreateRequest { spec });
        builder = self.inner.with_headers(
            builder,
            None,
            &HeaderList::default(),
            Some("application/json"),
        )?;
        builder = self.inner.with_timeout(builder, None, true);
        let ctx = self.inner.make_context(&Method::POST, "/runs", None, None);
        let created: RunsCreateResponse = self
            .inner
            .execute_json(builder, Method::POST, None, ctx)
            .await?;
        #[cfg(feature = "tracing")]
        tracing::debug!(run_id = %created.run_id, plan_hash = %created.plan_hash, "run created");
        Ok(created)
    }

    pub async fn get(&self, run_id: RunId) -> Result<RunsGetResponse> {
        require_run_id(&run_id)?;
        let path = format!("/runs/{run_id}");
        let builder = self.inner.request(Method::GET, &path)?;
        let builder = self.inner.with_headers(
            builder,
            None,
            &HeaderList::default(),
            Some("application/json"),
        )?;
        let builder = self.inner.with_timeout(builder, None, true);
        let ctx = self.inner.make_context(&Method::GET, &path, None, None);
        self.inner
            .execute_json(builder, Method::GET, None, ctx)
            .await
    }

    /// Opens the run's event log, resuming after `after_seq` (0 = from the start).
    pub async fn stream_events(&self, run_id: RunId, after_seq: u64) -> Result<RunEventStreamHandle> {
        require_run_id(&run_id)?;
        let path = format!("/runs/{run_id}/events");
        let mut builder = self.inner.request(Method::GET, &path)?;
        if after_seq > 0 {
            builder = builder.query(&[("after_seq", after_seq)]);
        }
        let builder = self.inner.with_headers(
            builder,
            None,
            &HeaderList::default(),
            Some(NDJSON_CONTENT_TYPE),
        )?;

        let retry = self.inner.retry.clone();
        let ctx = self.inner.make_context(&Method::GET, &path, None, None);
        let resp = self
            .inner
            .send_with_retry(builder, Method::GET, retry, ctx)
            .await?;
        ensure_ndjson(&resp)?;

        let request_id = request_id_from_headers(resp.headers());
        Ok(RunEventStreamHandle::new(resp, request_id))
    }

    pub async fn submit_tool_results(
        &self,
        run_id: RunId,
        req: RunsToolResultsRequest,
    ) -> Result<RunsToolResultsResponse> {
        require_run_id(&run_id)?;
        if req.results.is_empty() {
            return Err(Error::Validation(
                ValidationError::new("at least one tool result is required").with_field("results"),
            ));
        }
        let path = format!("/runs/{run_id}/tool-results");
        let mut builder = self.inner.request(Method::POST, &path)?.json(&req);
        builder = self.inner.with_headers(
            builder,
            None,
            &HeaderList::default(),
            Some("application/json"),
        )?;
        builder = self.inner.with_timeout(builder, None, true);
        let ctx = self.inner.make_context(&Method::POST, &path, None, None);
        self.inner
            .execute_json(builder, Method::POST, None, ctx)
            .await
    }
}

/// Validated run events from one `GET /runs/{id}/events` session.
///
/// Ends (`None`) at EOF or once cancelled. Dropping the handle cancels it.
/// A replay is never capped: however many events one chunk carries, all of
/// them are yielded.
pub struct RunEventStreamHandle {
    request_id: Option<String>,
    stream: Pin<Box<dyn Stream<Item = Result<RunEventV0>> + Send>>,
    cancel: CancellationToken,
}

impl RunEventStreamHandle {
    fn new(response: reqwest::Response, request_id: Option<String>) -> Self {
        let cancel = CancellationToken::new();
        let stream = decode_ndjson(
            response,
            cancel.clone(),
            Arc::new(StreamTimeoutMonitor::inert()),
            None,
            |raw| parse_run_event(raw).map(Some),
        );
        Self {
            request_id,
            stream: Box::pin(stream),
            cancel,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RunEventStreamHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Stream for RunEventStreamHandle {
    type Item = Result<RunEventV0>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.as_mut().poll_next(cx)
    }
}

fn parse_run_event(raw: RawEvent) -> Result<RunEventV0> {
    let protocol_error = |message: String| Error::StreamProtocol {
        message,
        raw_data: Some(truncate_for_error(&raw.data, 200)),
    };
    let event: RunEventV0 = serde_json::from_str(&raw.data)
        .map_err(|err| protocol_error(format!("failed to parse run event: {err}")))?;
    event
        .validate()
        .map_err(|err| protocol_error(format!("invalid run event: {err}")))?;
    Ok(event)
}
