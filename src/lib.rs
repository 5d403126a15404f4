//! Client-side orchestration for ModelRelay workflow runs.
//!
//! The crate submits workflow specs, follows a run's resumable event log,
//! executes client-side tool calls when the server pauses a run, and consumes
//! streamed LLM responses under TTFT, idle and total deadlines.
#![cfg_attr(docsrs, feature(doc_cfg))]
// Allow large error types - boxing Error would ripple through every signature
#![allow(clippy::result_large_err)]

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.modelrelay.ai/api/v1";

/// Default client identification header value.
pub(crate) const DEFAULT_CLIENT_HEADER: &str =
    concat!("modelrelay-runs/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default request timeout (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// HTTP header name for request ID tracing.
pub const REQUEST_ID_HEADER: &str = "X-ModelRelay-Chat-Request-Id";

/// HTTP header name for API key authentication.
pub(crate) const API_KEY_HEADER: &str = "X-ModelRelay-Api-Key";

/// Content type of every streaming endpoint.
pub(crate) const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

mod aggregate;
mod client;
mod core;
mod errors;
mod http;
mod identifiers;
mod ndjson;
pub mod plugins;
mod responses;
mod runs;
mod stream_timeout;
mod telemetry;
pub mod testing;
pub mod tools;
mod types;
pub mod workflow;

pub use aggregate::{ResponseMetrics, StreamAggregator};
pub use client::{Client, Config};
pub use errors::{
    APIError, Error, FieldError, Result, RetryMetadata, TransportError, TransportErrorKind,
    ValidationError,
};
pub use http::{HeaderEntry, HeaderList, ResponseOptions, RetryConfig};
pub use identifiers::ProviderId;
pub use ndjson::StreamHandle;
pub use plugins::{
    PluginError, PluginRunConfig, PluginRunError, PluginRunResult, PluginRunner, ToolBridge,
};
pub use responses::{ResponseBuilder, ResponsesClient};
pub use runs::{
    RunEventStreamHandle, RunsClient, RunsCreateResponse, RunsGetResponse, RunsToolResultItemV0,
    RunsToolResultsRequest, RunsToolResultsResponse,
};
pub use stream_timeout::{
    StreamTimeoutError, StreamTimeoutKind, StreamTimeoutMonitor, StreamTimeouts,
};
pub use telemetry::{
    HttpRequestMetrics, MetricsCallbacks, RequestContext, StreamFirstTokenMetrics,
    TokenUsageMetrics,
};
pub use tools::{
    sync_handler, BoxFuture, ToolCallAccumulator, ToolExecutionResult, ToolHandler, ToolRegistry,
    UnknownToolError,
};
pub use types::{
    ContentPart, FunctionCall, FunctionCallDelta, FunctionTool, InputItem, MessageRole,
    OutputItem, Response, ResponseRequest, StopReason, StreamErrorPayload, StreamEvent,
    StreamEventKind, Tool, ToolCall, ToolCallDelta, ToolType, Usage,
};
pub use workflow::{
    ArtifactKey, EdgeV0, EnvelopeVersion, ExecutionV0, ModelId, NodeErrorV0, NodeId, NodeTypeV0,
    NodeV0, NodeWaitingV0, OutputRefV0, PendingToolCallV0, PlanHash, RequestId, RunCostSummaryV0,
    RunEventPayload, RunEventV0, RunId, RunStatusV0, ToolCallId, ToolName, WorkflowKind,
    WorkflowSpecV0,
};
