//! Workflow run event types.
//!
//! Every line of `GET /runs/{id}/events` is one `RunEventV0`: a common
//! envelope (`envelope_version`, `run_id`, `seq`, `ts`) flattened together with
//! a payload discriminated by `type`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ArtifactKey, ModelId, NodeId, PlanHash, RequestId, RunId, ToolCallId, ToolName};
use super::run::{NodeErrorV0, PayloadInfoV0};
use crate::errors::ValidationError;
use crate::identifiers::ProviderId;

/// Envelope version for run events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeVersion {
    #[serde(rename = "v0")]
    #[default]
    V0,
}

impl EnvelopeVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeVersion::V0 => "v0",
        }
    }
}

impl fmt::Display for EnvelopeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of streaming delta emitted by an `llm.responses` node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeDeltaKindV0 {
    MessageStart,
    MessageDelta,
    MessageStop,
    ToolUseStart,
    ToolUseDelta,
    ToolUseStop,
    #[serde(other)]
    Unknown,
}

/// Delta output from a streaming node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeOutputDeltaV0 {
    pub kind: NodeDeltaKindV0,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelId>,
}

/// Token usage for an LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsageV0 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// LLM call event data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeLLMCallV0 {
    pub step: i64,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsageV0>,
}

/// Tool call reference (arguments optional).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallV0 {
    pub id: ToolCallId,
    pub name: ToolName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Tool call event data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeToolCallV0 {
    pub step: i64,
    pub request_id: RequestId,
    pub tool_call: ToolCallV0,
}

/// Tool result event data, echoed by the server once a result is recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeToolResultV0 {
    pub step: i64,
    pub request_id: RequestId,
    pub tool_call: ToolCallV0,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tool call the server is waiting on the client to execute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingToolCallV0 {
    pub tool_call_id: ToolCallId,
    pub name: ToolName,
    /// JSON-encoded arguments, as produced by the model.
    #[serde(default)]
    pub arguments: String,
}

/// Node waiting event data.
///
/// Fields default when absent so that a stale or partial event reaches the
/// tool bridge, which decides to skip it, instead of failing the stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeWaitingV0 {
    #[serde(default)]
    pub step: i64,
    #[serde(default)]
    pub request_id: RequestId,
    #[serde(default)]
    pub pending_tool_calls: Vec<PendingToolCallV0>,
    #[serde(default)]
    pub reason: String,
}

/// Common envelope fields for all run events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEventEnvelope {
    #[serde(default)]
    pub envelope_version: EnvelopeVersion,
    pub run_id: RunId,
    pub seq: u64,
    pub ts: DateTime<Utc>,
}

/// Event-specific payload data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RunEventPayload {
    #[serde(rename = "run_compiled")]
    RunCompiled { plan_hash: PlanHash },

    #[serde(rename = "run_started")]
    RunStarted { plan_hash: PlanHash },

    #[serde(rename = "run_completed")]
    RunCompleted {
        plan_hash: PlanHash,
        outputs_artifact_key: ArtifactKey,
        outputs_info: PayloadInfoV0,
    },

    #[serde(rename = "run_failed")]
    RunFailed {
        plan_hash: PlanHash,
        error: NodeErrorV0,
    },

    #[serde(rename = "run_canceled")]
    RunCanceled {
        plan_hash: PlanHash,
        error: NodeErrorV0,
    },

    #[serde(rename = "node_started")]
    NodeStarted { node_id: NodeId },

    #[serde(rename = "node_succeeded")]
    NodeSucceeded { node_id: NodeId },

    #[serde(rename = "node_failed")]
    NodeFailed { node_id: NodeId, error: NodeErrorV0 },

    #[serde(rename = "node_llm_call")]
    NodeLLMCall {
        node_id: NodeId,
        llm_call: NodeLLMCallV0,
    },

    #[serde(rename = "node_tool_call")]
    NodeToolCall {
        node_id: NodeId,
        tool_call: NodeToolCallV0,
    },

    #[serde(rename = "node_tool_result")]
    NodeToolResult {
        node_id: NodeId,
        tool_result: NodeToolResultV0,
    },

    #[serde(rename = "node_waiting")]
    NodeWaiting {
        node_id: NodeId,
        waiting: NodeWaitingV0,
    },

    #[serde(rename = "node_output_delta")]
    NodeOutputDelta {
        node_id: NodeId,
        delta: NodeOutputDeltaV0,
    },

    #[serde(rename = "node_output")]
    NodeOutput {
        node_id: NodeId,
        artifact_key: ArtifactKey,
        output_info: PayloadInfoV0,
    },

    /// Event type introduced after this client was built.
    #[serde(rename = "unknown", other)]
    Unknown,
}

impl RunEventPayload {
    /// Wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            RunEventPayload::RunCompiled { .. } => "run_compiled",
            RunEventPayload::RunStarted { .. } => "run_started",
            RunEventPayload::RunCompleted { .. } => "run_completed",
            RunEventPayload::RunFailed { .. } => "run_failed",
            RunEventPayload::RunCanceled { .. } => "run_canceled",
            RunEventPayload::NodeStarted { .. } => "node_started",
            RunEventPayload::NodeSucceeded { .. } => "node_succeeded",
            RunEventPayload::NodeFailed { .. } => "node_failed",
            RunEventPayload::NodeLLMCall { .. } => "node_llm_call",
            RunEventPayload::NodeToolCall { .. } => "node_tool_call",
            RunEventPayload::NodeToolResult { .. } => "node_tool_result",
            RunEventPayload::NodeWaiting { .. } => "node_waiting",
            RunEventPayload::NodeOutputDelta { .. } => "node_output_delta",
            RunEventPayload::NodeOutput { .. } => "node_output",
            RunEventPayload::Unknown => "unknown",
        }
    }

    /// Plan hash carried by run-level events.
    pub fn plan_hash(&self) -> Option<&PlanHash> {
        match self {
            RunEventPayload::RunCompiled { plan_hash }
            | RunEventPayload::RunStarted { plan_hash }
            | RunEventPayload::RunCompleted { plan_hash, .. }
            | RunEventPayload::RunFailed { plan_hash, .. }
            | RunEventPayload::RunCanceled { plan_hash, .. } => Some(plan_hash),
            _ => None,
        }
    }

    /// Node the event refers to, for node-level events.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            RunEventPayload::NodeStarted { node_id }
            | RunEventPayload::NodeSucceeded { node_id }
            | RunEventPayload::NodeFailed { node_id, .. }
            | RunEventPayload::NodeLLMCall { node_id, .. }
            | RunEventPayload::NodeToolCall { node_id, .. }
            | RunEventPayload::NodeToolResult { node_id, .. }
            | RunEventPayload::NodeWaiting { node_id, .. }
            | RunEventPayload::NodeOutputDelta { node_id, .. }
            | RunEventPayload::NodeOutput { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEventPayload::RunCompleted { .. }
                | RunEventPayload::RunFailed { .. }
                | RunEventPayload::RunCanceled { .. }
        )
    }
}

/// A run event with envelope metadata and payload.
///
/// ```ignore
/// match &event.payload {
///     RunEventPayload::NodeWaiting { node_id, waiting } => { /* run tools */ }
///     RunEventPayload::RunCompleted { .. } => { /* fetch outputs */ }
///     _ => {}
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEventV0 {
    #[serde(flatten)]
    pub envelope: RunEventEnvelope,
    #[serde(flatten)]
    pub payload: RunEventPayload,
}

impl RunEventV0 {
    pub fn run_id(&self) -> &RunId {
        &self.envelope.run_id
    }

    /// Resumption key: strictly increasing per run.
    pub fn seq(&self) -> u64 {
        self.envelope.seq
    }

    pub fn ts(&self) -> DateTime<Utc> {
        self.envelope.ts
    }

    /// Validates envelope and payload invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.envelope.seq < 1 {
            return Err(ValidationError::new("run event seq must be >= 1").with_field("seq"));
        }
        if self.envelope.run_id.is_nil() {
            return Err(ValidationError::new("run event run_id is required").with_field("run_id"));
        }

        match &self.payload {
            RunEventPayload::NodeOutput { output_info, .. } if output_info.included => {
                Err(ValidationError::new("node_output output_info.included must be false")
                    .with_field("output_info.included"))
            }
            RunEventPayload::RunCompleted { outputs_info, .. } if outputs_info.included => {
                Err(
                    ValidationError::new("run_completed outputs_info.included must be false")
                        .with_field("outputs_info.included"),
                )
            }
            _ => Ok(()),
        }
    }
}
