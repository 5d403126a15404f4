//! Workflow run status and result types.
//!
//! - `RunStatusV0` - status of a workflow run
//! - `NodeStatusV0` - status of a node within a run
//! - `NodeErrorV0` - error information for a failed node or run
//! - `RunCostSummaryV0` / `RunCostLineItemV0` - cost accounting for a run
//! - `NodeResultV0` - per-node result in a run snapshot
//! - `PayloadInfoV0` - metadata about an output payload

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ModelId, NodeId, Sha256Hash};
use super::spec::NodeTypeV0;
use crate::identifiers::ProviderId;

/// Status of a workflow run.
///
/// `running` and `waiting` may alternate; the remaining states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatusV0 {
    Running,
    Waiting,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatusV0 {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatusV0::Running => "running",
            RunStatusV0::Waiting => "waiting",
            RunStatusV0::Succeeded => "succeeded",
            RunStatusV0::Failed => "failed",
            RunStatusV0::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatusV0::Succeeded | RunStatusV0::Failed | RunStatusV0::Canceled
        )
    }
}

impl fmt::Display for RunStatusV0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatusV0 {
    Pending,
    Running,
    Waiting,
    Succeeded,
    Failed,
    Canceled,
}

/// Error information for a failed node or run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeErrorV0 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl fmt::Display for NodeErrorV0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Metadata about a payload (node output or run outputs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadInfoV0 {
    pub bytes: u64,
    pub sha256: Sha256Hash,
    pub included: bool,
}

/// One billed line in a run's cost summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunCostLineItemV0 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelId>,
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub usd_cents: i64,
}

/// Cost summary for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunCostSummaryV0 {
    #[serde(default)]
    pub total_usd_cents: i64,
    #[serde(default)]
    pub line_items: Vec<RunCostLineItemV0>,
}

/// Result of a node as reported in a run snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeResultV0 {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeTypeV0,
    pub status: NodeStatusV0,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeErrorV0>,
}
