//! Workflow identifier types.
//!
//! - `RunId` - server-assigned identifier for a workflow run
//! - `PlanHash` - SHA-256 of the compiled plan, stable for the life of a run
//! - `NodeId` - identifier for a node within a workflow
//! - `RequestId` - identifier for a paused LLM request within a node
//! - `ToolCallId` / `ToolName` - identify a client-executed tool call
//! - `ArtifactKey` - key for node/run output artifacts

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identifiers::{hex_hash_32, string_id_type, uuid_id_type};

uuid_id_type!(RunId, "run_id");

string_id_type!(NodeId, "Identifier for a node within a workflow spec.");
string_id_type!(ModelId, "Identifier for an LLM model (e.g. \"claude-sonnet-4\").");
string_id_type!(
    RequestId,
    "Identifier of the paused LLM request that a tool result answers."
);
string_id_type!(ToolCallId, "Identifier of a single tool call.");
string_id_type!(ToolName, "Name of a client-executed tool (e.g. \"bash\").");

hex_hash_32!(PlanHash, "plan_hash");
hex_hash_32!(Sha256Hash, "sha256");

/// Artifact key type for node outputs and run outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub const NODE_OUTPUT_V0: &'static str = "node_output.v0";
    pub const RUN_OUTPUTS_V0: &'static str = "run_outputs.v0";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ArtifactKey {
    fn from(value: &str) -> Self {
        ArtifactKey::new(value)
    }
}

impl From<String> for ArtifactKey {
    fn from(value: String) -> Self {
        ArtifactKey::new(value)
    }
}

impl From<ArtifactKey> for String {
    fn from(value: ArtifactKey) -> Self {
        value.0
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
