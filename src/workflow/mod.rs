//! Workflow types for ModelRelay workflow runs.
//!
//! - **[`ids`]** - Identifier types (RunId, NodeId, PlanHash, etc.)
//! - **[`spec`]** - Workflow specification types (WorkflowSpecV0, NodeV0, etc.)
//! - **[`run`]** - Run status and result types (RunStatusV0, NodeResultV0, etc.)
//! - **[`events`]** - Event types for run streaming (RunEventV0, etc.)
//!
//! ## Example
//!
//! ```ignore
//! use modelrelay_runs::workflow::{NodeId, RunEventV0, RunId};
//!
//! let node_id: NodeId = "summarize".into();
//! let event: RunEventV0 = serde_json::from_str(line)?;
//! event.validate()?;
//! println!("run {} seq {}", event.run_id(), event.seq());
//! ```

pub mod events;
pub mod ids;
pub mod run;
pub mod spec;

// ============================================================================
// Re-exports from identifiers
// ============================================================================

pub use crate::identifiers::ProviderId;

// ============================================================================
// Re-exports from ids
// ============================================================================

pub use ids::{
    ArtifactKey, ModelId, NodeId, PlanHash, RequestId, RunId, Sha256Hash, ToolCallId, ToolName,
};

// ============================================================================
// Re-exports from spec
// ============================================================================

pub use spec::{
    EdgeV0, ExecutionV0, NodeTypeV0, NodeV0, OutputRefV0, WorkflowKind, WorkflowSpecV0,
};

// ============================================================================
// Re-exports from run
// ============================================================================

pub use run::{
    NodeErrorV0, NodeResultV0, NodeStatusV0, PayloadInfoV0, RunCostLineItemV0, RunCostSummaryV0,
    RunStatusV0,
};

// ============================================================================
// Re-exports from events
// ============================================================================

pub use events::{
    EnvelopeVersion, NodeDeltaKindV0, NodeLLMCallV0, NodeOutputDeltaV0, NodeToolCallV0,
    NodeToolResultV0, NodeWaitingV0, PendingToolCallV0, RunEventEnvelope, RunEventPayload,
    RunEventV0, TokenUsageV0, ToolCallV0,
};
