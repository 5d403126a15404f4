//! Drives workflow runs to completion on the client side.
//!
//! [`PluginRunner`] follows a run's event log across reconnects and, when the
//! server pauses a node on client tool calls, executes them through a
//! [`ToolRegistry`] via the [`ToolBridge`] and posts the results back.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::Error as SdkError,
    stream_timeout::StreamTimeouts,
    tools::ToolRegistry,
    workflow::{NodeErrorV0, RunCostSummaryV0, RunEventV0, RunId, RunStatusV0},
};

mod bridge;
mod runner;

pub use bridge::ToolBridge;
pub use runner::PluginRunner;

/// Delay before reopening an event stream that ended without a terminal event.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct PluginRunConfig {
    /// Handlers for client-side tool calls. Required once a node waits on tools.
    pub tool_registry: Option<Arc<ToolRegistry>>,
    /// External cancellation for the whole wait.
    pub cancel: Option<CancellationToken>,
    /// Optional deadlines on the run event stream, spanning reconnects.
    pub stream_timeouts: StreamTimeouts,
    pub reconnect_delay: Duration,
    /// Resume the event log after this sequence number (0 = from the start).
    pub after_seq: u64,
}

impl Default for PluginRunConfig {
    fn default() -> Self {
        Self {
            tool_registry: None,
            cancel: None,
            stream_timeouts: StreamTimeouts::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            after_seq: 0,
        }
    }
}

impl fmt::Debug for PluginRunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRunConfig")
            .field("tool_registry", &self.tool_registry)
            .field("cancel", &self.cancel.as_ref().map(|c| c.is_cancelled()))
            .field("stream_timeouts", &self.stream_timeouts)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("after_seq", &self.after_seq)
            .finish()
    }
}

impl PluginRunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool_registry(mut self, registry: impl Into<Arc<ToolRegistry>>) -> Self {
        self.tool_registry = Some(registry.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub fn with_stream_timeouts(mut self, timeouts: StreamTimeouts) -> Self {
        self.stream_timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_after_seq(mut self, after_seq: u64) -> Self {
        self.after_seq = after_seq;
        self
    }
}

/// A run that reached `succeeded`.
#[derive(Debug, Clone)]
pub struct PluginRunResult {
    pub run_id: RunId,
    pub status: RunStatusV0,
    pub outputs: HashMap<String, Value>,
    pub cost_summary: RunCostSummaryV0,
    /// Every event accepted during the wait, in sequence order.
    pub events: Vec<RunEventV0>,
}

/// A run that ended `failed` or `canceled` on the server.
#[derive(Debug, Clone, Error)]
#[error("plugin run {status} ({run_id}){}", .error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
pub struct PluginRunError {
    pub run_id: RunId,
    pub status: RunStatusV0,
    pub error: Option<NodeErrorV0>,
    pub events: Vec<RunEventV0>,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin config: {0}")]
    Config(String),
    #[error("{0}")]
    Sdk(#[from] SdkError),
    #[error("{0}")]
    Run(#[from] PluginRunError),
}

impl PluginError {
    /// The underlying SDK error, if any.
    pub fn sdk(&self) -> Option<&SdkError> {
        match self {
            PluginError::Sdk(err) => Some(err),
            _ => None,
        }
    }
}
