//! Client-side tool handlers.
//!
//! A [`ToolRegistry`] maps tool names to async handlers. The run orchestrator
//! uses it to execute the tool calls a paused run is waiting on; the
//! [`ToolCallAccumulator`] rebuilds tool calls from streamed deltas.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::types::{FunctionCall, ToolCall, ToolCallDelta, ToolType};

/// Accumulates streaming tool call deltas into complete tool calls.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: HashMap<u32, ToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes a streaming tool call delta.
    /// Returns true if this started a new tool call.
    pub fn process_delta(&mut self, delta: &ToolCallDelta) -> bool {
        if let Some(existing) = self.calls.get_mut(&delta.index) {
            if let Some(func_delta) = &delta.function {
                let func = existing.function.get_or_insert_with(FunctionCall::default);
                if let Some(name) = &func_delta.name {
                    func.name = name.clone();
                }
                if let Some(args) = &func_delta.arguments {
                    func.arguments.push_str(args);
                }
            }
            if let Some(id) = delta.id.as_ref().filter(|id| !id.is_empty()) {
                existing.id = id.clone();
            }
            return false;
        }

        let function = delta.function.as_ref().map(|f| FunctionCall {
            name: f.name.clone().unwrap_or_default(),
            arguments: f.arguments.clone().unwrap_or_default(),
        });
        self.calls.insert(
            delta.index,
            ToolCall {
                id: delta.id.clone().unwrap_or_default(),
                kind: delta
                    .type_
                    .as_deref()
                    .map(ToolType::from_wire)
                    .unwrap_or_default(),
                function,
            },
        );
        true
    }

    /// Returns all accumulated tool calls in index order.
    pub fn get_tool_calls(&self) -> Vec<ToolCall> {
        let mut indexed: Vec<_> = self.calls.iter().collect();
        indexed.sort_by_key(|(idx, _)| **idx);
        indexed.into_iter().map(|(_, call)| call.clone()).collect()
    }

    pub fn get_tool_call(&self, index: u32) -> Option<&ToolCall> {
        self.calls.get(&index)
    }

    pub fn reset(&mut self) {
        self.calls.clear();
    }
}

/// Error returned when a tool is not found in the registry.
#[derive(Debug, Clone)]
pub struct UnknownToolError {
    pub tool_name: String,
    pub available: Vec<String>,
}

impl std::fmt::Display for UnknownToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.available.is_empty() {
            write!(
                f,
                "unknown tool: '{}'. No tools registered.",
                self.tool_name
            )
        } else {
            write!(
                f,
                "unknown tool: '{}'. Available: {}",
                self.tool_name,
                self.available.join(", ")
            )
        }
    }
}

impl std::error::Error for UnknownToolError {}

/// Result of executing a tool call.
#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ToolExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Text sent back to the server: `"Error: <message>"` on failure, a string
    /// result verbatim, any other JSON value serialized.
    pub fn output_text(&self) -> String {
        if let Some(error) = &self.error {
            return format!("Error: {error}");
        }
        match &self.result {
            Some(Value::String(s)) => s.clone(),
            Some(value) => serde_json::to_string(value)
                .unwrap_or_else(|err| format!("Error: failed to serialize tool result: {err}")),
            None => String::new(),
        }
    }
}

/// A boxed future type for async tool handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler function type for tool execution.
/// Receives parsed JSON arguments and the original tool call.
/// Returns a JSON-serializable result or an error message.
pub type ToolHandler =
    Arc<dyn Fn(Value, ToolCall) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Registry for mapping tool names to handler functions with automatic dispatch.
///
/// # Example
///
/// ```ignore
/// use modelrelay_runs::{tool_handler, ToolRegistry};
/// use serde_json::json;
///
/// let registry = ToolRegistry::new()
///     .register("fs.read_file", tool_handler!(|args, _call| async move {
///         let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
///         Ok(json!(std::fs::read_to_string(path).map_err(|e| e.to_string())?))
///     }));
/// ```
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.registered_tools())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler function for a tool name.
    /// Returns self for method chaining.
    pub fn register(mut self, name: impl Into<String>, handler: ToolHandler) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_mut(&mut self, name: impl Into<String>, handler: ToolHandler) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Returns true if the handler was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn registered_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Executes a single tool call. Never fails: unknown tools, malformed
    /// arguments and handler errors are reported in the result.
    pub async fn execute(&self, call: &ToolCall) -> ToolExecutionResult {
        let tool_name = call.name().to_string();
        let failed = |error: String| ToolExecutionResult {
            tool_call_id: call.id.clone(),
            tool_name: tool_name.clone(),
            result: None,
            error: Some(error),
        };

        let Some(handler) = self.handlers.get(&tool_name) else {
            return failed(
                UnknownToolError {
                    tool_name: tool_name.clone(),
                    available: self.registered_tools(),
                }
                .to_string(),
            );
        };

        let args: Value = match call.function.as_ref() {
            Some(f) if !f.arguments.trim().is_empty() => match serde_json::from_str(&f.arguments) {
                Ok(v) => v,
                Err(e) => return failed(format!("failed to parse tool arguments: {e}")),
            },
            _ => Value::Object(Default::default()),
        };

        match handler(args, call.clone()).await {
            Ok(result) => ToolExecutionResult {
                tool_call_id: call.id.clone(),
                tool_name: tool_name.clone(),
                result: Some(result),
                error: None,
            },
            Err(e) => failed(e),
        }
    }

    /// Executes tool calls one after another, preserving order.
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<ToolExecutionResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute(call).await);
        }
        results
    }
}

/// Helper macro to create a tool handler from an async closure.
///
/// ```ignore
/// let handler = tool_handler!(|args, call| async move {
///     Ok(serde_json::json!({ "echo": args }))
/// });
/// ```
#[macro_export]
macro_rules! tool_handler {
    ($closure:expr) => {{
        use std::sync::Arc;
        let handler: $crate::tools::ToolHandler =
            Arc::new(move |args, call| Box::pin($closure(args, call)));
        handler
    }};
}

/// Creates a tool handler from a synchronous function.
pub fn sync_handler<F>(f: F) -> ToolHandler
where
    F: Fn(Value, ToolCall) -> Result<Value, String> + Send + Sync + 'static,
{
    Arc::new(move |args, call| {
        let result = f(args, call);
        Box::pin(async move { result })
    })
}
