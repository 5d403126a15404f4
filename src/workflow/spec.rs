//! Workflow specification types.
//!
//! A `WorkflowSpecV0` is produced by a builder and submitted once to
//! `POST /runs`. The client never interprets node inputs; it only checks the
//! structural invariants the server would otherwise reject.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::NodeId;
use crate::errors::ValidationError;

/// Workflow specification version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowKind {
    #[serde(rename = "workflow.v0")]
    WorkflowV0,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::WorkflowV0 => "workflow.v0",
        }
    }
}

/// Node type within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeTypeV0 {
    #[serde(rename = "llm.responses")]
    LlmResponses,
    #[serde(rename = "join.all")]
    JoinAll,
    #[serde(rename = "join.any")]
    JoinAny,
    #[serde(rename = "join.collect")]
    JoinCollect,
    #[serde(rename = "transform.json")]
    TransformJson,
    #[serde(rename = "map.fanout")]
    MapFanout,
}

impl NodeTypeV0 {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeTypeV0::LlmResponses => "llm.responses",
            NodeTypeV0::JoinAll => "join.all",
            NodeTypeV0::JoinAny => "join.any",
            NodeTypeV0::JoinCollect => "join.collect",
            NodeTypeV0::TransformJson => "transform.json",
            NodeTypeV0::MapFanout => "map.fanout",
        }
    }
}

/// Workflow specification (v0).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSpecV0 {
    pub kind: WorkflowKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionV0>,
    pub nodes: Vec<NodeV0>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<EdgeV0>>,
    pub outputs: Vec<OutputRefV0>,
}

/// Execution configuration for a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionV0 {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<i64>,
}

/// A node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeV0 {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeTypeV0,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// An edge connecting two nodes in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeV0 {
    pub from: NodeId,
    pub to: NodeId,
}

/// Reference to a workflow output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputRefV0 {
    pub name: String,
    pub from: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

impl WorkflowSpecV0 {
    /// Checks node id uniqueness and that every edge and output resolves.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.nodes.is_empty() {
            return Err(ValidationError::new("at least one node is required").with_field("nodes"));
        }

        let mut ids = HashSet::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(
                    ValidationError::new("node id is required").with_field(format!("nodes[{idx}].id"))
                );
            }
            if !ids.insert(node.id.as_str()) {
                return Err(ValidationError::new(format!("duplicate node id {:?}", node.id.as_str()))
                    .with_field(format!("nodes[{idx}].id")));
            }
        }

        for (idx, edge) in self.edges.iter().flatten().enumerate() {
            for (end, id) in [("from", &edge.from), ("to", &edge.to)] {
                if !ids.contains(id.as_str()) {
                    return Err(ValidationError::new(format!("unknown node {:?}", id.as_str()))
                        .with_field(format!("edges[{idx}].{end}")));
                }
            }
        }

        let mut names = HashSet::with_capacity(self.outputs.len());
        for (idx, output) in self.outputs.iter().enumerate() {
            if output.name.trim().is_empty() {
                return Err(ValidationError::new("output name is required")
                    .with_field(format!("outputs[{idx}].name")));
            }
            if !names.insert(output.name.as_str()) {
                return Err(ValidationError::new(format!("duplicate output {:?}", output.name))
                    .with_field(format!("outputs[{idx}].name")));
            }
            if !ids.contains(output.from.as_str()) {
                return Err(ValidationError::new(format!("unknown node {:?}", output.from.as_str()))
                    .with_field(format!("outputs[{idx}].from")));
            }
            if let Some(pointer) = &output.pointer {
                if !pointer.is_empty() && !pointer.starts_with('/') {
                    return Err(ValidationError::new("pointer must be a JSON pointer")
                        .with_field(format!("outputs[{idx}].pointer")));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn node(id: &str, node_type: NodeTypeV0) -> NodeV0 {
        NodeV0 {
            id: id.into(),
            node_type,
            input: None,
        }
    }

    fn two_node_spec() -> WorkflowSpecV0 {
        WorkflowSpecV0 {
            kind: WorkflowKind::WorkflowV0,
            name: Some("fanout".into()),
            execution: None,
            nodes: vec![
                node("agent", NodeTypeV0::LlmResponses),
                node("join", NodeTypeV0::JoinCollect),
            ],
            edges: Some(vec![EdgeV0 {
                from: "agent".into(),
                to: "join".into(),
            }]),
            outputs: vec![OutputRefV0 {
                name: "result".into(),
                from: "join".into(),
                pointer: Some("/text".into()),
            }],
        }
    }

    #[test]
    fn valid_spec_passes() {
        two_node_spec().validate().expect("valid spec");
    }

    #[test]
    fn serializes_kind_and_node_types_as_literals() {
        let value = serde_json::to_value(two_node_spec()).unwrap();
        assert_eq!(value["kind"], json!("workflow.v0"));
        assert_eq!(value["nodes"][0]["type"], json!("llm.responses"));
        assert_eq!(value["nodes"][1]["type"], json!("join.collect"));
        assert!(value.get("execution").is_none());
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let mut spec = two_node_spec();
        spec.nodes.push(node("agent", NodeTypeV0::MapFanout));
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("nodes[2].id"));
    }

    #[test]
    fn rejects_blank_node_id() {
        let mut spec = two_node_spec();
        spec.nodes[0].id = "  ".into();
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("nodes[0].id"));
    }

    #[test]
    fn rejects_dangling_edge() {
        let mut spec = two_node_spec();
        spec.edges = Some(vec![EdgeV0 {
            from: "agent".into(),
            to: "missing".into(),
        }]);
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("edges[0].to"));
    }

    #[test]
    fn rejects_output_from_unknown_node() {
        let mut spec = two_node_spec();
        spec.outputs[0].from = "ghost".into();
        let err = spec.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("outputs[0].from"));
    }

    #[test]
    fn rejects_relative_pointer() {
        let mut spec = two_node_spec();
        spec.outputs[0].pointer = Some("text".into());
        assert!(spec.validate().is_err());
    }
}
