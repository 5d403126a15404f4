use std::{collections::HashSet, sync::Arc};

use crate::{
    errors::Result,
    runs::{RunsClient, RunsToolResultItemV0, RunsToolResultsRequest},
    tools::ToolRegistry,
    types::ToolCall,
    workflow::{NodeId, NodeWaitingV0, RunId, ToolCallId},
};

/// Executes the tool calls a waiting node is blocked on and posts the results.
///
/// The `handled` set passed to [`ToolBridge::handle_waiting`] belongs to the
/// caller; a call id is added only after its result was accepted, so a failed
/// submission leaves the batch eligible on redelivery.
#[derive(Clone)]
pub struct ToolBridge {
    runs: RunsClient,
    registry: Arc<ToolRegistry>,
}

impl ToolBridge {
    pub fn new(runs: RunsClient, registry: Arc<ToolRegistry>) -> Self {
        Self { runs, registry }
    }

    /// Services one `node_waiting` event. Returns the number of results submitted.
    pub async fn handle_waiting(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        waiting: &NodeWaitingV0,
        handled: &mut HashSet<ToolCallId>,
    ) -> Result<usize> {
        if waiting.pending_tool_calls.is_empty()
            || waiting.request_id.is_empty()
            || waiting.step < 0
        {
            return Ok(0);
        }

        let mut batch: HashSet<&ToolCallId> = HashSet::new();
        let mut results = Vec::new();
        for pending in &waiting.pending_tool_calls {
            let id = &pending.tool_call_id;
            if id.is_empty() || handled.contains(id) || !batch.insert(id) {
                continue;
            }
            let call = ToolCall::function(
                id.as_str(),
                pending.name.as_str(),
                pending.arguments.as_str(),
            );
            let exec = self.registry.execute(&call).await;
            #[cfg(feature = "tracing")]
            {
                if let Some(err) = &exec.error {
                    tracing::debug!(tool_call_id = %id, tool = %pending.name, error = %err, "tool handler failed");
                }
            }
            results.push(RunsToolResultItemV0 {
                tool_call_id: id.clone(),
                name: pending.name.clone(),
                output: exec.output_text(),
            });
        }
        if results.is_empty() {
            return Ok(0);
        }

        let submitted: Vec<ToolCallId> = results.iter().map(|r| r.tool_call_id.clone()).collect();
        let count = submitted.len();
        #[cfg(feature = "tracing")]
        tracing::debug!(
            run_id = %run_id,
            node_id = %node_id,
            step = waiting.step,
            results = count,
            "submitting tool results"
        );
        self.runs
            .submit_tool_results(
                run_id,
                RunsToolResultsRequest {
                    node_id: node_id.clone(),
                    step: waiting.step,
                    request_id: waiting.request_id.clone(),
                    results,
                },
            )
            .await?;
        handled.extend(submitted);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockBuilder, MockServer, ResponseTemplate};

    use super::*;
    use crate::{testing::test_client, tools::sync_handler, workflow::PendingToolCallV0};

    const RUN_ID: &str = "11111111-1111-1111-1111-111111111111";

    fn bridge(server: &MockServer, calls: Arc<AtomicUsize>) -> ToolBridge {
        let registry = ToolRegistry::new().register(
            "bash",
            sync_handler(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("ok"))
            }),
        );
        ToolBridge::new(test_client(&server.uri()).runs(), Arc::new(registry))
    }

    fn waiting(step: i64, request_id: &str, ids: &[&str]) -> NodeWaitingV0 {
        NodeWaitingV0 {
            step,
            request_id: request_id.into(),
            pending_tool_calls: ids
                .iter()
                .map(|id| PendingToolCallV0 {
                    tool_call_id: (*id).into(),
                    name: "bash".into(),
                    arguments: "{}".into(),
                })
                .collect(),
            reason: "client_tool_execution".into(),
        }
    }

    fn tool_results_mock() -> MockBuilder {
        Mock::given(method("POST")).and(path(format!("/runs/{RUN_ID}/tool-results")))
    }

    #[tokio::test]
    async fn unusable_batches_are_skipped() {
        let server = MockServer::start().await;
        tool_results_mock()
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let calls = Arc::new(AtomicUsize::new(0));
        let bridge = bridge(&server, calls.clone());
        let run_id: RunId = RUN_ID.parse().unwrap();
        let node: NodeId = "n1".into();
        let mut handled = HashSet::new();

        for batch in [
            waiting(-1, "r1", &["tc1"]),
            waiting(0, "  ", &["tc1"]),
            waiting(0, "r1", &[]),
            waiting(0, "r1", &["", " "]),
        ] {
            let submitted = bridge
                .handle_waiting(run_id, &node, &batch, &mut handled)
                .await
                .unwrap();
            assert_eq!(submitted, 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(handled.is_empty());
    }

    #[tokio::test]
    async fn handled_and_repeated_ids_are_not_rerun() {
        let server = MockServer::start().await;
        tool_results_mock()
            .and(body_json(json!({
                "node_id": "n1",
                "step": 3,
                "request_id": "r1",
                "results": [{"tool_call_id": "tc1", "name": "bash", "output": "ok"}]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"accepted": 1, "status": "running"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        let calls = Arc::new(AtomicUsize::new(0));
        let bridge = bridge(&server, calls.clone());
        let mut handled: HashSet<ToolCallId> = HashSet::from(["tc2".into()]);

        let submitted = bridge
            .handle_waiting(
                RUN_ID.parse().unwrap(),
                &"n1".into(),
                &waiting(3, "r1", &["", "tc1", "tc1", "tc2"]),
                &mut handled,
            )
            .await
            .unwrap();
        assert_eq!(submitted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handled.contains(&ToolCallId::from("tc1")));
        assert_eq!(handled.len(), 2);
    }

    #[tokio::test]
    async fn failed_submission_leaves_ids_unhandled() {
        let server = MockServer::start().await;
        tool_results_mock()
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let calls = Arc::new(AtomicUsize::new(0));
        let bridge = bridge(&server, calls.clone());
        let mut handled = HashSet::new();

        let err = bridge
            .handle_waiting(
                RUN_ID.parse().unwrap(),
                &"n1".into(),
                &waiting(0, "r1", &["tc1"]),
                &mut handled,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::errors::Error::Api(ref api) if api.status == 503), "got {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handled.is_empty());
    }
}
