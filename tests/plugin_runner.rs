use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use modelrelay_runs::testing::{ndjson_body, run_event_line, test_client};
use modelrelay_runs::{
    sync_handler, Error, NodeTypeV0, NodeV0, OutputRefV0, PluginError, PluginRunConfig,
    PluginRunner, RunEventPayload, RunId, RunStatusV0, StreamTimeoutKind, StreamTimeouts,
    ToolRegistry, WorkflowKind, WorkflowSpecV0,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RUN_ID: &str = "11111111-1111-1111-1111-111111111111";
const PLAN_HASH: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
const OTHER_PLAN_HASH: &str = "fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210";

fn run_id() -> RunId {
    RUN_ID.parse().unwrap()
}

fn spec() -> WorkflowSpecV0 {
    WorkflowSpecV0 {
        kind: WorkflowKind::WorkflowV0,
        name: None,
        execution: None,
        nodes: vec![NodeV0 {
            id: "n1".into(),
            node_type: NodeTypeV0::LlmResponses,
            input: Some(json!({"request": {"input": []}, "tool_execution": {"mode": "client"}})),
        }],
        edges: None,
        outputs: vec![OutputRefV0 {
            name: "result".into(),
            from: "n1".into(),
            pointer: None,
        }],
    }
}

fn waiting_line(seq: u64, calls: &[(&str, &str)]) -> String {
    let pending: Vec<Value> = calls
        .iter()
        .map(|(id, name)| json!({"tool_call_id": id, "name": name, "arguments": "{\"cmd\":\"ls\"}"}))
        .collect();
    run_event_line(
        RUN_ID,
        seq,
        json!({
            "type": "node_waiting",
            "node_id": "n1",
            "waiting": {
                "step": 0,
                "request_id": "r1",
                "pending_tool_calls": pending,
                "reason": "client_tool_execution"
            }
        }),
    )
}

fn completed_line(seq: u64) -> String {
    run_event_line(
        RUN_ID,
        seq,
        json!({
            "type": "run_completed",
            "plan_hash": PLAN_HASH,
            "outputs_artifact_key": "run_outputs.v0",
            "outputs_info": {
                "bytes": 12,
                "sha256": "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                "included": false
            }
        }),
    )
}

fn events_response(lines: &[String]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(ndjson_body(lines), "application/x-ndjson")
}

fn events_path() -> String {
    format!("/runs/{RUN_ID}/events")
}

async fn mount_snapshot(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("/runs/{RUN_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "run_id": RUN_ID,
            "status": "succeeded",
            "plan_hash": PLAN_HASH,
            "cost_summary": {"total_usd_cents": 3, "line_items": []},
            "nodes": [],
            "outputs": {"result": "\"ok\""}
        })))
        .mount(server)
        .await;
}

async fn mount_tool_results(server: &MockServer, results: Value, times: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/runs/{RUN_ID}/tool-results")))
        .and(body_json(json!({
            "node_id": "n1",
            "step": 0,
            "request_id": "r1",
            "results": results
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"accepted": 1, "status": "running"})),
        )
        .expect(times)
        .mount(server)
        .await;
}

fn counting_registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
    ToolRegistry::new().register(
        "bash",
        sync_handler(move |_args, _call| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("ok"))
        }),
    )
}

fn config(registry: Option<ToolRegistry>) -> PluginRunConfig {
    let cfg = PluginRunConfig::new().with_reconnect_delay(Duration::from_millis(10));
    match registry {
        Some(registry) => cfg.with_tool_registry(registry),
        None => cfg,
    }
}

#[tokio::test]
async fn run_services_waiting_node_and_completes_after_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/runs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "run_id": RUN_ID,
            "status": "running",
            "plan_hash": PLAN_HASH
        })))
        .expect(1)
        .mount(&server)
        .await;
    // A duplicate line with the same seq is dropped without dispatch.
    Mock::given(method("GET"))
        .and(path(events_path()))
        .and(query_param_is_missing("after_seq"))
        .respond_with(events_response(&[
            waiting_line(1, &[("tc1", "bash")]),
            waiting_line(1, &[("tc1", "bash")]),
        ]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .and(query_param("after_seq", "1"))
        .respond_with(events_response(&[completed_line(2)]))
        .expect(1)
        .mount(&server)
        .await;
    mount_tool_results(
        &server,
        json!([{"tool_call_id": "tc1", "name": "bash", "output": "ok"}]),
        1,
    )
    .await;
    mount_snapshot(&server).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let runner = PluginRunner::new(test_client(&server.uri()));
    let result = runner
        .run(&spec(), &config(Some(counting_registry(calls.clone()))))
        .await
        .expect("run should succeed");

    assert_eq!(result.run_id, run_id());
    assert_eq!(result.status, RunStatusV0::Succeeded);
    assert_eq!(result.outputs.get("result"), Some(&json!("\"ok\"")));
    assert_eq!(result.cost_summary.total_usd_cents, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let seqs: Vec<u64> = result.events.iter().map(|e| e.seq()).collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn redelivered_waiting_after_empty_session_does_not_rerun_tools() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .and(query_param_is_missing("after_seq"))
        .respond_with(events_response(&[waiting_line(1, &[("tc1", "bash")])]))
        .expect(1)
        .mount(&server)
        .await;
    // Second session closes with zero events.
    Mock::given(method("GET"))
        .and(path(events_path()))
        .and(query_param("after_seq", "1"))
        .respond_with(events_response(&[]))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    // Third session redelivers tc1 alongside a new call.
    Mock::given(method("GET"))
        .and(path(events_path()))
        .and(query_param("after_seq", "1"))
        .respond_with(events_response(&[
            waiting_line(2, &[("tc1", "bash"), ("tc2", "bash"), ("tc2", "bash")]),
            completed_line(3),
        ]))
        .expect(1)
        .mount(&server)
        .await;
    mount_tool_results(
        &server,
        json!([{"tool_call_id": "tc1", "name": "bash", "output": "ok"}]),
        1,
    )
    .await;
    mount_tool_results(
        &server,
        json!([{"tool_call_id": "tc2", "name": "bash", "output": "ok"}]),
        1,
    )
    .await;
    mount_snapshot(&server).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let result = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(Some(counting_registry(calls.clone()))))
        .await
        .expect("run should succeed");
    assert_eq!(result.status, RunStatusV0::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tool_result_events_mark_calls_handled() {
    let server = MockServer::start().await;
    let tool_result = run_event_line(
        RUN_ID,
        1,
        json!({
            "type": "node_tool_result",
            "node_id": "n1",
            "tool_result": {
                "step": 0,
                "request_id": "r1",
                "tool_call": {"id": "tc1", "name": "bash"},
                "output": "done elsewhere"
            }
        }),
    );
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[
            tool_result,
            waiting_line(2, &[("tc1", "bash")]),
            completed_line(3),
        ]))
        .expect(1)
        .mount(&server)
        .await;
    mount_tool_results(&server, json!([]), 0).await;
    mount_snapshot(&server).await;

    let calls = Arc::new(AtomicUsize::new(0));
    PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(Some(counting_registry(calls.clone()))))
        .await
        .expect("run should succeed");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handler_errors_are_submitted_as_output() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[
            waiting_line(1, &[("tc1", "bash"), ("tc2", "missing_tool")]),
            completed_line(2),
        ]))
        .mount(&server)
        .await;
    mount_tool_results(
        &server,
        json!([
            {"tool_call_id": "tc1", "name": "bash", "output": "Error: permission denied"},
            {
                "tool_call_id": "tc2",
                "name": "missing_tool",
                "output": "Error: unknown tool: 'missing_tool'. Available: bash"
            }
        ]),
        1,
    )
    .await;
    mount_snapshot(&server).await;

    let registry = ToolRegistry::new().register(
        "bash",
        sync_handler(|_, _| Err("permission denied".to_string())),
    );
    PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(Some(registry)))
        .await
        .expect("run should succeed");
}

#[tokio::test]
async fn failed_run_returns_run_error_with_events() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[
            run_event_line(RUN_ID, 1, json!({"type": "run_started", "plan_hash": PLAN_HASH})),
            run_event_line(
                RUN_ID,
                2,
                json!({
                    "type": "run_failed",
                    "plan_hash": PLAN_HASH,
                    "error": {"code": "node_failed", "message": "n1 blew up"}
                }),
            ),
        ]))
        .mount(&server)
        .await;

    let err = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(None))
        .await
        .unwrap_err();
    match err {
        PluginError::Run(run_err) => {
            assert_eq!(run_err.status, RunStatusV0::Failed);
            assert_eq!(run_err.error.map(|e| e.message).as_deref(), Some("n1 blew up"));
            assert_eq!(run_err.events.len(), 2);
        }
        other => panic!("expected run error, got {other:?}"),
    }
}

#[tokio::test]
async fn canceled_run_returns_run_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[run_event_line(
            RUN_ID,
            1,
            json!({
                "type": "run_canceled",
                "plan_hash": PLAN_HASH,
                "error": {"message": "canceled by user"}
            }),
        )]))
        .mount(&server)
        .await;

    let err = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(None))
        .await
        .unwrap_err();
    assert!(
        matches!(err, PluginError::Run(ref e) if e.status == RunStatusV0::Canceled),
        "got {err:?}"
    );
}

#[tokio::test]
async fn waiting_without_registry_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[waiting_line(1, &[("tc1", "bash")])]))
        .expect(1)
        .mount(&server)
        .await;
    mount_tool_results(&server, json!([]), 0).await;

    let err = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(None))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Config(_)), "got {err:?}");
}

#[tokio::test]
async fn empty_waiting_event_is_ignored() {
    let server = MockServer::start().await;
    let empty_waiting = run_event_line(
        RUN_ID,
        1,
        json!({"type": "node_waiting", "node_id": "n1", "waiting": {}}),
    );
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[empty_waiting, completed_line(2)]))
        .mount(&server)
        .await;
    mount_tool_results(&server, json!([]), 0).await;
    mount_snapshot(&server).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let result = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(Some(counting_registry(calls.clone()))))
        .await
        .expect("run should succeed");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        result.events[0].payload,
        RunEventPayload::NodeWaiting { .. }
    ));
}

#[tokio::test]
async fn plan_hash_drift_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/runs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "run_id": RUN_ID,
            "status": "running",
            "plan_hash": PLAN_HASH
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[run_event_line(
            RUN_ID,
            1,
            json!({"type": "run_started", "plan_hash": OTHER_PLAN_HASH}),
        )]))
        .expect(1)
        .mount(&server)
        .await;

    let err = PluginRunner::new(test_client(&server.uri()))
        .run(&spec(), &config(None))
        .await
        .unwrap_err();
    match err {
        PluginError::Sdk(Error::PlanHashMismatch { expected, received }) => {
            assert_eq!(expected.to_string(), PLAN_HASH);
            assert_eq!(received.to_string(), OTHER_PLAN_HASH);
        }
        other => panic!("expected plan hash mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn resumes_from_configured_after_seq() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .and(query_param("after_seq", "10"))
        .respond_with(events_response(&[completed_line(11)]))
        .expect(1)
        .mount(&server)
        .await;
    mount_snapshot(&server).await;

    let result = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(None).with_after_seq(10))
        .await
        .expect("run should succeed");
    assert_eq!(result.events.len(), 1);
    assert_eq!(result.events[0].seq(), 11);
}

#[tokio::test]
async fn external_cancel_aborts_pending_read() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[]).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        PluginRunner::new(test_client(&server.uri()))
            .wait(run_id(), &config(None).with_cancel(cancel)),
    )
    .await
    .expect("cancellation should return promptly")
    .unwrap_err();
    assert!(matches!(err, PluginError::Sdk(Error::Canceled)), "got {err:?}");
}

#[tokio::test]
async fn run_stream_ttft_timeout_cancels_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[]).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let cfg = config(None)
        .with_stream_timeouts(StreamTimeouts::new().with_ttft(Duration::from_millis(50)));
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        PluginRunner::new(test_client(&server.uri())).wait(run_id(), &cfg),
    )
    .await
    .expect("timeout should return promptly")
    .unwrap_err();
    match err {
        PluginError::Sdk(Error::StreamTimeout(te)) => assert_eq!(te.kind, StreamTimeoutKind::Ttft),
        other => panic!("expected ttft timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn long_replay_in_one_body_is_consumed() {
    let server = MockServer::start().await;
    let mut lines: Vec<String> = (1..=20_000)
        .map(|seq| run_event_line(RUN_ID, seq, json!({"type": "node_started", "node_id": "n1"})))
        .collect();
    lines.push(completed_line(20_001));
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&lines))
        .expect(1)
        .mount(&server)
        .await;
    mount_snapshot(&server).await;

    let result = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(None))
        .await
        .expect("replay should be consumed");
    assert_eq!(result.events.len(), 20_001);
    assert_eq!(result.events.last().map(|e| e.seq()), Some(20_001));
}

#[tokio::test]
async fn failed_tool_submission_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[waiting_line(1, &[("tc1", "bash")])]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/runs/{RUN_ID}/tool-results")))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": {"code": "unavailable", "message": "try again"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let err = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(Some(counting_registry(calls.clone()))))
        .await
        .unwrap_err();
    match err {
        PluginError::Sdk(Error::Api(api)) => {
            assert_eq!(api.status, 503);
            assert_eq!(api.code.as_deref(), Some("unavailable"));
        }
        other => panic!("expected api error, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_envelope_mid_stream_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(events_path()))
        .respond_with(events_response(&[
            run_event_line(RUN_ID, 1, json!({"type": "run_started", "plan_hash": PLAN_HASH})),
            "{\"seq\": \"oops\"}".to_string(),
            completed_line(2),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let err = PluginRunner::new(test_client(&server.uri()))
        .wait(run_id(), &config(None))
        .await
        .unwrap_err();
    assert!(
        matches!(err, PluginError::Sdk(Error::StreamProtocol { .. })),
        "got {err:?}"
    );
}
