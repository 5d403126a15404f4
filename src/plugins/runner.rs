use std::collections::HashSet;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{PluginError, PluginRunConfig, PluginRunError, PluginRunResult, ToolBridge};
use crate::{
    client::Client,
    errors::Error,
    runs::RunsClient,
    stream_timeout::StreamTimeoutMonitor,
    workflow::{
        NodeErrorV0, PlanHash, RunEventPayload, RunEventV0, RunId, RunStatusV0, ToolCallId,
        WorkflowSpecV0,
    },
};

/// Creates runs and drives them to a terminal state.
#[derive(Clone)]
pub struct PluginRunner {
    client: Client,
}

/// What the dispatcher decided about one event.
enum Step {
    Continue,
    Done(Result<PluginRunResult, PluginError>),
}

/// State owned by a single `wait` call.
struct WaitSession {
    run_id: RunId,
    expected_plan: Option<PlanHash>,
    last_seq: u64,
    handled: HashSet<ToolCallId>,
    events: Vec<RunEventV0>,
}

impl PluginRunner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Submits `spec` and waits for the run, pinning the plan hash returned by
    /// create.
    pub async fn run(
        &self,
        spec: &WorkflowSpecV0,
        config: &PluginRunConfig,
    ) -> Result<PluginRunResult, PluginError> {
        let cancel = child_token(config);
        let runs = self.client.runs();
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Canceled.into()),
            created = runs.create(spec) => created?,
        };
        self.drive(created.run_id, Some(created.plan_hash), config, cancel)
            .await
    }

    /// Follows an existing run until it succeeds, fails or is canceled.
    ///
    /// The first plan hash observed on the stream becomes the expected one.
    pub async fn wait(
        &self,
        run_id: RunId,
        config: &PluginRunConfig,
    ) -> Result<PluginRunResult, PluginError> {
        self.drive(run_id, None, config, child_token(config)).await
    }

    /// Like [`PluginRunner::wait`], but fails on any event whose plan hash
    /// differs from `plan_hash`.
    pub async fn wait_for_plan(
        &self,
        run_id: RunId,
        plan_hash: PlanHash,
        config: &PluginRunConfig,
    ) -> Result<PluginRunResult, PluginError> {
        self.drive(run_id, Some(plan_hash), config, child_token(config))
            .await
    }

    async fn drive(
        &self,
        run_id: RunId,
        expected_plan: Option<PlanHash>,
        config: &PluginRunConfig,
        cancel: CancellationToken,
    ) -> Result<PluginRunResult, PluginError> {
        let monitor = StreamTimeoutMonitor::start(config.stream_timeouts, &cancel);
        let canceled = || -> PluginError {
            match monitor.error() {
                Some(err) => Error::StreamTimeout(err).into(),
                None => Error::Canceled.into(),
            }
        };
        let runs = self.client.runs();
        let bridge = config
            .tool_registry
            .clone()
            .map(|registry| ToolBridge::new(runs.clone(), registry));
        let mut session = WaitSession {
            run_id,
            expected_plan,
            last_seq: config.after_seq,
            handled: HashSet::new(),
            events: Vec::new(),
        };

        loop {
            if cancel.is_cancelled() {
                return Err(canceled());
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(run_id = %run_id, after_seq = session.last_seq, "opening run event stream");
            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(canceled()),
                stream = runs.stream_events(run_id, session.last_seq) => stream?,
            };

            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(canceled()),
                    item = stream.next() => item,
                };
                let Some(item) = item else {
                    break;
                };
                let event = item?;
                monitor.signal_activity();
                monitor.signal_first_content();

                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(canceled()),
                    step = session.accept(event, &runs, bridge.as_ref()) => step?,
                };
                if let Step::Done(outcome) = step {
                    return outcome;
                }
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(
                run_id = %run_id,
                last_seq = session.last_seq,
                delay_ms = config.reconnect_delay.as_millis() as u64,
                "run event stream ended before a terminal event; reconnecting"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(canceled()),
                _ = tokio::time::sleep(config.reconnect_delay) => {}
            }
        }
    }
}

impl WaitSession {
    /// Applies one event: dedupe by sequence, plan hash check, then dispatch.
    async fn accept(
        &mut self,
        event: RunEventV0,
        runs: &RunsClient,
        bridge: Option<&ToolBridge>,
    ) -> Result<Step, PluginError> {
        if event.seq() <= self.last_seq {
            return Ok(Step::Continue);
        }
        self.last_seq = event.seq();
        if let Some(received) = event.payload.plan_hash() {
            self.check_plan(received)?;
        }
        self.events.push(event.clone());

        match event.payload {
            RunEventPayload::RunCompleted { .. } => {
                let snapshot = runs.get(self.run_id).await?;
                self.check_plan(&snapshot.plan_hash)?;
                #[cfg(feature = "tracing")]
                tracing::debug!(run_id = %self.run_id, status = %snapshot.status, "run completed");
                Ok(Step::Done(Ok(PluginRunResult {
                    run_id: snapshot.run_id,
                    status: snapshot.status,
                    outputs: snapshot.outputs,
                    cost_summary: snapshot.cost_summary,
                    events: std::mem::take(&mut self.events),
                })))
            }
            RunEventPayload::RunFailed { error, .. } => {
                Ok(Step::Done(Err(self.run_error(RunStatusV0::Failed, Some(error)))))
            }
            RunEventPayload::RunCanceled { error, .. } => {
                Ok(Step::Done(Err(self.run_error(RunStatusV0::Canceled, Some(error)))))
            }
            RunEventPayload::NodeWaiting { node_id, waiting } => {
                let bridge = bridge.ok_or_else(|| {
                    PluginError::Config(
                        "tool registry required for client tool execution".to_string(),
                    )
                })?;
                bridge
                    .handle_waiting(self.run_id, &node_id, &waiting, &mut self.handled)
                    .await?;
                Ok(Step::Continue)
            }
            RunEventPayload::NodeToolResult { tool_result, .. } => {
                self.handled.insert(tool_result.tool_call.id);
                Ok(Step::Continue)
            }
            RunEventPayload::RunCompiled { .. }
            | RunEventPayload::RunStarted { .. }
            | RunEventPayload::NodeStarted { .. }
            | RunEventPayload::NodeSucceeded { .. }
            | RunEventPayload::NodeFailed { .. }
            | RunEventPayload::NodeLLMCall { .. }
            | RunEventPayload::NodeToolCall { .. }
            | RunEventPayload::NodeOutputDelta { .. }
            | RunEventPayload::NodeOutput { .. }
            | RunEventPayload::Unknown => Ok(Step::Continue),
        }
    }

    fn check_plan(&mut self, received: &PlanHash) -> Result<(), PluginError> {
        match &self.expected_plan {
            Some(expected) if expected != received => Err(Error::PlanHashMismatch {
                expected: expected.clone(),
                received: received.clone(),
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                self.expected_plan = Some(received.clone());
                Ok(())
            }
        }
    }

    fn run_error(&mut self, status: RunStatusV0, error: Option<NodeErrorV0>) -> PluginError {
        #[cfg(feature = "tracing")]
        tracing::warn!(run_id = %self.run_id, status = %status, error = ?error, "run ended without success");
        PluginRunError {
            run_id: self.run_id,
            status,
            error,
            events: std::mem::take(&mut self.events),
        }
        .into()
    }
}

fn child_token(config: &PluginRunConfig) -> CancellationToken {
    config
        .cancel
        .as_ref()
        .map_or_else(CancellationToken::new, CancellationToken::child_token)
}
