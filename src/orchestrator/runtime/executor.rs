use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::error::RunError;
use super::stream::{DeliveryMode, EventSink, RunEvents};
use crate::llm::{CompletionProvider, CompletionRequest, Fragment, ProviderError};
use crate::mcp::{ToolError, ToolGateway};
use crate::normalized::RunEvent;
use crate::orchestrator::catalog::AgentCatalog;
use crate::orchestrator::domain::{
    AgentConfig, Message, Run, RunStatus, Step, StepStatus, ToolCall, TransitionError,
};
use crate::orchestrator::persistence::RunStore;

pub const DEFAULT_PROVIDER_BUDGET: Duration = Duration::from_secs(120);
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorLimits {
    /// Wall-clock budget for one provider call, first fragment to last.
    pub provider_budget: Duration,
    /// Capacity of the channel between the run task and its caller.
    pub event_buffer: usize,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            provider_budget: DEFAULT_PROVIDER_BUDGET,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// How a step stopped short of completion. Carries the step when it was
/// already persisted so it can be closed together with the run.
#[derive(Debug)]
enum Interrupt {
    Cancelled(Option<Step>),
    Failed(Option<Step>, RunError),
}

/// Drives a queued run to a terminal state.
///
/// One task per run. Events go to the caller through [`RunEvents`]; the
/// execution trace goes to the [`RunStore`].
#[derive(Debug, Clone)]
pub struct RunExecutor {
    catalog: Arc<AgentCatalog>,
    provider: Arc<dyn CompletionProvider>,
    store: Arc<dyn RunStore>,
    tools: Arc<ToolGateway>,
    limits: ExecutorLimits,
}

impl RunExecutor {
    pub fn new(
        catalog: Arc<AgentCatalog>,
        provider: Arc<dyn CompletionProvider>,
        store: Arc<dyn RunStore>,
        tools: Arc<ToolGateway>,
    ) -> Self {
        Self {
            catalog,
            provider,
            store,
            tools,
            limits: ExecutorLimits::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ExecutorLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> ExecutorLimits {
        self.limits
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Start executing `run`. Cancel through `cancel`, or by dropping the
    /// returned handle.
    pub fn execute(&self, run: Run, mode: DeliveryMode, cancel: CancellationToken) -> RunEvents {
        self.launch(run, mode, cancel, None).0
    }

    pub(crate) fn launch(
        &self,
        run: Run,
        mode: DeliveryMode,
        cancel: CancellationToken,
        observers: Option<broadcast::Sender<RunEvent>>,
    ) -> (RunEvents, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.limits.event_buffer.max(1));
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let run_id = run.id.clone();
        let this = self.clone();

        let handle = tokio::spawn(async move {
            let sink = EventSink::new(tx, mode, observers, cancel);
            let outcome = this.drive(run, &sink).await;
            // Closing the channel before the outcome lets readers drain first.
            drop(sink);
            let _ = outcome_tx.send(outcome);
        });

        (RunEvents::new(run_id, mode, rx, outcome_rx), handle)
    }

    #[instrument(
        name = "run.execute",
        skip_all,
        fields(run_id = %run.id, agent_id = %run.agent_id, mode = ?sink.mode())
    )]
    async fn drive(&self, mut run: Run, sink: &EventSink) -> Result<RunStatus, RunError> {
        if run.status != RunStatus::Queued {
            return Err(RunError::InvalidState {
                run_id: run.id,
                status: run.status,
            });
        }

        let Some(agent) = self.catalog.resolve(&run.agent_id).cloned() else {
            let err = RunError::AgentNotFound(run.agent_id.clone());
            tracing::warn!(name: "run.agent_not_found", "Run references an unknown agent");
            self.settle_failure(run, None, &err, sink).await;
            return Err(err);
        };

        if sink.is_interrupted() {
            return self.settle_cancelled(run, None, sink).await;
        }

        run.start().map_err(invariant)?;
        if let Err(e) = self.store.mark_running(&run).await {
            let err = RunError::execution(&e);
            tracing::error!(name: "run.start_failed", error = %err, "Could not mark run as running");
            self.settle_failure(run, None, &err, sink).await;
            return Err(err);
        }
        tracing::info!(name: "run.started", provider = self.provider.name(), "Run started");

        if sink
            .emit(RunEvent::RunStarted {
                run_id: run.id.clone(),
                agent_id: agent.id.clone(),
            })
            .await
            .is_err()
        {
            return self.settle_cancelled(run, None, sink).await;
        }

        match self.run_step(&mut run, &agent, sink).await {
            Ok(content) => {
                tracing::info!(name: "run.completed", chars = content.len(), "Run completed");
                // Committed: a late cancel no longer suppresses the terminal event.
                sink.deliver(RunEvent::RunCompleted {
                    run_id: run.id.clone(),
                    message: content,
                })
                .await;
                Ok(RunStatus::Completed)
            }
            Err(Interrupt::Cancelled(step)) => self.settle_cancelled(run, step, sink).await,
            Err(Interrupt::Failed(step, err)) => {
                tracing::warn!(name: "run.failed", error = %err, "Run failed");
                self.settle_failure(run, step, &err, sink).await;
                Err(err)
            }
        }
    }

    /// The single step of a run: snapshot context, call the provider,
    /// accumulate, then commit step, reply and run together.
    async fn run_step(
        &self,
        run: &mut Run,
        agent: &AgentConfig,
        sink: &EventSink,
    ) -> Result<String, Interrupt> {
        let history = self
            .store
            .list_messages(&run.conversation_id)
            .await
            .map_err(|e| Interrupt::Failed(None, RunError::execution(&e)))?;

        let snapshot = json!({
            "messages": history
                .iter()
                .map(|m| json!({ "role": m.role, "content": m.content }))
                .collect::<Vec<_>>(),
        });
        let mut step = Step::pending(&run.id, 1, &agent.id, snapshot);
        step.dispatch()
            .map_err(|e| Interrupt::Failed(None, invariant(e)))?;

        if sink.is_interrupted() {
            return Err(Interrupt::Cancelled(None));
        }
        self.store
            .insert_step(&step)
            .await
            .map_err(|e| Interrupt::Failed(None, RunError::execution(&e)))?;
        tracing::debug!(name: "step.started", step_id = %step.id, "Step dispatched");

        if sink
            .emit(RunEvent::StepStarted {
                step_id: step.id.clone(),
                agent_id: agent.id.clone(),
            })
            .await
            .is_err()
        {
            return Err(Interrupt::Cancelled(Some(step)));
        }

        let request = CompletionRequest::for_agent(agent, &history, sink.mode().is_incremental());
        let budget = self.limits.provider_budget;
        let deadline = Instant::now() + budget;

        let mut fragments = tokio::select! {
            biased;
            () = sink.interrupted() => return Err(Interrupt::Cancelled(Some(step))),
            res = timeout_at(deadline, self.provider.complete(request)) => match res {
                Err(_) => return Err(Interrupt::Failed(Some(step), RunError::BudgetExceeded(budget))),
                Ok(Err(e)) => return Err(Interrupt::Failed(Some(step), provider_failure(&e, budget))),
                Ok(Ok(fragments)) => fragments,
            },
        };

        let mut content = String::new();
        loop {
            let next = tokio::select! {
                biased;
                () = sink.interrupted() => return Err(Interrupt::Cancelled(Some(step))),
                next = timeout_at(deadline, fragments.next()) => next,
            };
            match next {
                Err(_) => {
                    return Err(Interrupt::Failed(Some(step), RunError::BudgetExceeded(budget)));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(Interrupt::Failed(Some(step), provider_failure(&e, budget)));
                }
                Ok(Some(Ok(fragment))) => {
                    if matches!(fragment, Fragment::Restart(_)) {
                        content.clear();
                    }
                    let delta = fragment.into_text();
                    content.push_str(&delta);
                    if sink
                        .emit(RunEvent::ModelDelta { delta })
                        .await
                        .is_err()
                    {
                        return Err(Interrupt::Cancelled(Some(step)));
                    }
                }
            }
        }
        drop(fragments);

        if sink.is_interrupted() {
            return Err(Interrupt::Cancelled(Some(step)));
        }

        let mut done_step = step.clone();
        if let Err(e) = done_step.complete(json!({ "content": content })) {
            return Err(Interrupt::Failed(Some(step), invariant(e)));
        }
        let mut done_run = run.clone();
        if let Err(e) = done_run.complete() {
            return Err(Interrupt::Failed(Some(step), invariant(e)));
        }
        let reply = Message::assistant_reply(&run.conversation_id, &run.id, &agent.id, content.clone());

        if let Err(e) = self
            .store
            .commit_completion(&done_run, &done_step, &reply)
            .await
        {
            return Err(Interrupt::Failed(Some(step), RunError::execution(&e)));
        }
        *run = done_run;
        Ok(content)
    }

    /// Close the run (and its step) as failed, then tell the caller.
    async fn settle_failure(&self, mut run: Run, step: Option<Step>, err: &RunError, sink: &EventSink) {
        let message = err.to_string();
        if run.status == RunStatus::Queued {
            let _ = run.start();
        }
        if let Err(e) = run.fail(&message) {
            tracing::error!(name: "run.transition_rejected", error = %e, "Cannot fail run");
            return;
        }
        let step = step.map(|mut s| {
            if s.status == StepStatus::Running {
                let _ = s.fail(&message);
            }
            s
        });
        if let Err(e) = self.store.commit_terminal(&run, step.as_ref()).await {
            tracing::error!(name: "run.persist_failed", error = %format!("{e:#}"), "Could not record run failure");
        }
        let _ = sink
            .emit(RunEvent::RunFailed {
                run_id: run.id.clone(),
                error: message,
            })
            .await;
    }

    /// Close the run as cancelled. Steps have no cancelled state, so an
    /// open step is failed with a "cancelled" reason. Never writes a reply.
    async fn settle_cancelled(
        &self,
        mut run: Run,
        step: Option<Step>,
        sink: &EventSink,
    ) -> Result<RunStatus, RunError> {
        run.cancel().map_err(invariant)?;
        let step = step.map(|mut s| {
            if s.status == StepStatus::Running {
                let _ = s.fail("cancelled");
            }
            s
        });
        self.store
            .commit_terminal(&run, step.as_ref())
            .await
            .map_err(|e| RunError::execution(&e))?;
        tracing::info!(name: "run.cancelled", "Run cancelled");
        sink.notify(RunEvent::RunCancelled { run_id: run.id });
        Ok(RunStatus::Cancelled)
    }

    /// Invoke a tool inside a running step and record the call.
    ///
    /// The call is persisted as started before the tool runs and updated
    /// with exactly one of result or error afterwards. Allowlist denials and
    /// tool failures are recorded on the call, not returned as errors.
    #[instrument(name = "tool.invoke", skip(self, step, arguments), fields(step_id = %step.id))]
    pub async fn invoke_tool(
        &self,
        step: &Step,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCall, RunError> {
        if step.status != StepStatus::Running {
            return Err(RunError::Execution(format!(
                "step {} is {}, tools run only inside a running step",
                step.id, step.status
            )));
        }

        let mut call = ToolCall::begin(&step.id, tool_name, arguments.clone());
        self.store
            .save_tool_call(&call)
            .await
            .map_err(|e| RunError::execution(&e))?;

        if self.tools.is_allowed(&step.agent_id, tool_name) {
            match self.tools.invoke(tool_name, arguments).await {
                Ok(result) => call.succeed(result),
                Err(e) => call.fail(e.to_string()),
            }
        } else {
            call.fail(
                ToolError::NotAllowed {
                    agent_id: step.agent_id.clone(),
                    tool: tool_name.to_string(),
                }
                .to_string(),
            );
        }

        if let Some(error) = &call.error {
            tracing::warn!(name: "tool.failed", tool = tool_name, error = %error, "Tool call failed");
        }
        self.store
            .save_tool_call(&call)
            .await
            .map_err(|e| RunError::execution(&e))?;
        Ok(call)
    }
}

/// Provider errors that reach the executor are unrecoverable. A timeout
/// means the budget ran out underneath us.
fn provider_failure(err: &ProviderError, budget: Duration) -> RunError {
    if err.is_timeout() {
        RunError::BudgetExceeded(budget)
    } else {
        RunError::Execution(err.to_string())
    }
}

fn invariant(err: TransitionError) -> RunError {
    RunError::Execution(err.to_string())
}
