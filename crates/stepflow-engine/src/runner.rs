use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepflow_core::config::AppConfig;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::EventBus;
use stepflow_core::types::{
    FailureInfo, Message, RequestInfoMessage, RequestResponse, RunId, RunState, WorkflowEvent,
};

use crate::checkpoint::CheckpointManager;
use crate::graph::{Outgoing, Workflow, WorkflowContext};
use crate::snapshot::{Delivery, RunSnapshot};

/// Per-run execution limits and checkpoint policy.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Fail the run once this many supersteps have executed. `None` = unbounded.
    pub max_supersteps: Option<usize>,
    /// Fail a handler invocation that runs longer than this.
    pub handler_timeout: Option<Duration>,
    /// Checkpoint at the end of every superstep, not only on suspension.
    pub checkpoint_every_superstep: bool,
}

impl RunOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_supersteps: config.engine.max_supersteps,
            handler_timeout: config.engine.handler_timeout(),
            checkpoint_every_superstep: config.checkpoint.every_superstep,
        }
    }
}

/// Where a run stopped and what it produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: RunState,
    pub outputs: Vec<Message>,
    /// Requests waiting for an answer; non-empty only when awaiting input.
    pub pending_requests: Vec<RequestInfoMessage>,
    pub failure: Option<FailureInfo>,
    /// Most recent checkpoint taken for this run, if any.
    pub checkpoint_id: Option<String>,
    /// Supersteps executed since the run started.
    pub supersteps: usize,
}

impl RunOutcome {
    /// Display text of the last output.
    pub fn output_text(&self) -> Option<String> {
        self.outputs.last().map(Message::to_display_string)
    }

    pub fn is_failed(&self) -> bool {
        self.state == RunState::Failed
    }
}

/// Creates and resumes runs of one workflow.
///
/// The workflow is shared; every run gets its own queue and state, so many
/// runs can execute concurrently without interfering.
#[derive(Clone)]
pub struct WorkflowRunner {
    workflow: Arc<Workflow>,
    checkpoints: Option<CheckpointManager>,
    event_bus: Arc<EventBus>,
    options: RunOptions,
}

impl WorkflowRunner {
    pub fn new(workflow: impl Into<Arc<Workflow>>) -> Self {
        Self {
            workflow: workflow.into(),
            checkpoints: None,
            event_bus: Arc::new(EventBus::default()),
            options: RunOptions::default(),
        }
    }

    pub fn with_checkpointing(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_config(self, config: &AppConfig) -> Self {
        self.with_options(RunOptions::from_config(config))
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Create a run with `input` queued for the start executor. Nothing
    /// executes until the run is driven.
    pub fn start(&self, input: impl Into<Message>) -> WorkflowRun {
        let snapshot = RunSnapshot::new(
            self.workflow.id(),
            self.workflow.start_executor_id(),
            input.into(),
        );
        self.attach(snapshot, None)
    }

    /// Start a run and drive it until it completes, idles, fails or suspends.
    pub async fn run(&self, input: impl Into<Message>) -> Result<RunOutcome> {
        self.start(input).run_until_suspended().await
    }

    /// Rebuild a run from a checkpoint. Fails without creating a run if the
    /// checkpoint is unknown or belongs to another workflow.
    pub async fn resume(&self, checkpoint_id: &str) -> Result<WorkflowRun> {
        let manager = self.checkpoints.as_ref().ok_or_else(|| {
            StepflowError::InvalidRunState("runner has no checkpoint storage".into())
        })?;
        let checkpoint = manager.load(checkpoint_id).await?;
        if checkpoint.workflow_id != self.workflow.id() {
            return Err(StepflowError::WorkflowMismatch {
                expected: self.workflow.id().to_string(),
                found: checkpoint.workflow_id,
            });
        }
        info!(
            checkpoint_id,
            run_id = %checkpoint.snapshot.run_id,
            state = %checkpoint.snapshot.state,
            superstep = checkpoint.snapshot.superstep,
            "Resuming run from checkpoint"
        );
        Ok(self.attach(checkpoint.snapshot, Some(checkpoint.checkpoint_id)))
    }

    /// Adopt an in-memory snapshot as a live run.
    pub fn restore(&self, snapshot: RunSnapshot) -> Result<WorkflowRun> {
        if snapshot.workflow_id != self.workflow.id() {
            return Err(StepflowError::WorkflowMismatch {
                expected: self.workflow.id().to_string(),
                found: snapshot.workflow_id,
            });
        }
        Ok(self.attach(snapshot, None))
    }

    fn attach(&self, snapshot: RunSnapshot, last_checkpoint: Option<String>) -> WorkflowRun {
        WorkflowRun {
            workflow: self.workflow.clone(),
            snapshot,
            checkpoints: self.checkpoints.clone(),
            event_bus: self.event_bus.clone(),
            options: self.options.clone(),
            cancel: CancellationToken::new(),
            last_checkpoint,
        }
    }
}

/// Side effects collected over one superstep.
#[derive(Default)]
struct StepEffects {
    next: VecDeque<Delivery>,
    produced_output: bool,
    checkpoint_requested: bool,
}

/// What went wrong inside a superstep.
struct StepFailure {
    executor_id: Option<String>,
    message: Option<Message>,
    error: StepflowError,
}

/// A single live run: the superstep loop plus its snapshot.
///
/// Handlers of one run never execute concurrently; independent runs are
/// fully isolated.
pub struct WorkflowRun {
    workflow: Arc<Workflow>,
    snapshot: RunSnapshot,
    checkpoints: Option<CheckpointManager>,
    event_bus: Arc<EventBus>,
    options: RunOptions,
    cancel: CancellationToken,
    last_checkpoint: Option<String>,
}

impl fmt::Debug for WorkflowRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRun")
            .field("run_id", &self.snapshot.run_id)
            .field("workflow_id", &self.snapshot.workflow_id)
            .field("state", &self.snapshot.state)
            .field("superstep", &self.snapshot.superstep)
            .finish()
    }
}

impl WorkflowRun {
    pub fn run_id(&self) -> &RunId {
        &self.snapshot.run_id
    }

    pub fn state(&self) -> RunState {
        self.snapshot.state
    }

    pub fn snapshot(&self) -> &RunSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> RunSnapshot {
        self.snapshot
    }

    pub fn pending_requests(&self) -> Vec<RequestInfoMessage> {
        self.snapshot.pending_requests()
    }

    /// Id of the most recent checkpoint this run took, if any.
    pub fn last_checkpoint_id(&self) -> Option<&str> {
        self.last_checkpoint.as_deref()
    }

    /// Token that cancels this run, including any in-flight handler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Persist the current state under a new checkpoint id.
    pub async fn checkpoint(&mut self) -> Result<String> {
        let manager = self.checkpoints.as_ref().ok_or_else(|| {
            StepflowError::InvalidRunState("runner has no checkpoint storage".into())
        })?;
        let checkpoint_id = manager.save(&self.snapshot).await?;
        self.event_bus.publish(WorkflowEvent::CheckpointSaved {
            run_id: self.snapshot.run_id.clone(),
            checkpoint_id: checkpoint_id.clone(),
        });
        self.last_checkpoint = Some(checkpoint_id.clone());
        Ok(checkpoint_id)
    }

    /// Answer one outstanding request and continue the run.
    pub async fn send_response(
        &mut self,
        request_id: &str,
        data: impl Into<String>,
    ) -> Result<RunOutcome> {
        self.send_responses(vec![(request_id.to_string(), data.into())])
            .await
    }

    /// Answer several outstanding requests at once and continue the run.
    ///
    /// Every id is validated before any answer is applied, so an unknown or
    /// already-answered id leaves the run untouched. Answers are queued in the
    /// order the requests were issued.
    pub async fn send_responses(
        &mut self,
        answers: impl IntoIterator<Item = (String, String)>,
    ) -> Result<RunOutcome> {
        if self.snapshot.state.is_terminal() {
            return Err(StepflowError::InvalidRunState(format!(
                "run {} is {}",
                self.snapshot.run_id, self.snapshot.state
            )));
        }

        let mut ordered = Vec::new();
        for (request_id, data) in answers {
            let position = self.snapshot.requests.check_pending(&request_id)?;
            if ordered.iter().any(|(p, _, _)| *p == position) {
                return Err(StepflowError::UnknownOrAnsweredRequest(request_id));
            }
            ordered.push((position, request_id, data));
        }
        ordered.sort_by_key(|(position, _, _)| *position);

        for (_, request_id, data) in ordered {
            let answered = self.snapshot.requests.answer(&request_id)?;
            let target = answered.request.source_executor.clone();
            info!(request_id = %request_id, target = %target, "Request answered");
            self.snapshot.queue.push_back(Delivery {
                source: Some(answered.sink),
                target,
                message: Message::Response(RequestResponse {
                    request_id: request_id.clone(),
                    request: answered.request,
                    data,
                }),
                fan_in: false,
            });
            self.event_bus.publish(WorkflowEvent::RequestAnswered {
                run_id: self.snapshot.run_id.clone(),
                request_id,
            });
        }

        self.run_until_suspended().await
    }

    /// Drive supersteps until the run completes, idles, fails or has to wait
    /// for a human answer.
    ///
    /// Handler failures are reported through the outcome, not as `Err`;
    /// `Err` means the engine itself could not proceed (e.g. checkpoint I/O).
    pub async fn run_until_suspended(&mut self) -> Result<RunOutcome> {
        if self.snapshot.state.is_terminal() {
            return Ok(self.outcome());
        }

        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id: self.snapshot.run_id.clone(),
            workflow_id: self.snapshot.workflow_id.clone(),
        });
        info!(
            run_id = %self.snapshot.run_id,
            workflow_id = %self.snapshot.workflow_id,
            superstep = self.snapshot.superstep,
            queued = self.snapshot.queue.len(),
            "Run started"
        );

        loop {
            if self.cancel.is_cancelled() {
                self.fail(StepFailure {
                    executor_id: None,
                    message: None,
                    error: StepflowError::Cancelled,
                });
                break;
            }

            if self.snapshot.queue.is_empty() {
                if self.snapshot.requests.has_pending() {
                    if self.snapshot.state != RunState::AwaitingInput {
                        self.set_state(RunState::AwaitingInput);
                        for request in self.snapshot.pending_requests() {
                            self.event_bus.publish(WorkflowEvent::RequestInfo {
                                run_id: self.snapshot.run_id.clone(),
                                request,
                            });
                        }
                        if self.checkpoints.is_some() {
                            self.checkpoint().await?;
                        }
                    }
                } else {
                    self.set_state(RunState::Idle);
                }
                break;
            }

            if let Some(max) = self.options.max_supersteps {
                if self.snapshot.superstep >= max {
                    warn!(run_id = %self.snapshot.run_id, max, "Superstep limit reached");
                    self.fail(StepFailure {
                        executor_id: None,
                        message: None,
                        error: StepflowError::SuperstepLimit(max),
                    });
                    break;
                }
            }

            self.set_state(RunState::Running);
            let effects = match self.superstep().await {
                Ok(effects) => effects,
                Err(failure) => {
                    self.fail(failure);
                    break;
                }
            };
            self.snapshot.queue = effects.next;

            if effects.produced_output {
                let abandoned = self.snapshot.requests.abandon_all();
                if abandoned > 0 {
                    debug!(abandoned, "Pending requests abandoned at completion");
                }
                self.set_state(RunState::Completed);
                break;
            }

            if self.checkpoints.is_some()
                && (effects.checkpoint_requested || self.options.checkpoint_every_superstep)
            {
                self.checkpoint().await?;
            }
        }

        Ok(self.outcome())
    }

    /// Execute one superstep: take the whole queue, dispatch it, and return
    /// what must run next.
    async fn superstep(&mut self) -> std::result::Result<StepEffects, StepFailure> {
        self.snapshot.superstep += 1;
        let superstep = self.snapshot.superstep;
        let batch: Vec<Delivery> = self.snapshot.queue.drain(..).collect();

        debug!(run_id = %self.snapshot.run_id, superstep, queued = batch.len(), "Superstep started");
        self.event_bus.publish(WorkflowEvent::SuperstepStarted {
            run_id: self.snapshot.run_id.clone(),
            superstep,
            queued: batch.len(),
        });

        let mut effects = StepEffects::default();
        for (target, deliveries) in group_by_target(batch) {
            for delivery in deliveries {
                if delivery.fan_in {
                    self.buffer_fan_in(delivery);
                    while let Some(aggregate) = self.take_fan_in_batch(&target) {
                        self.invoke(&target, aggregate, &mut effects).await?;
                    }
                } else {
                    self.invoke(&target, delivery.message, &mut effects).await?;
                }
            }
        }
        Ok(effects)
    }

    fn buffer_fan_in(&mut self, delivery: Delivery) {
        let source = delivery.source.unwrap_or_default();
        debug!(target = %delivery.target, source = %source, "Buffered fan-in delivery");
        self.snapshot
            .fan_in_buffers
            .entry(delivery.target)
            .or_default()
            .entry(source)
            .or_default()
            .push_back(delivery.message);
    }

    /// Pop one message per declared source once every source has delivered.
    fn take_fan_in_batch(&mut self, target: &str) -> Option<Message> {
        let sources = self.workflow.fan_in_sources(target)?;
        let buffers = self.snapshot.fan_in_buffers.get_mut(target)?;
        let complete = sources
            .iter()
            .all(|s| buffers.get(s).is_some_and(|q| !q.is_empty()));
        if !complete {
            return None;
        }
        let items: Vec<Message> = sources
            .iter()
            .filter_map(|s| buffers.get_mut(s).and_then(VecDeque::pop_front))
            .collect();
        buffers.retain(|_, q| !q.is_empty());
        if buffers.is_empty() {
            self.snapshot.fan_in_buffers.remove(target);
        }
        Some(Message::Batch(items))
    }

    /// Run one handler invocation and fold its effects into the run.
    async fn invoke(
        &mut self,
        target: &str,
        message: Message,
        effects: &mut StepEffects,
    ) -> std::result::Result<(), StepFailure> {
        let failure = |error: StepflowError, message: &Message| StepFailure {
            executor_id: Some(target.to_string()),
            message: Some(message.clone()),
            error,
        };

        let Some(executor) = self.workflow.executor(target).cloned() else {
            let err = StepflowError::InvalidRunState(format!("unknown executor '{}'", target));
            return Err(failure(err, &message));
        };
        let kind = message.kind();
        if !executor.accepts().contains(&kind) {
            let err = StepflowError::handler(target, format!("no handler for {} messages", kind));
            return Err(failure(err, &message));
        }

        debug!(run_id = %self.snapshot.run_id, executor_id = target, %kind, "Invoking executor");
        self.event_bus.publish(WorkflowEvent::ExecutorInvoked {
            run_id: self.snapshot.run_id.clone(),
            executor_id: target.to_string(),
            kind,
        });

        let shared = std::mem::take(&mut self.snapshot.shared_state);
        let local = self
            .snapshot
            .executor_states
            .remove(target)
            .unwrap_or_default();
        let mut ctx = WorkflowContext::new(
            target,
            self.snapshot.run_id.clone(),
            self.snapshot.superstep,
            shared,
            local,
            self.cancel.clone(),
        );

        let handler_timeout = self.options.handler_timeout;
        let cancel = self.cancel.clone();
        let result = {
            let handler = executor.handle(message.clone(), &mut ctx);
            let bounded = async {
                match handler_timeout {
                    Some(limit) => match tokio::time::timeout(limit, handler).await {
                        Ok(result) => result,
                        Err(_) => Err(StepflowError::handler(
                            target,
                            format!("timed out after {:?}", limit),
                        )),
                    },
                    None => handler.await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StepflowError::Cancelled),
                result = bounded => result,
            }
        };

        let parts = ctx.into_parts();
        self.snapshot.shared_state = parts.shared;
        if !parts.local.is_empty() {
            self.snapshot
                .executor_states
                .insert(target.to_string(), parts.local);
        }

        if let Err(err) = result {
            return Err(failure(err, &message));
        }

        for outgoing in parts.sent {
            self.route(target, outgoing, &mut effects.next)
                .map_err(|err| failure(err, &message))?;
        }

        for output in parts.outputs {
            info!(run_id = %self.snapshot.run_id, executor_id = target, "Output yielded");
            self.snapshot.outputs.push(output.clone());
            self.event_bus.publish(WorkflowEvent::Output {
                run_id: self.snapshot.run_id.clone(),
                executor_id: target.to_string(),
                data: output,
            });
            effects.produced_output = true;
        }

        for request in parts.requests {
            info!(
                run_id = %self.snapshot.run_id,
                request_id = %request.request_id,
                source = %request.source_executor,
                "Request parked for human input"
            );
            self.snapshot
                .requests
                .register(request, target)
                .map_err(|err| failure(err, &message))?;
        }

        effects.checkpoint_requested |= parts.checkpoint_requested;
        Ok(())
    }

    /// Turn one sent message into deliveries for the next superstep.
    fn route(
        &self,
        source: &str,
        outgoing: Outgoing,
        next: &mut VecDeque<Delivery>,
    ) -> Result<()> {
        let Outgoing { message, target } = outgoing;

        if let Some(target) = target {
            // Explicit targeting follows the declared edge but skips its guard.
            let edge = self
                .workflow
                .outgoing_edges(source)
                .find(|e| e.target == target)
                .ok_or_else(|| {
                    StepflowError::handler(source, format!("no edge from {} to {}", source, target))
                })?;
            next.push_back(Delivery {
                source: Some(source.to_string()),
                target,
                fan_in: edge.is_fan_in(),
                message,
            });
            return Ok(());
        }

        let mut routed = 0;
        for edge in self.workflow.outgoing_edges(source) {
            if edge.routes(&message) {
                next.push_back(Delivery {
                    source: Some(source.to_string()),
                    target: edge.target.clone(),
                    message: message.clone(),
                    fan_in: edge.is_fan_in(),
                });
                routed += 1;
            }
        }
        if routed == 0 {
            debug!(source, kind = %message.kind(), "No outgoing edge matched; message dropped");
        }
        Ok(())
    }

    fn fail(&mut self, failure: StepFailure) {
        let info = FailureInfo {
            executor_id: failure.executor_id,
            message: failure.message,
            error: failure.error.to_string(),
            superstep: self.snapshot.superstep,
            at: Utc::now(),
        };
        error!(
            run_id = %self.snapshot.run_id,
            executor_id = info.executor_id.as_deref().unwrap_or("-"),
            superstep = info.superstep,
            error = %info.error,
            "Run failed"
        );
        self.snapshot.requests.abandon_all();
        self.snapshot.failure = Some(info.clone());
        self.set_state(RunState::Failed);
        self.event_bus.publish(WorkflowEvent::RunFailed {
            run_id: self.snapshot.run_id.clone(),
            failure: info,
        });
    }

    fn set_state(&mut self, state: RunState) {
        if self.snapshot.state == state {
            return;
        }
        debug!(run_id = %self.snapshot.run_id, from = %self.snapshot.state, to = %state, "Run state changed");
        self.snapshot.state = state;
        self.event_bus.publish(WorkflowEvent::StatusChanged {
            run_id: self.snapshot.run_id.clone(),
            state,
        });
    }

    fn outcome(&self) -> RunOutcome {
        RunOutcome {
            run_id: self.snapshot.run_id.clone(),
            state: self.snapshot.state,
            outputs: self.snapshot.outputs.clone(),
            pending_requests: self.snapshot.pending_requests(),
            failure: self.snapshot.failure.clone(),
            checkpoint_id: self.last_checkpoint.clone(),
            supersteps: self.snapshot.superstep,
        }
    }
}

/// Group a superstep's deliveries by target, targets in order of first
/// appearance, deliveries in queue order.
fn group_by_target(batch: Vec<Delivery>) -> Vec<(String, Vec<Delivery>)> {
    let mut groups: Vec<(String, Vec<Delivery>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for delivery in batch {
        match index.get(&delivery.target) {
            Some(&i) => groups[i].1.push(delivery),
            None => {
                index.insert(delivery.target.clone(), groups.len());
                groups.push((delivery.target.clone(), vec![delivery]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FnExecutor, WorkflowBuilder};
    use crate::hitl::RequestInfoExecutor;
    use futures::future::BoxFuture;
    use stepflow_core::types::MessageKind;

    fn upper(m: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            ctx.send_message(m.as_text().unwrap_or_default().to_uppercase());
            Ok(())
        })
    }

    fn reverse(m: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            ctx.send_message(m.as_text().unwrap_or_default().chars().rev().collect::<String>());
            Ok(())
        })
    }

    fn emit(m: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            ctx.yield_output(m);
            Ok(())
        })
    }

    fn join(m: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Message::Batch(items) = m else {
                return Err(StepflowError::handler("join", "expected batch"));
            };
            let count = ctx.get_local("calls").and_then(|v| v.as_u64()).unwrap_or(0);
            ctx.set_local("calls", serde_json::json!(count + 1));
            let parts: Vec<String> = items.iter().map(Message::to_display_string).collect();
            ctx.yield_output(parts.join(" | "));
            Ok(())
        })
    }

    fn boom(_: Message, _: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(StepflowError::handler("boom", "kaboom")) })
    }

    fn forward(m: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            ctx.send_message(m);
            Ok(())
        })
    }

    fn hang(_: Message, _: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(futures::future::pending())
    }

    fn ask(m: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match m {
                Message::Text(text) => {
                    ctx.set_shared("draft", serde_json::json!(text));
                    ctx.request_info("request_info", RequestInfoMessage::new("Continue?"));
                }
                Message::Response(r) => {
                    let draft = ctx.get_shared("draft").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    ctx.yield_output(format!("{}:{}", draft, r.data));
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Holds its branch until a human answers, then hands the answer on.
    fn gate(m: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match m {
                Message::Text(_) => {
                    ctx.request_info("request_info", RequestInfoMessage::new("Release?"));
                }
                Message::Response(r) => ctx.send_to("join", r.data),
                _ => {}
            }
            Ok(())
        })
    }

    fn chain() -> Workflow {
        WorkflowBuilder::new("chain")
            .add_executor(FnExecutor::new("upper").on(MessageKind::Text, upper))
            .add_executor(FnExecutor::new("reverse").on(MessageKind::Text, reverse))
            .add_executor(FnExecutor::new("out").on(MessageKind::Text, emit))
            .set_start_executor("upper")
            .add_edge("upper", "reverse")
            .add_edge("reverse", "out")
            .build()
            .unwrap()
    }

    fn hitl() -> Workflow {
        WorkflowBuilder::new("hitl")
            .add_executor(
                FnExecutor::new("ask")
                    .on(MessageKind::Text, ask)
                    .on(MessageKind::Response, ask),
            )
            .add_executor(RequestInfoExecutor::default())
            .set_start_executor("ask")
            .add_edge("ask", "request_info")
            .add_edge("request_info", "ask")
            .build()
            .unwrap()
    }

    /// `split => {a1 -> a2, gate <-> request_info} => join`: one branch parks
    /// on a human while the other runs ahead into the fan-in buffer.
    fn parked_branch() -> Workflow {
        WorkflowBuilder::new("parked")
            .add_executor(FnExecutor::new("split").on(MessageKind::Text, forward))
            .add_executor(FnExecutor::new("a1").on(MessageKind::Text, forward))
            .add_executor(FnExecutor::new("a2").on(MessageKind::Text, upper))
            .add_executor(
                FnExecutor::new("gate")
                    .on(MessageKind::Text, gate)
                    .on(MessageKind::Response, gate),
            )
            .add_executor(RequestInfoExecutor::default())
            .add_executor(FnExecutor::new("join").on(MessageKind::Batch, join))
            .set_start_executor("split")
            .add_fan_out_edges("split", &["a1", "gate"])
            .add_edge("a1", "a2")
            .add_edge("gate", "request_info")
            .add_edge("request_info", "gate")
            .add_fan_in_edges(&["a2", "gate"], "join")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_chain_completes() {
        let outcome = WorkflowRunner::new(chain()).run("hello").await.unwrap();
        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.output_text().as_deref(), Some("OLLEH"));
        assert_eq!(outcome.supersteps, 3);
    }

    #[tokio::test]
    async fn test_fan_in_runs_once_after_all_branches() {
        let wf = WorkflowBuilder::new("fan")
            .add_executor(FnExecutor::new("split").on(MessageKind::Text, forward))
            .add_executor(FnExecutor::new("upper").on(MessageKind::Text, upper))
            .add_executor(FnExecutor::new("reverse").on(MessageKind::Text, reverse))
            .add_executor(FnExecutor::new("join").on(MessageKind::Batch, join))
            .set_start_executor("split")
            .add_fan_out_edges("split", &["upper", "reverse"])
            .add_fan_in_edges(&["upper", "reverse"], "join")
            .build()
            .unwrap();
        let mut run = WorkflowRunner::new(wf).start("abc");
        let outcome = run.run_until_suspended().await.unwrap();
        assert_eq!(outcome.output_text().as_deref(), Some("ABC | cba"));
        assert_eq!(
            run.snapshot().local_state("join").and_then(|s| s.get("calls")),
            Some(&serde_json::json!(1))
        );
        assert!(run.snapshot().fan_in_buffers.is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_fails_run_with_context() {
        let wf = WorkflowBuilder::new("bad")
            .add_executor(FnExecutor::new("a").on(MessageKind::Text, forward))
            .add_executor(FnExecutor::new("boom").on(MessageKind::Text, boom))
            .set_start_executor("a")
            .add_edge("a", "boom")
            .build()
            .unwrap();
        let outcome = WorkflowRunner::new(wf).run("x").await.unwrap();
        assert!(outcome.is_failed());
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.executor_id.as_deref(), Some("boom"));
        assert_eq!(failure.message, Some(Message::text("x")));
        assert_eq!(failure.superstep, 2);
        assert!(failure.error.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_unhandled_kind_fails_run() {
        let outcome = WorkflowRunner::new(chain())
            .run(Message::Json(serde_json::json!({"x": 1})))
            .await
            .unwrap();
        assert!(outcome.is_failed());
        assert!(outcome.failure.unwrap().error.contains("no handler for json"));
    }

    #[tokio::test]
    async fn test_idle_when_nothing_routes() {
        fn never(_: &Message) -> bool {
            false
        }
        let wf = WorkflowBuilder::new("idle")
            .add_executor(FnExecutor::new("a").on(MessageKind::Text, forward))
            .add_executor(FnExecutor::new("b").on(MessageKind::Text, emit))
            .set_start_executor("a")
            .add_conditional_edge("a", "b", never)
            .build()
            .unwrap();
        let outcome = WorkflowRunner::new(wf).run("x").await.unwrap();
        assert_eq!(outcome.state, RunState::Idle);
        assert!(outcome.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_superstep_limit() {
        let wf = WorkflowBuilder::new("spin")
            .add_executor(FnExecutor::new("spin").on(MessageKind::Text, forward))
            .set_start_executor("spin")
            .add_loop_edge("spin", None)
            .build()
            .unwrap();
        let outcome = WorkflowRunner::new(wf)
            .with_options(RunOptions {
                max_supersteps: Some(5),
                ..Default::default()
            })
            .run("x")
            .await
            .unwrap();
        assert!(outcome.is_failed());
        assert_eq!(outcome.supersteps, 5);
        let failure = outcome.failure.unwrap();
        assert!(failure.executor_id.is_none());
        assert!(failure.error.contains("max supersteps (5)"));
    }

    #[tokio::test]
    async fn test_handler_timeout() {
        let wf = WorkflowBuilder::new("slow")
            .add_executor(FnExecutor::new("hang").on(MessageKind::Text, hang))
            .set_start_executor("hang")
            .build()
            .unwrap();
        let outcome = WorkflowRunner::new(wf)
            .with_options(RunOptions {
                handler_timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            })
            .run("x")
            .await
            .unwrap();
        assert!(outcome.is_failed());
        let failure = outcome.failure.unwrap();
        assert!(failure.error.contains("timed out after 20ms"), "{}", failure.error);
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_handler() {
        let wf = WorkflowBuilder::new("slow")
            .add_executor(FnExecutor::new("hang").on(MessageKind::Text, hang))
            .set_start_executor("hang")
            .build()
            .unwrap();
        let mut run = WorkflowRunner::new(wf).start("x");
        let cancel = run.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let outcome = run.run_until_suspended().await.unwrap();
        assert!(outcome.is_failed());
        assert_eq!(outcome.failure.unwrap().error, "Run cancelled");
    }

    #[tokio::test]
    async fn test_hitl_suspend_and_answer() {
        let manager = CheckpointManager::in_memory();
        let runner = WorkflowRunner::new(hitl()).with_checkpointing(manager.clone());
        let mut run = runner.start("draft-1");

        let outcome = run.run_until_suspended().await.unwrap();
        assert_eq!(outcome.state, RunState::AwaitingInput);
        assert_eq!(outcome.pending_requests.len(), 1);
        assert_eq!(outcome.pending_requests[0].source_executor, "ask");
        let checkpoint_id = outcome.checkpoint_id.clone().unwrap();
        assert_eq!(manager.list_ids(Some("hitl")).await.unwrap(), vec![checkpoint_id]);

        // Driving again without an answer changes nothing.
        let again = run.run_until_suspended().await.unwrap();
        assert_eq!(again.state, RunState::AwaitingInput);
        assert_eq!(manager.list_ids(None).await.unwrap().len(), 1);

        let request_id = outcome.pending_requests[0].request_id.clone();
        let done = run.send_response(&request_id, "yes").await.unwrap();
        assert_eq!(done.state, RunState::Completed);
        assert_eq!(done.output_text().as_deref(), Some("draft-1:yes"));

        let err = run.send_response(&request_id, "again").await.unwrap_err();
        assert!(matches!(err, StepflowError::InvalidRunState(_)));
    }

    #[tokio::test]
    async fn test_unknown_response_leaves_run_intact() {
        let mut run = WorkflowRunner::new(hitl()).start("d");
        run.run_until_suspended().await.unwrap();
        let before = run.snapshot().clone();

        let err = run.send_response("bogus", "yes").await.unwrap_err();
        assert!(matches!(err, StepflowError::UnknownOrAnsweredRequest(_)));
        assert_eq!(run.snapshot(), &before);
    }

    #[tokio::test]
    async fn test_duplicate_id_in_batch_is_rejected_atomically() {
        let mut run = WorkflowRunner::new(hitl()).start("d");
        let outcome = run.run_until_suspended().await.unwrap();
        let request_id = outcome.pending_requests[0].request_id.clone();
        let before = run.snapshot().clone();

        let err = run
            .send_responses(vec![
                (request_id.clone(), "yes".to_string()),
                (request_id.clone(), "no".to_string()),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StepflowError::UnknownOrAnsweredRequest(ref id) if *id == request_id));
        assert_eq!(run.snapshot(), &before);

        let done = run.send_response(&request_id, "yes").await.unwrap();
        assert_eq!(done.output_text().as_deref(), Some("d:yes"));
    }

    #[tokio::test]
    async fn test_only_requesting_branch_is_suspended() {
        let mut run = WorkflowRunner::new(parked_branch()).start("abc");
        let outcome = run.run_until_suspended().await.unwrap();

        assert_eq!(outcome.state, RunState::AwaitingInput);
        assert_eq!(outcome.pending_requests[0].source_executor, "gate");
        // The sibling branch reached the fan-in while the gate waited.
        let buffered = &run.snapshot().fan_in_buffers["join"];
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered["a2"], VecDeque::from([Message::text("ABC")]));
        assert!(run.snapshot().local_state("join").is_none());

        let request_id = outcome.pending_requests[0].request_id.clone();
        let done = run.send_response(&request_id, "yes").await.unwrap();
        assert_eq!(done.state, RunState::Completed);
        assert_eq!(done.output_text().as_deref(), Some("ABC | yes"));
        assert_eq!(
            run.snapshot().local_state("join").and_then(|s| s.get("calls")),
            Some(&serde_json::json!(1))
        );
        assert!(run.snapshot().fan_in_buffers.is_empty());
    }

    #[tokio::test]
    async fn test_fan_in_waits_across_supersteps_for_longer_branch() {
        let wf = WorkflowBuilder::new("uneven")
            .add_executor(FnExecutor::new("split").on(MessageKind::Text, forward))
            .add_executor(FnExecutor::new("short").on(MessageKind::Text, upper))
            .add_executor(FnExecutor::new("long1").on(MessageKind::Text, forward))
            .add_executor(FnExecutor::new("long2").on(MessageKind::Text, forward))
            .add_executor(FnExecutor::new("long3").on(MessageKind::Text, reverse))
            .add_executor(FnExecutor::new("join").on(MessageKind::Batch, join))
            .set_start_executor("split")
            .add_fan_out_edges("split", &["short", "long1"])
            .add_edge("long1", "long2")
            .add_edge("long2", "long3")
            .add_fan_in_edges(&["short", "long3"], "join")
            .build()
            .unwrap();

        let mut run = WorkflowRunner::new(wf).start("abc");
        let outcome = run.run_until_suspended().await.unwrap();
        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.output_text().as_deref(), Some("ABC | cba"));
        // split, short+long1, long2, long3, then join once.
        assert_eq!(outcome.supersteps, 5);
        assert_eq!(
            run.snapshot().local_state("join").and_then(|s| s.get("calls")),
            Some(&serde_json::json!(1))
        );
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let manager = CheckpointManager::in_memory();
        let runner = WorkflowRunner::new(hitl()).with_checkpointing(manager);

        let mut original = runner.start("same");
        let suspended = original.run_until_suspended().await.unwrap();
        let checkpoint_id = suspended.checkpoint_id.unwrap();
        let request_id = suspended.pending_requests[0].request_id.clone();

        let mut resumed = runner.resume(&checkpoint_id).await.unwrap();
        assert_eq!(resumed.state(), RunState::AwaitingInput);
        assert!(format!("{:?}", resumed).contains("AwaitingInput"));
        assert_eq!(resumed.run_id(), original.run_id());

        let a = original.send_response(&request_id, "yes").await.unwrap();
        let b = resumed.send_response(&request_id, "yes").await.unwrap();
        assert_eq!(a.outputs, b.outputs);
        assert_eq!(a.supersteps, b.supersteps);
    }

    #[tokio::test]
    async fn test_resume_errors() {
        let manager = CheckpointManager::in_memory();
        let hitl_runner = WorkflowRunner::new(hitl()).with_checkpointing(manager.clone());
        let err = hitl_runner.resume("missing").await.unwrap_err();
        assert!(matches!(err, StepflowError::CheckpointNotFound(_)));

        let outcome = hitl_runner.run("x").await.unwrap();
        let chain_runner = WorkflowRunner::new(chain()).with_checkpointing(manager);
        let err = chain_runner
            .resume(&outcome.checkpoint_id.unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StepflowError::WorkflowMismatch { .. }));
    }

    #[tokio::test]
    async fn test_checkpoint_every_superstep() {
        let manager = CheckpointManager::in_memory();
        let outcome = WorkflowRunner::new(chain())
            .with_checkpointing(manager.clone())
            .with_options(RunOptions {
                checkpoint_every_superstep: true,
                ..Default::default()
            })
            .run("hello")
            .await
            .unwrap();
        assert_eq!(outcome.state, RunState::Completed);
        // The completing superstep ends the run before its checkpoint.
        assert_eq!(manager.list_ids(Some("chain")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        WorkflowRunner::new(chain())
            .with_event_bus(bus.clone())
            .run("hi")
            .await
            .unwrap();

        let mut saw_output = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WorkflowEvent::Output { executor_id, .. } => {
                    assert_eq!(executor_id, "out");
                    saw_output = true;
                }
                WorkflowEvent::StatusChanged { state: RunState::Completed, .. } => {
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_output && saw_completed);
    }

    #[test]
    fn test_group_by_target_keeps_first_appearance_order() {
        let d = |t: &str, m: &str| Delivery::input(t, Message::text(m));
        let groups = group_by_target(vec![d("b", "1"), d("a", "2"), d("b", "3")]);
        let targets: Vec<_> = groups.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(targets, vec!["b", "a"]);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[0].1[1].message, Message::text("3"));
    }
}
