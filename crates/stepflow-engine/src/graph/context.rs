use tokio_util::sync::CancellationToken;

use stepflow_core::state::{LocalState, SharedState};
use stepflow_core::types::{Message, RequestInfoMessage, RunId};

/// A message a handler asked the engine to route.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub message: Message,
    /// Explicit target; `None` broadcasts along every matching outgoing edge.
    pub target: Option<String>,
}

/// Everything a handler invocation produced, handed back to the scheduler.
pub(crate) struct ContextParts {
    pub shared: SharedState,
    pub local: LocalState,
    pub sent: Vec<Outgoing>,
    pub outputs: Vec<Message>,
    pub requests: Vec<RequestInfoMessage>,
    pub checkpoint_requested: bool,
}

/// Handle passed to an executor for one handler invocation.
///
/// Messages sent here are queued for the *next* superstep. Shared-state
/// writes apply immediately, so later invocations in the same superstep see
/// them (last writer in invocation order wins).
pub struct WorkflowContext {
    executor_id: String,
    run_id: RunId,
    superstep: usize,
    shared: SharedState,
    local: LocalState,
    cancel: CancellationToken,
    sent: Vec<Outgoing>,
    outputs: Vec<Message>,
    requests: Vec<RequestInfoMessage>,
    checkpoint_requested: bool,
}

impl WorkflowContext {
    pub(crate) fn new(
        executor_id: impl Into<String>,
        run_id: RunId,
        superstep: usize,
        shared: SharedState,
        local: LocalState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor_id: executor_id.into(),
            run_id,
            superstep,
            shared,
            local,
            cancel,
            sent: Vec::new(),
            outputs: Vec::new(),
            requests: Vec::new(),
            checkpoint_requested: false,
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn superstep(&self) -> usize {
        self.superstep
    }

    /// Cancelled when the run is cancelled. Pass it to collaborator calls.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Send along every outgoing edge whose condition matches.
    pub fn send_message(&mut self, message: impl Into<Message>) {
        self.push(message.into(), None);
    }

    /// Send to one target. The graph must have an edge from this executor to it.
    pub fn send_to(&mut self, target: impl Into<String>, message: impl Into<Message>) {
        self.push(message.into(), Some(target.into()));
    }

    /// Ask a human for input through the request-info sink `sink_id`.
    /// Returns the request id the answer will carry.
    pub fn request_info(&mut self, sink_id: impl Into<String>, request: RequestInfoMessage) -> String {
        let request_id = request.request_id.clone();
        self.send_to(sink_id, Message::RequestInfo(request));
        request_id
    }

    /// Yield a terminal output. The run completes at the end of this superstep.
    pub fn yield_output(&mut self, output: impl Into<Message>) {
        self.outputs.push(output.into());
    }

    /// Ask for a checkpoint at the end of this superstep.
    pub fn request_checkpoint(&mut self) {
        self.checkpoint_requested = true;
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.shared
    }

    pub fn shared_state_mut(&mut self) -> &mut SharedState {
        &mut self.shared
    }

    pub fn get_shared(&self, key: &str) -> Option<&serde_json::Value> {
        self.shared.get(key)
    }

    pub fn set_shared(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.shared.set(key, value);
    }

    /// This executor's private state for the current run.
    pub fn local_state(&self) -> &LocalState {
        &self.local
    }

    pub fn local_state_mut(&mut self) -> &mut LocalState {
        &mut self.local
    }

    pub fn get_local(&self, key: &str) -> Option<&serde_json::Value> {
        self.local.get(key)
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.local.set(key, value);
    }

    /// Park a request until an external answer arrives. Only request-info
    /// sinks call this.
    pub(crate) fn suspend_for_response(&mut self, request: RequestInfoMessage) {
        self.requests.push(request);
    }

    pub(crate) fn into_parts(self) -> ContextParts {
        ContextParts {
            shared: self.shared,
            local: self.local,
            sent: self.sent,
            outputs: self.outputs,
            requests: self.requests,
            checkpoint_requested: self.checkpoint_requested,
        }
    }

    fn push(&mut self, mut message: Message, target: Option<String>) {
        if let Message::RequestInfo(ref mut request) = message {
            if request.source_executor.is_empty() {
                request.source_executor = self.executor_id.clone();
            }
        }
        self.sent.push(Outgoing { message, target });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(
            "approval",
            RunId::from("run-1"),
            3,
            SharedState::new(),
            LocalState::new(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_send_and_yield_are_collected() {
        let mut ctx = ctx();
        ctx.send_message("a");
        ctx.send_to("b", Message::text("b"));
        ctx.yield_output("done");
        ctx.request_checkpoint();

        let parts = ctx.into_parts();
        assert_eq!(parts.sent.len(), 2);
        assert!(parts.sent[0].target.is_none());
        assert_eq!(parts.sent[1].target.as_deref(), Some("b"));
        assert_eq!(parts.outputs, vec![Message::text("done")]);
        assert!(parts.checkpoint_requested);
    }

    #[test]
    fn test_request_info_stamps_source() {
        let mut ctx = ctx();
        let id = ctx.request_info("request_info", RequestInfoMessage::new("ok?"));
        let parts = ctx.into_parts();
        match &parts.sent[0].message {
            Message::RequestInfo(r) => {
                assert_eq!(r.request_id, id);
                assert_eq!(r.source_executor, "approval");
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(parts.sent[0].target.as_deref(), Some("request_info"));
    }

    #[test]
    fn test_state_accessors() {
        let mut ctx = ctx();
        ctx.set_shared("fetched_text", serde_json::json!("body"));
        ctx.set_local("count", serde_json::json!(2));
        assert_eq!(ctx.get_shared("fetched_text"), Some(&serde_json::json!("body")));
        assert_eq!(ctx.get_local("count"), Some(&serde_json::json!(2)));
        assert_eq!(ctx.superstep(), 3);
        assert_eq!(ctx.run_id().0, "run-1");

        let parts = ctx.into_parts();
        assert_eq!(parts.shared.get_str("fetched_text"), Some("body"));
        assert_eq!(parts.local.len(), 1);
    }
}
