use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::HumanFrontEnd;
use stepflow_core::types::{Message, MessageKind, RequestInfoMessage, RunState};

use crate::graph::{Executor, WorkflowContext};
use crate::runner::{RunOutcome, WorkflowRun};

/// Lifecycle of one human-in-the-loop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Answered,
    Abandoned,
}

/// A request parked at a request-info sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request: RequestInfoMessage,
    /// Sink executor that parked the request.
    pub sink: String,
    pub status: RequestStatus,
}

/// Per-run record of every request issued, in registration order.
///
/// Part of the run snapshot, so outstanding requests survive a checkpoint.
/// An id moves from `Pending` to `Answered` or `Abandoned` exactly once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HitlLedger {
    entries: Vec<PendingRequest>,
}

impl HitlLedger {
    /// Park a new request. Request ids must be unique within a run.
    pub fn register(&mut self, request: RequestInfoMessage, sink: impl Into<String>) -> Result<()> {
        if self.position(&request.request_id).is_some() {
            return Err(StepflowError::InvalidRunState(format!(
                "duplicate request id {}",
                request.request_id
            )));
        }
        debug!(request_id = %request.request_id, "Request registered");
        self.entries.push(PendingRequest {
            request,
            sink: sink.into(),
            status: RequestStatus::Pending,
        });
        Ok(())
    }

    pub fn status(&self, request_id: &str) -> Option<RequestStatus> {
        self.get(request_id).map(|e| e.status)
    }

    pub fn get(&self, request_id: &str) -> Option<&PendingRequest> {
        self.entries.iter().find(|e| e.request.request_id == request_id)
    }

    /// Registration index of a pending request, or the error an answer for it
    /// would produce.
    pub fn check_pending(&self, request_id: &str) -> Result<usize> {
        match self.position(request_id) {
            Some(i) if self.entries[i].status == RequestStatus::Pending => Ok(i),
            _ => Err(StepflowError::UnknownOrAnsweredRequest(request_id.to_string())),
        }
    }

    /// Mark a pending request answered and return it.
    pub fn answer(&mut self, request_id: &str) -> Result<PendingRequest> {
        let i = self.check_pending(request_id)?;
        self.entries[i].status = RequestStatus::Answered;
        Ok(self.entries[i].clone())
    }

    /// Abandon every pending request. Returns how many were abandoned.
    pub fn abandon_all(&mut self) -> usize {
        let mut count = 0;
        for entry in &mut self.entries {
            if entry.status == RequestStatus::Pending {
                entry.status = RequestStatus::Abandoned;
                count += 1;
            }
        }
        count
    }

    pub fn pending(&self) -> impl Iterator<Item = &RequestInfoMessage> {
        self.entries
            .iter()
            .filter(|e| e.status == RequestStatus::Pending)
            .map(|e| &e.request)
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| e.status == RequestStatus::Pending)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, request_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.request.request_id == request_id)
    }
}

/// The well-known request-info sink.
///
/// Executors send a [`RequestInfoMessage`] here instead of to a normal
/// target. The sink parks it and the run suspends once the queue drains; the
/// answer is later delivered straight back to the requesting executor.
pub struct RequestInfoExecutor {
    id: String,
}

impl RequestInfoExecutor {
    pub const DEFAULT_ID: &'static str = "request_info";

    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for RequestInfoExecutor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ID)
    }
}

impl Executor for RequestInfoExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn accepts(&self) -> &[MessageKind] {
        &[MessageKind::RequestInfo]
    }

    fn handle<'a>(
        &'a self,
        message: Message,
        ctx: &'a mut WorkflowContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match message {
                Message::RequestInfo(request) => {
                    ctx.suspend_for_response(request);
                    Ok(())
                }
                other => Err(StepflowError::handler(
                    self.id.clone(),
                    format!("expected a request_info message, got {}", other.kind()),
                )),
            }
        })
    }

    fn is_request_sink(&self) -> bool {
        true
    }
}

/// Run until the run stops awaiting input, asking `front_end` to answer every
/// outstanding request along the way.
///
/// `timeout` bounds each individual answer; an expired wait fails with
/// [`StepflowError::CollaboratorTimeout`] and leaves the run suspended.
pub async fn drive_interactive(
    run: &mut WorkflowRun,
    front_end: &dyn HumanFrontEnd,
    timeout: Option<Duration>,
) -> Result<RunOutcome> {
    let mut outcome = run.run_until_suspended().await?;

    while outcome.state == RunState::AwaitingInput {
        let mut answers = Vec::with_capacity(outcome.pending_requests.len());
        for request in &outcome.pending_requests {
            info!(request_id = %request.request_id, "Waiting for human response");
            let answer = match timeout {
                Some(limit) => tokio::time::timeout(limit, front_end.ask(request))
                    .await
                    .map_err(|_| StepflowError::CollaboratorTimeout {
                        name: "human".to_string(),
                        timeout_secs: limit.as_secs(),
                    })??,
                None => front_end.ask(request).await?,
            };
            answers.push((request.request_id.clone(), answer));
        }
        outcome = run.send_responses(answers).await?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::state::{LocalState, SharedState};
    use stepflow_core::types::RunId;
    use tokio_util::sync::CancellationToken;

    fn ledger_with(ids: &[&str]) -> HitlLedger {
        let mut ledger = HitlLedger::default();
        for id in ids {
            let mut req = RequestInfoMessage::new(format!("prompt {}", id));
            req.request_id = id.to_string();
            ledger.register(req, "request_info").unwrap();
        }
        ledger
    }

    #[test]
    fn test_answer_transitions_once() {
        let mut ledger = ledger_with(&["r1"]);
        assert_eq!(ledger.status("r1"), Some(RequestStatus::Pending));
        assert!(ledger.has_pending());

        let answered = ledger.answer("r1").unwrap();
        assert_eq!(answered.sink, "request_info");
        assert_eq!(ledger.status("r1"), Some(RequestStatus::Answered));
        assert!(!ledger.has_pending());

        let err = ledger.answer("r1").unwrap_err();
        assert!(matches!(err, StepflowError::UnknownOrAnsweredRequest(id) if id == "r1"));
    }

    #[test]
    fn test_unknown_request_is_an_error() {
        let mut ledger = ledger_with(&["r1"]);
        assert!(matches!(
            ledger.answer("nope"),
            Err(StepflowError::UnknownOrAnsweredRequest(_))
        ));
        assert_eq!(ledger.status("r1"), Some(RequestStatus::Pending));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut ledger = ledger_with(&["r1"]);
        let mut dup = RequestInfoMessage::new("again");
        dup.request_id = "r1".into();
        assert!(ledger.register(dup, "request_info").is_err());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_abandon_all_skips_answered() {
        let mut ledger = ledger_with(&["a", "b", "c"]);
        ledger.answer("b").unwrap();
        assert_eq!(ledger.abandon_all(), 2);
        assert_eq!(ledger.status("a"), Some(RequestStatus::Abandoned));
        assert_eq!(ledger.status("b"), Some(RequestStatus::Answered));
        assert!(ledger.answer("a").is_err());
    }

    #[test]
    fn test_pending_in_registration_order() {
        let mut ledger = ledger_with(&["z", "a", "m"]);
        ledger.answer("a").unwrap();
        let ids: Vec<_> = ledger.pending().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "m"]);
        assert_eq!(ledger.check_pending("m").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sink_parks_request() {
        let sink = RequestInfoExecutor::default();
        assert!(sink.is_request_sink());
        assert_eq!(sink.id(), "request_info");

        let mut ctx = WorkflowContext::new(
            "request_info",
            RunId::new(),
            1,
            SharedState::new(),
            LocalState::new(),
            CancellationToken::new(),
        );
        let req = RequestInfoMessage::new("Continue?").with_preview("some text");
        sink.handle(Message::RequestInfo(req.clone()), &mut ctx)
            .await
            .unwrap();
        let parts = ctx.into_parts();
        assert_eq!(parts.requests, vec![req]);
        assert!(parts.sent.is_empty());
    }
}
