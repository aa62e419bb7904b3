use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use stepflow_core::state::{LocalState, SharedState};
use stepflow_core::types::{FailureInfo, Message, RequestInfoMessage, RunId, RunState};

use crate::hitl::HitlLedger;

/// One queued unit of work: deliver `message` to `target` in the next superstep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    /// Sending executor; `None` for the initial input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    pub message: Message,
    /// Travelled along a fan-in edge and must be buffered until its group is complete.
    #[serde(default)]
    pub fan_in: bool,
}

impl Delivery {
    pub fn input(target: impl Into<String>, message: Message) -> Self {
        Self {
            source: None,
            target: target.into(),
            message,
            fan_in: false,
        }
    }
}

/// The complete, serializable state of one run.
///
/// This is exactly what a checkpoint stores. Restoring it and continuing the
/// superstep loop reproduces the uninterrupted run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow_id: String,
    pub state: RunState,
    /// Number of supersteps executed so far.
    pub superstep: usize,
    /// Work for the next superstep, in emission order.
    pub queue: VecDeque<Delivery>,
    pub shared_state: SharedState,
    /// Private state of every executor that has run, keyed by executor id.
    #[serde(default)]
    pub executor_states: BTreeMap<String, LocalState>,
    /// Fan-in target -> source -> messages not yet aggregated.
    #[serde(default)]
    pub fan_in_buffers: BTreeMap<String, BTreeMap<String, VecDeque<Message>>>,
    #[serde(default)]
    pub requests: HitlLedger,
    #[serde(default)]
    pub outputs: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl RunSnapshot {
    /// Fresh run state with `input` queued for `start`.
    pub fn new(workflow_id: impl Into<String>, start: impl Into<String>, input: Message) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(Delivery::input(start, input));
        Self {
            run_id: RunId::new(),
            workflow_id: workflow_id.into(),
            state: RunState::Idle,
            superstep: 0,
            queue,
            shared_state: SharedState::new(),
            executor_states: BTreeMap::new(),
            fan_in_buffers: BTreeMap::new(),
            requests: HitlLedger::default(),
            outputs: Vec::new(),
            failure: None,
        }
    }

    /// Requests still waiting for an answer, in registration order.
    pub fn pending_requests(&self) -> Vec<RequestInfoMessage> {
        self.requests.pending().cloned().collect()
    }

    pub fn local_state(&self, executor_id: &str) -> Option<&LocalState> {
        self.executor_states.get(executor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_snapshot_queues_input() {
        let snap = RunSnapshot::new("wf", "start", Message::text("hello"));
        assert_eq!(snap.state, RunState::Idle);
        assert_eq!(snap.superstep, 0);
        assert_eq!(snap.queue.len(), 1);
        assert_eq!(snap.queue[0].target, "start");
        assert!(snap.queue[0].source.is_none());
        assert!(snap.pending_requests().is_empty());
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut snap = RunSnapshot::new("wf", "start", Message::text("hello"));
        snap.shared_state.set_str("k", "v");
        snap.executor_states
            .entry("judge".into())
            .or_default()
            .set("count", serde_json::json!(3));
        snap.fan_in_buffers
            .entry("agg".into())
            .or_default()
            .entry("upper".into())
            .or_default()
            .push_back(Message::text("ABC"));
        snap.requests
            .register(RequestInfoMessage::new("continue?"), "request_info")
            .unwrap();

        let json = serde_json::to_string(&snap).unwrap();
        let back: RunSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.pending_requests().len(), 1);
        assert_eq!(
            back.local_state("judge").and_then(|s| s.get("count")),
            Some(&serde_json::json!(3))
        );
    }
}
