use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a single workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a chat turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat turn exchanged with an AI chat step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }
}

/// An outgoing human-in-the-loop request.
///
/// `source_executor` is filled in by the engine when the request is sent, so
/// the answer can be routed back to the branch that asked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestInfoMessage {
    pub request_id: String,
    #[serde(default)]
    pub source_executor: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RequestInfoMessage {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            source_executor: String::new(),
            prompt: prompt.into(),
            preview: None,
            data: None,
        }
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The answer to a [`RequestInfoMessage`], correlated by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestResponse {
    pub request_id: String,
    pub request: RequestInfoMessage,
    pub data: String,
}

/// Variant tag of a [`Message`], used for handler dispatch tables.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Chat,
    Json,
    Batch,
    RequestInfo,
    Response,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Chat => "chat",
            Self::Json => "json",
            Self::Batch => "batch",
            Self::RequestInfo => "request_info",
            Self::Response => "response",
        };
        f.write_str(s)
    }
}

/// A message payload routed between executors.
///
/// The engine never looks inside a payload; it only reads the variant tag to
/// pick a handler and hands the value to edge predicates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    Text(String),
    Chat(ChatMessage),
    Json(serde_json::Value),
    /// Ordered payloads delivered to a fan-in executor, one per inbound edge.
    Batch(Vec<Message>),
    RequestInfo(RequestInfoMessage),
    Response(RequestResponse),
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Chat(_) => MessageKind::Chat,
            Self::Json(_) => MessageKind::Json,
            Self::Batch(_) => MessageKind::Batch,
            Self::RequestInfo(_) => MessageKind::RequestInfo,
            Self::Response(_) => MessageKind::Response,
        }
    }

    /// Borrow the textual content of `Text` and `Chat` messages.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Chat(c) => Some(&c.text),
            _ => None,
        }
    }

    /// Render the message as display text. Used for outputs and previews.
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Chat(c) => c.text.clone(),
            Self::Json(v) => v.to_string(),
            Self::Batch(items) => items
                .iter()
                .map(Message::to_display_string)
                .collect::<Vec<_>>()
                .join(", "),
            Self::RequestInfo(r) => r.prompt.clone(),
            Self::Response(r) => r.data.clone(),
        }
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<ChatMessage> for Message {
    fn from(c: ChatMessage) -> Self {
        Self::Chat(c)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    Idle,
    AwaitingInput,
    Completed,
    Failed,
}

impl RunState {
    /// Completed and failed runs never execute again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Idle => "IDLE",
            Self::AwaitingInput => "AWAITING_INPUT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// What broke a failed run, with enough context to replay it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    /// Executor whose handler failed; `None` for engine-level failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    pub error: String,
    pub superstep: usize,
    pub at: DateTime<Utc>,
}

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A run started or was resumed.
    RunStarted { run_id: RunId, workflow_id: String },
    /// A superstep is about to dispatch `queued` deliveries.
    SuperstepStarted { run_id: RunId, superstep: usize, queued: usize },
    /// A handler is about to run.
    ExecutorInvoked { run_id: RunId, executor_id: String, kind: MessageKind },
    /// An executor yielded a terminal output.
    Output { run_id: RunId, executor_id: String, data: Message },
    /// A request is waiting for a human answer.
    RequestInfo { run_id: RunId, request: RequestInfoMessage },
    /// A request was answered.
    RequestAnswered { run_id: RunId, request_id: String },
    /// A checkpoint was committed.
    CheckpointSaved { run_id: RunId, checkpoint_id: String },
    /// The run changed state.
    StatusChanged { run_id: RunId, state: RunState },
    /// The run failed.
    RunFailed { run_id: RunId, failure: FailureInfo },
}
