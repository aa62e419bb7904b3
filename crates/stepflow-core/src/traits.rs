use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{ChatMessage, RequestInfoMessage};

/// AI chat step: given prior turns, streams generated text.
///
/// The engine treats it as an opaque collaborator; executors receive it at
/// construction time.
pub trait ChatStep: Send + Sync + 'static {
    /// Collaborator name used in logs and errors.
    fn name(&self) -> &str;

    /// Send the turns and receive a stream of text chunks.
    fn chat_stream(
        &self,
        turns: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>>;
}

/// Tool / function call collaborator.
pub trait ToolCall: Send + Sync + 'static {
    /// Tool name.
    fn name(&self) -> &str;

    /// Invoke the tool with JSON arguments.
    fn call(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Console / API front end that surfaces HITL prompts to a human.
pub trait HumanFrontEnd: Send + Sync + 'static {
    /// Show the request and return the human's text answer.
    fn ask<'a>(&'a self, request: &'a RequestInfoMessage) -> BoxFuture<'a, Result<String>>;
}
