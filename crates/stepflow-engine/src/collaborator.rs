//! Bounded calls into external collaborators.
//!
//! Executors that talk to an AI chat step or a tool go through these helpers
//! so that a stuck call can neither outlive its timeout nor ignore run
//! cancellation.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{ChatStep, ToolCall};
use stepflow_core::types::ChatMessage;

/// Send `turns` to a chat step and collect the streamed reply.
///
/// The timeout covers the whole exchange, including the stream.
pub async fn run_chat(
    chat: &dyn ChatStep,
    turns: Vec<ChatMessage>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    let name = chat.name().to_string();
    debug!(collaborator = %name, turns = turns.len(), "Calling chat step");

    let exchange = async {
        let mut stream = chat.chat_stream(turns).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk?);
        }
        Ok::<_, StepflowError>(text)
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(StepflowError::Cancelled),
        result = tokio::time::timeout(timeout, exchange) => result,
    };

    match result {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => {
            warn!(collaborator = %name, error = %e, "Chat step failed");
            Err(match e {
                StepflowError::Collaborator { .. } | StepflowError::Cancelled => e,
                other => StepflowError::Collaborator {
                    name,
                    message: other.to_string(),
                },
            })
        }
        Err(_) => {
            warn!(collaborator = %name, timeout_secs = timeout.as_secs(), "Chat step timed out");
            Err(StepflowError::CollaboratorTimeout {
                name,
                timeout_secs: timeout.as_secs(),
            })
        }
    }
}

/// Invoke a tool with JSON arguments, bounded by the tool's own timeout.
pub async fn call_tool(
    tool: &dyn ToolCall,
    args: serde_json::Value,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    let timeout = Duration::from_secs(tool.timeout_secs());
    debug!(tool = %tool.name(), "Calling tool");

    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(StepflowError::Cancelled),
        result = tokio::time::timeout(timeout, tool.call(args)) => result,
    };

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(StepflowError::Collaborator { name, message })) => {
            Err(StepflowError::Collaborator { name, message })
        }
        Ok(Err(e)) => Err(StepflowError::Collaborator {
            name: tool.name().to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(StepflowError::CollaboratorTimeout {
            name: tool.name().to_string(),
            timeout_secs: tool.timeout_secs(),
        }),
    }
}
