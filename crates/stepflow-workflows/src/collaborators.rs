use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{ChatStep, ToolCall};
use stepflow_core::types::{ChatMessage, Message, MessageKind, Role};
use stepflow_engine::collaborator::run_chat;
use stepflow_engine::{Executor, WorkflowContext};

/// The chat steps and tools the reference workflows call, passed in
/// explicitly.
#[derive(Clone)]
pub struct Collaborators {
    pub general: Arc<dyn ChatStep>,
    pub summarizer: Arc<dyn ChatStep>,
    pub search: Arc<dyn ChatStep>,
    pub fetch: Arc<dyn ChatStep>,
    pub title: Arc<dyn ChatStep>,
    pub aggregator: Arc<dyn ChatStep>,
    /// Creates the folder a research run writes into. Args: `{"title"}`.
    pub folders: Arc<dyn ToolCall>,
    /// Stores one summary per URL. Args: `{"folder", "urls"}`.
    pub collector: Arc<dyn ToolCall>,
    /// Upper bound on each chat exchange.
    pub timeout: Duration,
}

impl Collaborators {
    /// Use the same chat step for every chat role, with offline tools.
    pub fn uniform(chat: Arc<dyn ChatStep>, timeout: Duration) -> Self {
        Self {
            general: chat.clone(),
            summarizer: chat.clone(),
            search: chat.clone(),
            fetch: chat.clone(),
            title: chat.clone(),
            aggregator: chat,
            ..Self::offline(timeout)
        }
    }

    /// Offline collaborators that echo their input.
    pub fn offline(timeout: Duration) -> Self {
        Self {
            general: Arc::new(EchoChat::new("GeneralAgent")),
            summarizer: Arc::new(EchoChat::new("SummarizerAgent")),
            search: Arc::new(EchoChat::new("SearchAgent")),
            fetch: Arc::new(EchoChat::new("FetchAgent")),
            title: Arc::new(EchoChat::new("TitleGeneratorAgent")),
            aggregator: Arc::new(EchoChat::new("ResearchAggregatorAgent")),
            folders: Arc::new(PlannedFolders::new("research")),
            collector: Arc::new(SummaryIndex),
            timeout,
        }
    }
}

/// Chat step that replies with the last non-system turn, tagged with its name.
/// Lets every workflow run without a model backend.
pub struct EchoChat {
    name: String,
}

impl EchoChat {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ChatStep for EchoChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat_stream(
        &self,
        turns: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            let last = turns
                .iter()
                .rev()
                .find(|t| t.role != Role::System)
                .map(|t| t.text.clone())
                .unwrap_or_default();
            let chunks = vec![format!("[{}] ", self.name), last];
            Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
        })
    }
}

/// Folder tool that only plans paths: `<root>/<slug of title>`.
/// Nothing is written to disk.
pub struct PlannedFolders {
    root: String,
}

impl PlannedFolders {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

/// Lowercase ASCII alphanumerics joined by single dashes.
pub fn slugify(title: &str) -> String {
    title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

impl ToolCall for PlannedFolders {
    fn name(&self) -> &str {
        "create_folder"
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let title = args.get("title").and_then(Value::as_str).unwrap_or_default();
            let slug = match slugify(title) {
                s if s.is_empty() => "untitled".to_string(),
                s => s,
            };
            Ok(json!(format!("{}/{}", self.root, slug)))
        })
    }
}

/// Collector tool that lists where each URL's summary would be stored.
pub struct SummaryIndex;

impl ToolCall for SummaryIndex {
    fn name(&self) -> &str {
        "store_summaries"
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let folder = args.get("folder").and_then(Value::as_str).unwrap_or(".");
            let urls = args
                .get("urls")
                .and_then(Value::as_array)
                .ok_or_else(|| StepflowError::Collaborator {
                    name: "store_summaries".to_string(),
                    message: "missing 'urls' array".to_string(),
                })?;
            let index: Vec<String> = urls
                .iter()
                .filter_map(Value::as_str)
                .enumerate()
                .map(|(i, url)| format!("- {} -> {}/{:02}.md", url, folder, i + 1))
                .collect();
            Ok(json!(index.join("\n")))
        })
    }
}

/// Executor that hands a chat message to a chat step.
///
/// It either forwards the reply as an assistant message or, as the last step
/// of a workflow, yields the reply text as the output.
pub struct AgentStep {
    id: String,
    chat: Arc<dyn ChatStep>,
    timeout: Duration,
    finish: bool,
}

impl AgentStep {
    /// Forward the reply downstream.
    pub fn forward(id: impl Into<String>, chat: Arc<dyn ChatStep>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            chat,
            timeout,
            finish: false,
        }
    }

    /// Yield the reply as the workflow output.
    pub fn finish(id: impl Into<String>, chat: Arc<dyn ChatStep>, timeout: Duration) -> Self {
        Self {
            finish: true,
            ..Self::forward(id, chat, timeout)
        }
    }
}

impl Executor for AgentStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn accepts(&self) -> &[MessageKind] {
        &[MessageKind::Chat]
    }

    fn handle<'a>(
        &'a self,
        message: Message,
        ctx: &'a mut WorkflowContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Message::Chat(turn) = message else {
                return Err(StepflowError::handler(&self.id, "expected a chat message"));
            };
            let reply = run_chat(self.chat.as_ref(), vec![turn], self.timeout, ctx.cancel_token())
                .await?;
            let reply = reply.trim().to_string();
            if self.finish {
                ctx.yield_output(reply);
            } else {
                ctx.send_message(ChatMessage::assistant(reply));
            }
            Ok(())
        })
    }
}

/// Whitespace-separated tokens that look like http(s) URLs, without trailing
/// punctuation, deduplicated in order of appearance, at most `limit`.
pub fn extract_urls(text: &str, limit: usize) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for token in text.split_whitespace() {
        let token =
            token.trim_end_matches(|c: char| matches!(c, ',' | '.' | ';' | ')' | '"' | '\''));
        if (token.starts_with("http://") || token.starts_with("https://"))
            && !urls.iter().any(|u| u == token)
        {
            urls.push(token.to_string());
        }
    }
    urls.truncate(limit);
    urls
}

/// Shared-state key holding the original question of a research run.
pub const USER_QUERY_KEY: &str = "user_query";

/// Entry step of the research workflows: remembers the question in shared
/// state and passes it on as a user turn.
pub(crate) fn input_to_query(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let text = message.as_text().unwrap_or_default().to_string();
        tracing::info!(query = %text, "Research question received");
        ctx.set_shared(USER_QUERY_KEY, json!(text));
        ctx.send_message(ChatMessage::user(text));
        Ok(())
    })
}

/// Entry step of the chat workflows: plain text becomes a user turn.
pub(crate) fn input_to_chat(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let text = message.as_text().unwrap_or_default().to_string();
        tracing::debug!(chars = text.len(), "User input received");
        ctx.send_message(ChatMessage::user(text));
        Ok(())
    })
}
