use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::ChatStep;
use stepflow_core::types::{ChatMessage, Message, MessageKind};
use stepflow_engine::collaborator::run_chat;
use stepflow_engine::{Executor, FnExecutor, Workflow, WorkflowBuilder, WorkflowContext};

use crate::collaborators::{extract_urls, input_to_query, Collaborators, USER_QUERY_KEY};

pub const WORKFLOW_ID: &str = "SearchAndSummarize";

pub const NO_URLS_OUTPUT: &str = "No URLs to fetch.";
/// Most URLs handed from search to fetch.
pub const MAX_URLS: usize = 10;
/// Shared-state key holding the URL list found by search.
pub const SEARCH_RESULTS_KEY: &str = "search_results";
/// Shared-state key holding the fetch step's summary of the sources.
pub const FETCHED_SUMMARY_KEY: &str = "fetched_summary";

/// URLs in a search reply. A JSON array of strings is read as-is,
/// anything else is scanned for http(s) tokens.
pub fn parse_urls(reply: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(reply.trim()) {
        Ok(list) => extract_urls(&list.join(" "), MAX_URLS),
        Err(_) => extract_urls(reply, MAX_URLS),
    }
}

fn user_query(ctx: &WorkflowContext) -> String {
    ctx.shared_state()
        .get_str(USER_QUERY_KEY)
        .unwrap_or_default()
        .to_string()
}

fn expect_chat(id: &str, message: Message) -> Result<ChatMessage> {
    match message {
        Message::Chat(turn) => Ok(turn),
        other => Err(StepflowError::handler(
            id,
            format!("unexpected {} message", other.kind()),
        )),
    }
}

/// Asks the search collaborator for sources and passes on the URL list.
struct SearchStep {
    chat: Arc<dyn ChatStep>,
    timeout: Duration,
}

impl Executor for SearchStep {
    fn id(&self) -> &str {
        "search_executor"
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
            let turn = expect_chat(self.id(), message)?;
            let prompt = format!(
                "Find the most relevant articles or sources for the question:\n'{}'",
                turn.text
            );
            let reply = run_chat(
                self.chat.as_ref(),
                vec![ChatMessage::user(prompt)],
                self.timeout,
                ctx.cancel_token(),
            )
            .await?;

            let urls = parse_urls(&reply);
            info!(count = urls.len(), "Search found URLs");
            ctx.set_shared(SEARCH_RESULTS_KEY, json!(urls));
            ctx.send_message(Message::Json(json!(urls)));
            Ok(())
        })
    }
}

/// Reads the found sources, or finishes early when there are none.
struct FetchStep {
    chat: Arc<dyn ChatStep>,
    timeout: Duration,
}

impl Executor for FetchStep {
    fn id(&self) -> &str {
        "fetch_agent"
    }

    fn accepts(&self) -> &[MessageKind] {
        &[MessageKind::Json]
    }

    fn handle<'a>(
        &'a self,
        message: Message,
        ctx: &'a mut WorkflowContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Message::Json(value) = message else {
                return Err(StepflowError::handler(self.id(), "expected a URL list"));
            };
            let urls: Vec<String> = serde_json::from_value(value)
                .map_err(|e| StepflowError::handler(self.id(), format!("bad URL list: {}", e)))?;
            if urls.is_empty() {
                warn!("Search returned no URLs");
                ctx.yield_output(NO_URLS_OUTPUT);
                return Ok(());
            }

            let prompt = format!(
                "Question: {}\n\nRead these sources and summarize what they say about it:\n{}",
                user_query(ctx),
                urls.join("\n")
            );
            let summary = run_chat(
                self.chat.as_ref(),
                vec![ChatMessage::user(prompt)],
                self.timeout,
                ctx.cancel_token(),
            )
            .await?
            .trim()
            .to_string();
            ctx.set_shared(FETCHED_SUMMARY_KEY, json!(summary));
            ctx.send_message(ChatMessage::assistant(summary));
            Ok(())
        })
    }
}

/// Answers the original question from the fetched summary.
struct SummarizeStep {
    chat: Arc<dyn ChatStep>,
    timeout: Duration,
}

impl Executor for SummarizeStep {
    fn id(&self) -> &str {
        "summarizer_agent"
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
            let turn = expect_chat(self.id(), message)?;
            let fetched = ctx
                .shared_state()
                .get_str(FETCHED_SUMMARY_KEY)
                .unwrap_or(&turn.text)
                .to_string();
            let prompt = format!(
                "Question: {}\n\nFindings:\n{}\n\nWrite a concise answer to the question.",
                user_query(ctx),
                fetched
            );
            let answer = run_chat(
                self.chat.as_ref(),
                vec![ChatMessage::user(prompt)],
                self.timeout,
                ctx.cancel_token(),
            )
            .await?
            .trim()
            .to_string();
            info!(chars = answer.len(), "Answer produced");
            ctx.yield_output(answer);
            Ok(())
        })
    }
}

/// Search for sources, read them, then answer the question.
///
/// ```text
/// input_to_chat -> search_executor -> fetch_agent -> summarizer_agent
/// ```
pub fn build(collaborators: &Collaborators) -> Result<Workflow> {
    WorkflowBuilder::new(WORKFLOW_ID)
        .add_executor(FnExecutor::new("input_to_chat").on(MessageKind::Text, input_to_query))
        .add_executor(SearchStep {
            chat: collaborators.search.clone(),
            timeout: collaborators.timeout,
        })
        .add_executor(FetchStep {
            chat: collaborators.fetch.clone(),
            timeout: collaborators.timeout,
        })
        .add_executor(SummarizeStep {
            chat: collaborators.summarizer.clone(),
            timeout: collaborators.timeout,
        })
        .set_start_executor("input_to_chat")
        .add_edge("input_to_chat", "search_executor")
        .add_edge("search_executor", "fetch_agent")
        .add_edge("fetch_agent", "summarizer_agent")
        .build()
}
