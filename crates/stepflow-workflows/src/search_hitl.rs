use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::ChatStep;
use stepflow_core::types::{ChatMessage, Message, MessageKind, RequestInfoMessage};
use stepflow_engine::collaborator::run_chat;
use stepflow_engine::{
    Executor, FnExecutor, RequestInfoExecutor, Workflow, WorkflowBuilder, WorkflowContext,
};

use crate::collaborators::{input_to_chat, AgentStep, Collaborators};

pub const WORKFLOW_ID: &str = "SearchWithHitL";

pub const APPROVAL_PROMPT: &str =
    "Do you want to create a full Markdown report? Reply 'yes' or 'no'.";
pub const DECLINED_OUTPUT: &str = "Human declined to continue.";
/// Characters of fetched text shown to the reviewer.
pub const PREVIEW_CHARS: usize = 400;
/// Shared-state key holding the fetched page text.
pub const FETCHED_TEXT_KEY: &str = "fetched_text";

const REVIEWER: &str = RequestInfoExecutor::DEFAULT_ID;
const SUMMARIZER: &str = "summarizer_agent";

/// Fetches content and publishes it to shared state for later steps.
struct FetchStep {
    chat: Arc<dyn ChatStep>,
    timeout: Duration,
}

impl Executor for FetchStep {
    fn id(&self) -> &str {
        "fetch_agent"
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
                return Err(StepflowError::handler(self.id(), "expected a chat message"));
            };
            let text = run_chat(self.chat.as_ref(), vec![turn], self.timeout, ctx.cancel_token())
                .await?
                .trim()
                .to_string();
            info!(chars = text.len(), "Fetched content");
            ctx.set_local("last_fetch_len", json!(text.len()));
            ctx.set_shared(FETCHED_TEXT_KEY, json!(text));
            ctx.send_message(ChatMessage::assistant(text));
            Ok(())
        })
    }
}

/// Summarizes the approved content, combining the instruction with the
/// fetched text.
struct SummarizeStep {
    chat: Arc<dyn ChatStep>,
    timeout: Duration,
}

impl Executor for SummarizeStep {
    fn id(&self) -> &str {
        SUMMARIZER
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
                return Err(StepflowError::handler(SUMMARIZER, "expected a chat message"));
            };
            let fetched = fetched_text(ctx, &turn.text);
            let combined = if fetched.is_empty() {
                turn.text.clone()
            } else {
                format!("{}\n\n---\n{}", turn.text, fetched)
            };
            let result = run_chat(
                self.chat.as_ref(),
                vec![ChatMessage::user(combined)],
                self.timeout,
                ctx.cancel_token(),
            )
            .await?
            .trim()
            .to_string();
            info!(chars = result.len(), "Summary produced");
            ctx.yield_output(result);
            Ok(())
        })
    }
}

/// Shared fetched text, or `fallback` when nothing was fetched.
fn fetched_text(ctx: &WorkflowContext, fallback: &str) -> String {
    ctx.shared_state()
        .get_str(FETCHED_TEXT_KEY)
        .unwrap_or(fallback)
        .trim()
        .to_string()
}

/// Asks the reviewer whether to continue, then routes on the answer.
fn approval_gateway(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        match message {
            Message::Chat(turn) => {
                let fetched = fetched_text(ctx, &turn.text);
                let preview: String = fetched.chars().take(PREVIEW_CHARS).collect();
                ctx.set_local("last_preview_len", json!(preview.chars().count()));
                let request = RequestInfoMessage::new(APPROVAL_PROMPT).with_preview(preview);
                ctx.request_info(REVIEWER, request);
                Ok(())
            }
            Message::Response(feedback) => {
                let reply = feedback.data.trim().to_lowercase();
                info!(reply = %reply, "Human replied");
                if reply == "yes" {
                    ctx.send_to(SUMMARIZER, ChatMessage::user("Proceed with full report"));
                } else {
                    ctx.yield_output(DECLINED_OUTPUT);
                }
                Ok(())
            }
            other => Err(StepflowError::handler(
                "approval_gateway",
                format!("unexpected {} message", other.kind()),
            )),
        }
    })
}

/// Search, fetch, ask a human, then summarize on approval.
///
/// ```text
/// input_to_chat -> search_agent -> fetch_agent -> approval_gateway <-> request_info
///                                                  approval_gateway -> summarizer_agent
/// ```
pub fn build(collaborators: &Collaborators) -> Result<Workflow> {
    WorkflowBuilder::new(WORKFLOW_ID)
        .add_executor(FnExecutor::new("input_to_chat").on(MessageKind::Text, input_to_chat))
        .add_executor(AgentStep::forward(
            "search_agent",
            collaborators.search.clone(),
            collaborators.timeout,
        ))
        .add_executor(FetchStep {
            chat: collaborators.fetch.clone(),
            timeout: collaborators.timeout,
        })
        .add_executor(
            FnExecutor::new("approval_gateway")
                .on(MessageKind::Chat, approval_gateway)
                .on(MessageKind::Response, approval_gateway),
        )
        .add_executor(RequestInfoExecutor::new(REVIEWER))
        .add_executor(SummarizeStep {
            chat: collaborators.summarizer.clone(),
            timeout: collaborators.timeout,
        })
        .set_start_executor("input_to_chat")
        .add_edge("input_to_chat", "search_agent")
        .add_edge("search_agent", "fetch_agent")
        .add_edge("fetch_agent", "approval_gateway")
        .add_edge("approval_gateway", REVIEWER)
        .add_edge(REVIEWER, "approval_gateway")
        .add_edge("approval_gateway", SUMMARIZER)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::types::RunState;
    use stepflow_engine::{drive_interactive, CheckpointManager, WorkflowRunner};
    use stepflow_test_utils::{ScriptedChat, ScriptedFrontEnd};

    struct Fixture {
        fetch: Arc<ScriptedChat>,
        summarizer: Arc<ScriptedChat>,
        collaborators: Collaborators,
    }

    fn fixture(fetched: &str) -> Fixture {
        let fetch = Arc::new(ScriptedChat::new("fetch", vec![fetched]));
        let summarizer = Arc::new(ScriptedChat::new("summarizer", vec!["# Report"]));
        let collaborators = Collaborators {
            search: Arc::new(ScriptedChat::new("search", vec!["https://example.org"])),
            fetch: fetch.clone(),
            summarizer: summarizer.clone(),
            ..Collaborators::offline(Duration::from_secs(5))
        };
        Fixture {
            fetch,
            summarizer,
            collaborators,
        }
    }

    #[tokio::test]
    async fn suspends_with_preview() {
        let long_page = "x".repeat(1000);
        let f = fixture(&long_page);
        let mut run = WorkflowRunner::new(build(&f.collaborators).unwrap()).start("rust news");
        let outcome = run.run_until_suspended().await.unwrap();

        assert_eq!(outcome.state, RunState::AwaitingInput);
        let request = &outcome.pending_requests[0];
        assert_eq!(request.prompt, APPROVAL_PROMPT);
        assert_eq!(request.source_executor, "approval_gateway");
        assert_eq!(request.preview.as_deref().map(str::len), Some(PREVIEW_CHARS));

        let snap = run.snapshot();
        assert_eq!(snap.shared_state.get_str(FETCHED_TEXT_KEY), Some(long_page.as_str()));
        assert_eq!(
            snap.local_state("fetch_agent").and_then(|s| s.get("last_fetch_len")),
            Some(&json!(1000))
        );
        assert_eq!(f.fetch.call_count(), 1);
    }

    #[tokio::test]
    async fn no_declines_without_summarizing() {
        let f = fixture("page body");
        let mut run = WorkflowRunner::new(build(&f.collaborators).unwrap()).start("rust news");
        let human = ScriptedFrontEnd::new(vec!["no"]);

        let outcome = drive_interactive(&mut run, &human, None).await.unwrap();
        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.output_text().as_deref(), Some(DECLINED_OUTPUT));
        assert_eq!(f.summarizer.call_count(), 0);
        assert_eq!(human.asked()[0].preview.as_deref(), Some("page body"));
    }

    #[tokio::test]
    async fn yes_summarizes_fetched_text() {
        let f = fixture("page body");
        let mut run = WorkflowRunner::new(build(&f.collaborators).unwrap()).start("rust news");
        let human = ScriptedFrontEnd::new(vec!["  YES "]);

        let outcome = drive_interactive(&mut run, &human, None).await.unwrap();
        assert_eq!(outcome.output_text().as_deref(), Some("# Report"));
        let prompt = &f.summarizer.calls()[0][0].text;
        assert_eq!(prompt, "Proceed with full report\n\n---\npage body");
    }

    #[tokio::test]
    async fn resumes_from_checkpoint() {
        let f = fixture("page body");
        let manager = CheckpointManager::in_memory();
        let runner = WorkflowRunner::new(build(&f.collaborators).unwrap())
            .with_checkpointing(manager.clone());

        let suspended = runner.run("rust news").await.unwrap();
        let checkpoint_id = suspended.checkpoint_id.unwrap();
        let request_id = suspended.pending_requests[0].request_id.clone();

        let mut resumed = runner.resume(&checkpoint_id).await.unwrap();
        let outcome = resumed.send_response(&request_id, "yes").await.unwrap();
        assert_eq!(outcome.output_text().as_deref(), Some("# Report"));
        // Fetch ran once, before the checkpoint.
        assert_eq!(f.fetch.call_count(), 1);
    }
}
