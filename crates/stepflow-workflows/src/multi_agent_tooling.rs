use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{info, warn};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{ChatStep, ToolCall};
use stepflow_core::types::{ChatMessage, Message, MessageKind};
use stepflow_engine::collaborator::{call_tool, run_chat};
use stepflow_engine::{Executor, FnExecutor, Workflow, WorkflowBuilder, WorkflowContext};

use crate::collaborators::{extract_urls, input_to_query, Collaborators, USER_QUERY_KEY};

pub const WORKFLOW_ID: &str = "SearchWithMultiAgentAndTooling";

pub const RESEARCH_TITLE_KEY: &str = "research_title";
pub const FOLDER_PATH_KEY: &str = "folder_path";
pub const SEARCH_RESULTS_KEY: &str = "search_results";
pub const SUMMARY_INDEX_KEY: &str = "summary_index";
pub const FINAL_SUMMARY_KEY: &str = "final_summary";

const UNTITLED: &str = "untitled";
const MAX_URLS: usize = 10;

fn shared_str(ctx: &WorkflowContext, key: &str) -> String {
    ctx.shared_state().get_str(key).unwrap_or_default().to_string()
}

fn ensure_chat(id: &str, message: &Message) -> Result<()> {
    match message {
        Message::Chat(_) => Ok(()),
        other => Err(StepflowError::handler(
            id,
            format!("unexpected {} message", other.kind()),
        )),
    }
}

/// Tool results are plain strings; anything else is kept as JSON text.
fn tool_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// One chat exchange with a single user turn.
struct Prompted {
    id: &'static str,
    chat: Arc<dyn ChatStep>,
    timeout: Duration,
}

impl Prompted {
    async fn ask(&self, prompt: String, ctx: &WorkflowContext) -> Result<String> {
        let reply = run_chat(
            self.chat.as_ref(),
            vec![ChatMessage::user(prompt)],
            self.timeout,
            ctx.cancel_token(),
        )
        .await?;
        Ok(reply.trim().to_string())
    }
}

/// Names the research from the question.
struct TitleStep(Prompted);

impl Executor for TitleStep {
    fn id(&self) -> &str {
        self.0.id
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
            ensure_chat(self.id(), &message)?;
            let prompt = format!(
                "Write a short title for research on: {}",
                shared_str(ctx, USER_QUERY_KEY)
            );
            let reply = self.0.ask(prompt, ctx).await?;
            let title = match reply.lines().next().map(str::trim) {
                Some(line) if !line.is_empty() => line.to_string(),
                _ => UNTITLED.to_string(),
            };
            info!(title = %title, "Research titled");
            ctx.set_shared(RESEARCH_TITLE_KEY, json!(title));
            ctx.send_message(ChatMessage::assistant(title));
            Ok(())
        })
    }
}

/// Creates the research folder through the folder tool.
struct FolderStep {
    tool: Arc<dyn ToolCall>,
}

impl Executor for FolderStep {
    fn id(&self) -> &str {
        "folder_creator"
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
            ensure_chat(self.id(), &message)?;
            let title = shared_str(ctx, RESEARCH_TITLE_KEY);
            let args = json!({ "title": title });
            let folder = tool_text(call_tool(self.tool.as_ref(), args, ctx.cancel_token()).await?);
            info!(folder = %folder, "Research folder ready");
            ctx.set_shared(FOLDER_PATH_KEY, json!(folder));
            ctx.request_checkpoint();
            ctx.send_message(ChatMessage::assistant(format!("Folder ready: {}", folder)));
            Ok(())
        })
    }
}

/// Searches for sources on the research title.
struct SearchStep(Prompted);

impl Executor for SearchStep {
    fn id(&self) -> &str {
        self.0.id
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
            ensure_chat(self.id(), &message)?;
            let prompt = format!(
                "Search for the topic: {}",
                shared_str(ctx, RESEARCH_TITLE_KEY)
            );
            let reply = self.0.ask(prompt, ctx).await?;
            let urls = extract_urls(&reply, MAX_URLS);
            info!(count = urls.len(), "Search found URLs");
            ctx.set_shared(SEARCH_RESULTS_KEY, json!(urls));
            ctx.send_message(ChatMessage::assistant(format!("Found {} URLs.", urls.len())));
            Ok(())
        })
    }
}

/// Stores a summary per found URL through the collector tool. With no URLs
/// nothing is sent on and the run goes idle.
struct CollectStep {
    tool: Arc<dyn ToolCall>,
}

impl Executor for CollectStep {
    fn id(&self) -> &str {
        "collector_agent"
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
            ensure_chat(self.id(), &message)?;
            let urls = ctx.get_shared(SEARCH_RESULTS_KEY).cloned().unwrap_or_else(|| json!([]));
            if urls.as_array().map_or(true, Vec::is_empty) {
                warn!("No URLs to collect");
                return Ok(());
            }
            let args = json!({ "folder": shared_str(ctx, FOLDER_PATH_KEY), "urls": urls });
            let index = tool_text(call_tool(self.tool.as_ref(), args, ctx.cancel_token()).await?);
            ctx.set_shared(SUMMARY_INDEX_KEY, json!(index));
            ctx.request_checkpoint();
            ctx.send_message(ChatMessage::assistant("All pages processed and saved."));
            Ok(())
        })
    }
}

/// Writes the final summary from the stored index.
struct AggregateStep(Prompted);

impl Executor for AggregateStep {
    fn id(&self) -> &str {
        self.0.id
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
            ensure_chat(self.id(), &message)?;
            let prompt = format!(
                "Research: {}\nQuestion: {}\n\nSaved summaries:\n{}\n\nWrite the final research summary.",
                shared_str(ctx, RESEARCH_TITLE_KEY),
                shared_str(ctx, USER_QUERY_KEY),
                shared_str(ctx, SUMMARY_INDEX_KEY)
            );
            let summary = self.0.ask(prompt, ctx).await?;
            info!(chars = summary.len(), "Research summary produced");
            ctx.set_shared(FINAL_SUMMARY_KEY, json!(summary));
            ctx.yield_output(summary);
            Ok(())
        })
    }
}

/// Title the research, create its folder, search, store a summary per
/// source, then aggregate. The two tool steps request a checkpoint.
///
/// ```text
/// input_to_chat -> title_generator -> folder_creator -> search_agent
///               -> collector_agent -> research_aggregator
/// ```
pub fn build(collaborators: &Collaborators) -> Result<Workflow> {
    let prompted = |id, chat: &Arc<dyn ChatStep>| Prompted {
        id,
        chat: chat.clone(),
        timeout: collaborators.timeout,
    };
    WorkflowBuilder::new(WORKFLOW_ID)
        .add_executor(FnExecutor::new("input_to_chat").on(MessageKind::Text, input_to_query))
        .add_executor(TitleStep(prompted("title_generator", &collaborators.title)))
        .add_executor(FolderStep {
            tool: collaborators.folders.clone(),
        })
        .add_executor(SearchStep(prompted("search_agent", &collaborators.search)))
        .add_executor(CollectStep {
            tool: collaborators.collector.clone(),
        })
        .add_executor(AggregateStep(prompted(
            "research_aggregator",
            &collaborators.aggregator,
        )))
        .set_start_executor("input_to_chat")
        .add_edge("input_to_chat", "title_generator")
        .add_edge("title_generator", "folder_creator")
        .add_edge("folder_creator", "search_agent")
        .add_edge("search_agent", "collector_agent")
        .add_edge("collector_agent", "research_aggregator")
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::types::RunState;
    use stepflow_engine::{CheckpointManager, WorkflowRunner};
    use stepflow_test_utils::{RecordingTool, ScriptedChat};

    struct Fixture {
        folders: Arc<RecordingTool>,
        collector: Arc<RecordingTool>,
        aggregator: Arc<ScriptedChat>,
        collaborators: Collaborators,
    }

    fn fixture(search_reply: &str) -> Fixture {
        let folders = Arc::new(RecordingTool::new("create_folder", json!("research/rust-async")));
        let collector = Arc::new(RecordingTool::new("store_summaries", json!("- index")));
        let aggregator = Arc::new(ScriptedChat::new("aggregator", vec!["Final summary."]));
        let collaborators = Collaborators {
            title: Arc::new(ScriptedChat::new("title", vec!["Rust Async\nextra line"])),
            search: Arc::new(ScriptedChat::new("search", vec![search_reply])),
            aggregator: aggregator.clone(),
            folders: folders.clone(),
            collector: collector.clone(),
            ..Collaborators::offline(Duration::from_secs(5))
        };
        Fixture {
            folders,
            collector,
            aggregator,
            collaborators,
        }
    }

    #[tokio::test]
    async fn tools_receive_title_folder_and_urls() {
        let f = fixture("see https://a.io and https://b.io");
        let mut run = WorkflowRunner::new(build(&f.collaborators).unwrap()).start("async rust");
        let outcome = run.run_until_suspended().await.unwrap();

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.output_text().as_deref(), Some("Final summary."));
        assert_eq!(f.folders.calls(), vec![json!({"title": "Rust Async"})]);
        assert_eq!(
            f.collector.calls(),
            vec![json!({
                "folder": "research/rust-async",
                "urls": ["https://a.io", "https://b.io"],
            })]
        );
        assert_eq!(
            f.aggregator.calls()[0][0].text,
            "Research: Rust Async\nQuestion: async rust\n\nSaved summaries:\n- index\n\n\
             Write the final research summary."
        );

        let shared = &run.snapshot().shared_state;
        assert_eq!(shared.get_str(FOLDER_PATH_KEY), Some("research/rust-async"));
        assert_eq!(shared.get_str(FINAL_SUMMARY_KEY), Some("Final summary."));
    }

    #[tokio::test]
    async fn no_urls_stops_before_collecting() {
        let f = fixture("nothing relevant");
        let outcome = WorkflowRunner::new(build(&f.collaborators).unwrap())
            .run("async rust")
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Idle);
        assert!(outcome.outputs.is_empty());
        assert_eq!(f.folders.calls().len(), 1);
        assert!(f.collector.calls().is_empty());
        assert_eq!(f.aggregator.call_count(), 0);
    }

    #[tokio::test]
    async fn resumes_after_collected_pages() {
        let f = fixture("https://a.io");
        let manager = CheckpointManager::in_memory();
        let runner = WorkflowRunner::new(build(&f.collaborators).unwrap())
            .with_checkpointing(manager.clone());
        runner.run("async rust").await.unwrap();

        let checkpoints = manager.list(Some(WORKFLOW_ID)).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        let latest = checkpoints
            .iter()
            .max_by_key(|cp| cp.snapshot.superstep)
            .unwrap();
        assert_eq!(latest.snapshot.shared_state.get_str(SUMMARY_INDEX_KEY), Some("- index"));

        let mut resumed = runner.resume(&latest.checkpoint_id).await.unwrap();
        let outcome = resumed.run_until_suspended().await.unwrap();
        assert_eq!(outcome.output_text().as_deref(), Some("Final summary."));
        assert_eq!(f.collector.calls().len(), 1);
    }
}
