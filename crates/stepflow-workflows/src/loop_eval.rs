use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use stepflow_core::error::Result;
use stepflow_core::types::{Message, MessageKind};
use stepflow_engine::{FnExecutor, Workflow, WorkflowBuilder, WorkflowContext};

pub const WORKFLOW_ID: &str = "LoopWithEvaluation";

/// Text at least this long (in chars) ends the loop.
pub const MIN_LEN: usize = 10;

fn dispatch(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        ctx.send_message(message);
        Ok(())
    })
}

fn transform(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let next = format!("{}!", message.as_text().unwrap_or_default());
        let rounds = ctx.get_local("rounds").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        ctx.set_local("rounds", json!(rounds));
        ctx.send_message(next);
        Ok(())
    })
}

fn judge(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let text = message.as_text().unwrap_or_default();
        if text.chars().count() < MIN_LEN {
            info!(text, "Too short, looping again");
            ctx.send_message(text.to_string());
        } else {
            info!(text, "Long enough");
            ctx.send_message(Message::Json(json!({ "action": "done", "text": text })));
        }
        Ok(())
    })
}

fn finish(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        match &message {
            Message::Json(data) => {
                let text = data.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                ctx.yield_output(text.to_string());
            }
            other => {
                warn!(kind = %other.kind(), "Unexpected non-json input");
                ctx.yield_output(other.to_display_string());
            }
        }
        Ok(())
    })
}

fn is_text(message: &Message) -> bool {
    matches!(message, Message::Text(_))
}

fn is_done(message: &Message) -> bool {
    match message {
        Message::Json(data) => data.get("action").and_then(|v| v.as_str()) == Some("done"),
        _ => false,
    }
}

/// `dispatcher -> transform -> judge`, with `judge -> transform` while the
/// text is short and `judge -> output` once it is long enough.
pub fn build() -> Result<Workflow> {
    WorkflowBuilder::new(WORKFLOW_ID)
        .add_executor(FnExecutor::new("dispatcher").on(MessageKind::Text, dispatch))
        .add_executor(FnExecutor::new("transform").on(MessageKind::Text, transform))
        .add_executor(FnExecutor::new("judge").on(MessageKind::Text, judge))
        .add_executor(
            FnExecutor::new("output")
                .on(MessageKind::Json, finish)
                .on(MessageKind::Text, finish),
        )
        .set_start_executor("dispatcher")
        .add_edge("dispatcher", "transform")
        .add_edge("transform", "judge")
        .add_conditional_edge("judge", "transform", is_text)
        .add_conditional_edge("judge", "output", is_done)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::types::RunState;
    use stepflow_engine::{RunOptions, WorkflowRunner};

    #[tokio::test]
    async fn grows_until_long_enough() {
        let mut run = WorkflowRunner::new(build().unwrap()).start("hello");
        let outcome = run.run_until_suspended().await.unwrap();
        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.output_text().as_deref(), Some("hello!!!!!"));

        // 10 - len("hello") transform rounds.
        let rounds = run
            .snapshot()
            .local_state("transform")
            .and_then(|s| s.get("rounds"))
            .cloned();
        assert_eq!(rounds, Some(json!(5)));
        // dispatcher, then (transform, judge) per round, then output.
        assert_eq!(outcome.supersteps, 1 + 2 * 5 + 1);
    }

    #[tokio::test]
    async fn long_input_runs_one_round() {
        let outcome = WorkflowRunner::new(build().unwrap())
            .run("already long")
            .await
            .unwrap();
        assert_eq!(outcome.output_text().as_deref(), Some("already long!"));
    }

    #[tokio::test]
    async fn superstep_guard_stops_the_loop() {
        let outcome = WorkflowRunner::new(build().unwrap())
            .with_options(RunOptions {
                max_supersteps: Some(4),
                ..Default::default()
            })
            .run("a")
            .await
            .unwrap();
        assert!(outcome.is_failed());
    }

    #[test]
    fn predicates_are_disjoint() {
        let short = Message::text("hi");
        let done = Message::Json(json!({"action": "done", "text": "x"}));
        assert!(is_text(&short) && !is_done(&short));
        assert!(is_done(&done) && !is_text(&done));
    }
}
