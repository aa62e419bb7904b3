use futures::future::BoxFuture;
use tracing::debug;

use stepflow_core::error::Result;
use stepflow_core::types::{Message, MessageKind};
use stepflow_engine::{FnExecutor, Workflow, WorkflowBuilder, WorkflowContext};

pub const WORKFLOW_ID: &str = "BasicSequence";

pub(crate) fn to_upper(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let text = message.as_text().unwrap_or_default();
        let result = text.to_uppercase();
        debug!(executor = ctx.executor_id(), input = text, output = %result, "Uppercased");
        ctx.send_message(result);
        Ok(())
    })
}

fn reverse_and_finish(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let result: String = message.as_text().unwrap_or_default().chars().rev().collect();
        ctx.yield_output(result);
        Ok(())
    })
}

/// `upper -> reverse`: uppercases the input, then yields it reversed.
pub fn build() -> Result<Workflow> {
    WorkflowBuilder::new(WORKFLOW_ID)
        .add_executor(FnExecutor::new("upper").on(MessageKind::Text, to_upper))
        .add_executor(FnExecutor::new("reverse").on(MessageKind::Text, reverse_and_finish))
        .set_start_executor("upper")
        .add_edge("upper", "reverse")
        .build()
}
