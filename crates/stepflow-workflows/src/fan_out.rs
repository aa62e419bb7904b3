use futures::future::BoxFuture;
use tracing::debug;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::{Message, MessageKind};
use stepflow_engine::{FnExecutor, Workflow, WorkflowBuilder, WorkflowContext};

use crate::basic_sequence::to_upper;

pub const WORKFLOW_ID: &str = "ParallelFanOut";

/// Separator between branch results in the aggregated output.
pub const SEPARATOR: &str = " | ";

fn dispatch(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        debug!("Dispatching to parallel branches");
        ctx.send_message(message);
        Ok(())
    })
}

fn reverse(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let result: String = message.as_text().unwrap_or_default().chars().rev().collect();
        ctx.send_message(result);
        Ok(())
    })
}

fn aggregate(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let Message::Batch(items) = message else {
            return Err(StepflowError::handler("aggregator", "expected a batch"));
        };
        let merged = items
            .iter()
            .map(Message::to_display_string)
            .collect::<Vec<_>>()
            .join(SEPARATOR);
        debug!(branches = items.len(), "Aggregated");
        ctx.yield_output(merged);
        Ok(())
    })
}

/// `dispatcher => {upper, reverse} => aggregator`: fan the input out to two
/// branches and join their results in declared branch order.
pub fn build() -> Result<Workflow> {
    WorkflowBuilder::new(WORKFLOW_ID)
        .add_executor(FnExecutor::new("dispatcher").on(MessageKind::Text, dispatch))
        .add_executor(FnExecutor::new("upper").on(MessageKind::Text, to_upper))
        .add_executor(FnExecutor::new("reverse").on(MessageKind::Text, reverse))
        .add_executor(FnExecutor::new("aggregator").on(MessageKind::Batch, aggregate))
        .set_start_executor("dispatcher")
        .add_fan_out_edges("dispatcher", &["upper", "reverse"])
        .add_fan_in_edges(&["upper", "reverse"], "aggregator")
        .build()
}
