use stepflow_core::error::Result;
use stepflow_core::types::MessageKind;
use stepflow_engine::{FnExecutor, Workflow, WorkflowBuilder};

use crate::collaborators::{input_to_chat, AgentStep, Collaborators};

pub const WORKFLOW_ID: &str = "SequentialExecutors";

/// `input_to_chat -> general_agent -> summarizer`: two chat steps in a row,
/// the second one producing the output.
pub fn build(collaborators: &Collaborators) -> Result<Workflow> {
    WorkflowBuilder::new(WORKFLOW_ID)
        .add_executor(FnExecutor::new("input_to_chat").on(MessageKind::Text, input_to_chat))
        .add_executor(AgentStep::forward(
            "general_agent",
            collaborators.general.clone(),
            collaborators.timeout,
        ))
        .add_executor(AgentStep::finish(
            "summarizer",
            collaborators.summarizer.clone(),
            collaborators.timeout,
        ))
        .set_start_executor("input_to_chat")
        .add_edge("input_to_chat", "general_agent")
        .add_edge("general_agent", "summarizer")
        .build()
}
