use std::sync::Arc;

use tracing::{error, info};

use stepflow_core::error::{Result, StepflowError};
use stepflow_engine::Workflow;

use crate::collaborators::Collaborators;
use crate::{
    basic_sequence, conditional, fan_out, loop_eval, multi_agent_tooling, search_hitl,
    search_summarize, sequential,
};

/// Name -> workflow lookup, in registration order.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: Vec<Arc<Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every reference workflow. A workflow that fails to
    /// build is logged and left out.
    pub fn with_defaults(collaborators: &Collaborators) -> Self {
        let builders: Vec<(&str, Result<Workflow>)> = vec![
            (basic_sequence::WORKFLOW_ID, basic_sequence::build()),
            (sequential::WORKFLOW_ID, sequential::build(collaborators)),
            (conditional::WORKFLOW_ID, conditional::build()),
            (fan_out::WORKFLOW_ID, fan_out::build()),
            (loop_eval::WORKFLOW_ID, loop_eval::build()),
            (search_summarize::WORKFLOW_ID, search_summarize::build(collaborators)),
            (search_hitl::WORKFLOW_ID, search_hitl::build(collaborators)),
            (
                multi_agent_tooling::WORKFLOW_ID,
                multi_agent_tooling::build(collaborators),
            ),
        ];

        let mut registry = Self::new();
        for (name, built) in builders {
            match built {
                Ok(workflow) => {
                    info!(workflow = name, "Registered workflow");
                    registry.register(workflow);
                }
                Err(e) => error!(workflow = name, error = %e, "Failed to build workflow"),
            }
        }
        registry
    }

    /// Add a workflow, replacing any with the same id.
    pub fn register(&mut self, workflow: Workflow) {
        let workflow = Arc::new(workflow);
        match self.workflows.iter_mut().find(|w| w.id() == workflow.id()) {
            Some(slot) => *slot = workflow,
            None => self.workflows.push(workflow),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Workflow>> {
        self.workflows
            .iter()
            .find(|w| w.id() == name)
            .cloned()
            .ok_or_else(|| StepflowError::WorkflowNotFound {
                name: name.to_string(),
                available: self.names().join(", "),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.workflows.iter().map(|w| w.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> WorkflowRegistry {
        WorkflowRegistry::with_defaults(&Collaborators::offline(Duration::from_secs(5)))
    }

    #[test]
    fn registers_all_reference_workflows() {
        let registry = registry();
        assert_eq!(
            registry.names(),
            vec![
                "BasicSequence",
                "SequentialExecutors",
                "ConditionalBranching",
                "ParallelFanOut",
                "LoopWithEvaluation",
                "SearchAndSummarize",
                "SearchWithHitL",
                "SearchWithMultiAgentAndTooling",
            ]
        );
        assert_eq!(registry.get("ParallelFanOut").unwrap().id(), "ParallelFanOut");
    }

    #[test]
    fn unknown_name_lists_available() {
        let err = registry().get("Nope").unwrap_err();
        match err {
            StepflowError::WorkflowNotFound { name, available } => {
                assert_eq!(name, "Nope");
                assert!(available.starts_with("BasicSequence, SequentialExecutors"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn register_replaces_same_id() {
        let mut registry = WorkflowRegistry::new();
        registry.register(basic_sequence::build().unwrap());
        registry.register(basic_sequence::build().unwrap());
        assert_eq!(registry.len(), 1);
    }
}
