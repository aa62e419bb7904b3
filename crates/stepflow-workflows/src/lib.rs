//! Reference workflows built on the stepflow engine, and a registry that
//! resolves them by name.

pub mod basic_sequence;
pub mod collaborators;
pub mod conditional;
pub mod fan_out;
pub mod loop_eval;
pub mod multi_agent_tooling;
pub mod registry;
pub mod search_hitl;
pub mod search_summarize;
pub mod sequential;

pub use collaborators::{AgentStep, Collaborators, EchoChat};
pub use registry::WorkflowRegistry;
