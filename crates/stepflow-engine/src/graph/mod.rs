//! Graph definition: executors, edges and the validated workflow.
//!
//! A workflow is a directed graph of [`Executor`]s connected by [`Edge`]s.
//! Edges are direct, conditional (pure predicate over the message), fan-out,
//! fan-in or multi-selection. [`WorkflowBuilder::build`] validates the graph
//! once; the resulting [`Workflow`] is immutable and can back any number of
//! isolated runs.

pub mod context;
pub mod edge;
pub mod executor;
pub mod workflow;

pub(crate) use context::Outgoing;
pub use context::WorkflowContext;
pub use edge::{Edge, EdgeKind, Predicate, Selector};
pub use executor::{Executor, FnExecutor, HandlerFn};
pub use workflow::{Workflow, WorkflowBuilder};
