//! Superstep workflow engine.
//!
//! A [`Workflow`] is an immutable graph of [`Executor`]s joined by [`Edge`]s,
//! validated by [`WorkflowBuilder::build`]. A [`WorkflowRunner`] starts or
//! resumes [`WorkflowRun`]s; each run drains its work queue one superstep at a
//! time, so messages sent in superstep N are only seen in superstep N+1.
//! Runs suspend when a request-info sink is waiting on a human answer and are
//! checkpointed through a [`CheckpointManager`] at that point.

pub mod checkpoint;
pub mod collaborator;
pub mod graph;
pub mod hitl;
pub mod runner;
pub mod snapshot;

pub use checkpoint::{
    open_storage, Checkpoint, CheckpointManager, CheckpointStorage, FileCheckpointStorage,
    InMemoryCheckpointStorage, SqliteCheckpointStorage,
};
pub use graph::{
    Edge, EdgeKind, Executor, FnExecutor, HandlerFn, Predicate, Selector, Workflow,
    WorkflowBuilder, WorkflowContext,
};
pub use hitl::{drive_interactive, HitlLedger, PendingRequest, RequestInfoExecutor, RequestStatus};
pub use runner::{RunOptions, RunOutcome, WorkflowRun, WorkflowRunner};
pub use snapshot::{Delivery, RunSnapshot};
