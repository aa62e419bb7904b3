use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepflowError {
    // Build-time errors
    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    // Runtime errors
    #[error("Handler failed in executor {executor}: {message}")]
    Handler { executor: String, message: String },

    #[error("Run exceeded max supersteps ({0})")]
    SuperstepLimit(usize),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid run state: {0}")]
    InvalidRunState(String),

    // Checkpoint errors
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint belongs to workflow {found}, expected {expected}")]
    WorkflowMismatch { expected: String, found: String },

    // HITL errors
    #[error("Unknown or already answered request: {0}")]
    UnknownOrAnsweredRequest(String),

    // Collaborator errors
    #[error("Collaborator timeout after {timeout_secs}s: {name}")]
    CollaboratorTimeout { name: String, timeout_secs: u64 },

    #[error("Collaborator failed: {name}: {message}")]
    Collaborator { name: String, message: String },

    // Registry errors
    #[error("Workflow '{name}' not found. Available: {available}")]
    WorkflowNotFound { name: String, available: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepflowError {
    /// Shorthand for a handler failure raised from inside an executor.
    pub fn handler(executor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            executor: executor.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StepflowError>;
