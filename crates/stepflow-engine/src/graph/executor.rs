use std::collections::BTreeMap;

use futures::future::BoxFuture;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::{Message, MessageKind};

use super::context::WorkflowContext;

/// A named processing node in a workflow.
///
/// Each executor declares which message variants it has handlers for;
/// the builder checks that table, and the scheduler refuses to dispatch a
/// variant the executor does not list. Per-run state lives in the
/// [`WorkflowContext`], not in the executor, so one executor value can serve
/// many isolated runs.
pub trait Executor: Send + Sync + 'static {
    /// Unique id within a workflow.
    fn id(&self) -> &str;

    /// Message variants this executor has a handler for.
    fn accepts(&self) -> &[MessageKind];

    /// Handle one message.
    fn handle<'a>(
        &'a self,
        message: Message,
        ctx: &'a mut WorkflowContext,
    ) -> BoxFuture<'a, Result<()>>;

    /// Request-info sinks park requests instead of forwarding them.
    fn is_request_sink(&self) -> bool {
        false
    }
}

/// Handler function stored in an [`FnExecutor`] table.
pub type HandlerFn = for<'a> fn(Message, &'a mut WorkflowContext) -> BoxFuture<'a, Result<()>>;

/// Executor built from a table of handler functions keyed by message variant.
///
/// ```ignore
/// fn to_upper(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
///     Box::pin(async move {
///         let text = message.as_text().unwrap_or_default().to_uppercase();
///         ctx.send_message(text);
///         Ok(())
///     })
/// }
///
/// let upper = FnExecutor::new("upper").on(MessageKind::Text, to_upper);
/// ```
pub struct FnExecutor {
    id: String,
    handlers: BTreeMap<MessageKind, HandlerFn>,
    kinds: Vec<MessageKind>,
}

impl FnExecutor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handlers: BTreeMap::new(),
            kinds: Vec::new(),
        }
    }

    /// Register the handler for one message variant (replaces any previous one).
    pub fn on(mut self, kind: MessageKind, handler: HandlerFn) -> Self {
        if self.handlers.insert(kind, handler).is_none() {
            self.kinds.push(kind);
        }
        self
    }
}

impl Executor for FnExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn accepts(&self) -> &[MessageKind] {
        &self.kinds
    }

    fn handle<'a>(
        &'a self,
        message: Message,
        ctx: &'a mut WorkflowContext,
    ) -> BoxFuture<'a, Result<()>> {
        match self.handlers.get(&message.kind()) {
            Some(handler) => handler(message, ctx),
            None => {
                let err = StepflowError::handler(
                    self.id.clone(),
                    format!("no handler for {} messages", message.kind()),
                );
                Box::pin(async move { Err(err) })
            }
        }
    }
}
