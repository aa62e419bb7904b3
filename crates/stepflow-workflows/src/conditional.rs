use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::json;
use tracing::info;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::{Message, MessageKind};
use stepflow_engine::{FnExecutor, Workflow, WorkflowBuilder, WorkflowContext};

pub const WORKFLOW_ID: &str = "ConditionalBranching";

const SUPPORT: &str = "support_exec";
const SALES: &str = "sales_exec";
const HR: &str = "hr_exec";
const FALLBACK: &str = "fallback_exec";

const INTENT_PATTERNS: &[(&str, &str)] = &[
    ("support", r"(error|issue|problem|bug)"),
    ("sales", r"(buy|price|quote|discount)"),
    ("hr", r"(job|hiring|career|salary|hire)"),
];

type IntentPatterns = Vec<(&'static str, Regex)>;

fn compile_patterns(specs: &[(&'static str, &str)]) -> Result<IntentPatterns> {
    specs
        .iter()
        .map(|(intent, pattern)| {
            Regex::new(pattern).map(|re| (*intent, re)).map_err(|e| {
                StepflowError::GraphValidation(format!("classifier: bad '{}' pattern: {}", intent, e))
            })
        })
        .collect()
}

/// Keyword patterns, checked in order; the first match wins.
fn intent_patterns() -> Result<&'static [(&'static str, Regex)]> {
    static PATTERNS: OnceLock<std::result::Result<IntentPatterns, String>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            compile_patterns(INTENT_PATTERNS).map_err(|e| match e {
                StepflowError::GraphValidation(msg) => msg,
                other => other.to_string(),
            })
        })
        .as_deref()
        .map_err(|e| StepflowError::GraphValidation(e.to_string()))
}

/// Keyword intent of already-normalized text, or `"unknown"`.
pub fn classify_intent(text: &str) -> Result<&'static str> {
    Ok(intent_patterns()?
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(intent, _)| *intent)
        .unwrap_or("unknown"))
}

/// Pick the handler for the classified intent. Pure over the message.
pub fn select_targets(message: &Message, candidates: &[String]) -> Vec<String> {
    let intent = match message {
        Message::Json(data) => data.get("intent").and_then(|v| v.as_str()),
        _ => None,
    };
    let target = match intent {
        Some("support") => SUPPORT,
        Some("sales") => SALES,
        Some("hr") => HR,
        _ => FALLBACK,
    };
    candidates
        .iter()
        .filter(|c| c.as_str() == target)
        .cloned()
        .collect()
}

fn normalize(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let normalized = message.as_text().unwrap_or_default().trim().to_lowercase();
        ctx.send_message(normalized);
        Ok(())
    })
}

fn classify(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let text = message.as_text().unwrap_or_default();
        let intent = classify_intent(text)?;
        info!(intent, "Intent detected");
        ctx.send_message(Message::Json(json!({ "intent": intent, "content": text })));
        Ok(())
    })
}

fn content(message: &Message, executor: &str) -> Result<String> {
    match message {
        Message::Json(data) => Ok(data
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()),
        other => Err(StepflowError::handler(
            executor,
            format!("expected classified json, got {}", other.kind()),
        )),
    }
}

fn support(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let content = content(&message, SUPPORT)?;
        ctx.yield_output(format!("Support: '{}'", content));
        Ok(())
    })
}

fn sales(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let content = content(&message, SALES)?;
        ctx.yield_output(format!("Sales: '{}'", content));
        Ok(())
    })
}

fn hr(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let content = content(&message, HR)?;
        ctx.yield_output(format!("HR: '{}'", content));
        Ok(())
    })
}

fn fallback(message: Message, ctx: &mut WorkflowContext) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let content = content(&message, FALLBACK)?;
        ctx.yield_output(format!("Unknown intent: '{}'", content));
        Ok(())
    })
}

/// `normalize -> classifier -> {support, sales, hr, fallback}`, routed by a
/// multi-selection edge group over the detected intent.
pub fn build() -> Result<Workflow> {
    intent_patterns()?;
    WorkflowBuilder::new(WORKFLOW_ID)
        .add_executor(FnExecutor::new("normalize").on(MessageKind::Text, normalize))
        .add_executor(FnExecutor::new("classifier").on(MessageKind::Text, classify))
        .add_executor(FnExecutor::new(SUPPORT).on(MessageKind::Json, support))
        .add_executor(FnExecutor::new(SALES).on(MessageKind::Json, sales))
        .add_executor(FnExecutor::new(HR).on(MessageKind::Json, hr))
        .add_executor(FnExecutor::new(FALLBACK).on(MessageKind::Json, fallback))
        .set_start_executor("normalize")
        .add_edge("normalize", "classifier")
        .add_multi_selection_edges("classifier", &[SUPPORT, SALES, HR, FALLBACK], select_targets)
        .build()
}
