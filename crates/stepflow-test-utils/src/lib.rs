//! Test doubles for stepflow collaborators.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{ChatStep, HumanFrontEnd, ToolCall};
use stepflow_core::types::{ChatMessage, RequestInfoMessage};

/// Chat step that replays canned replies and records every call.
///
/// Each call consumes the next reply; the last one repeats once the script
/// runs out.
pub struct ScriptedChat {
    name: String,
    replies: Mutex<VecDeque<Vec<String>>>,
    last: Mutex<Vec<String>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    /// Always answer with `chunks`, streamed in order.
    pub fn new(name: &str, chunks: Vec<&str>) -> Self {
        Self::with_replies(name, vec![chunks.into_iter().map(String::from).collect()])
    }

    /// Answer successive calls with successive single-chunk replies.
    pub fn sequence(name: &str, replies: Vec<&str>) -> Self {
        Self::with_replies(name, replies.into_iter().map(|r| vec![r.to_string()]).collect())
    }

    fn with_replies(name: &str, replies: Vec<Vec<String>>) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(replies.into()),
            last: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Turns received by each call so far.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_reply(&self) -> Vec<String> {
        let mut last = self.last.lock().unwrap();
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            *last = reply;
        }
        last.clone()
    }
}

impl ChatStep for ScriptedChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat_stream(
        &self,
        turns: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(turns);
            let chunks = self.next_reply();
            Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
        })
    }
}

/// Chat step whose stream fails immediately.
pub struct FailingChat {
    name: String,
    message: String,
}

impl FailingChat {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl ChatStep for FailingChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat_stream(
        &self,
        _turns: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            Err(StepflowError::Collaborator {
                name: self.name.clone(),
                message: self.message.clone(),
            })
        })
    }
}

/// Chat step that sleeps before answering "late".
pub struct SlowChat {
    name: String,
    delay: Duration,
}

impl SlowChat {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

impl ChatStep for SlowChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat_stream(
        &self,
        _turns: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(stream::iter(vec![Ok("late".to_string())]).boxed())
        })
    }
}

/// Tool that returns a fixed result and records the arguments of every call.
pub struct RecordingTool {
    name: String,
    result: serde_json::Value,
    calls: Mutex<Vec<serde_json::Value>>,
}

impl RecordingTool {
    pub fn new(name: &str, result: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            result,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Arguments received so far.
    pub fn calls(&self) -> Vec<serde_json::Value> {
        self.calls.lock().unwrap().clone()
    }
}

impl ToolCall for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(args);
            Ok(self.result.clone())
        })
    }
}

/// Human front end that answers from a script and records the prompts.
pub struct ScriptedFrontEnd {
    answers: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<RequestInfoMessage>>,
}

impl ScriptedFrontEnd {
    pub fn new(answers: Vec<&str>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(String::from).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Requests shown so far.
    pub fn asked(&self) -> Vec<RequestInfoMessage> {
        self.asked.lock().unwrap().clone()
    }
}

impl HumanFrontEnd for ScriptedFrontEnd {
    fn ask<'a>(&'a self, request: &'a RequestInfoMessage) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.asked.lock().unwrap().push(request.clone());
            self.answers.lock().unwrap().pop_front().ok_or_else(|| {
                StepflowError::Collaborator {
                    name: "human".to_string(),
                    message: "script exhausted".to_string(),
                }
            })
        })
    }
}

/// Human front end that never answers.
pub struct SilentFrontEnd;

impl HumanFrontEnd for SilentFrontEnd {
    fn ask<'a>(&'a self, _request: &'a RequestInfoMessage) -> BoxFuture<'a, Result<String>> {
        Box::pin(futures::future::pending())
    }
}

/// A temp dir plus a database path inside it. Keep the dir alive for the test.
pub fn temp_db_path() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    (dir, path)
}
