//! LLM provider client
//!
//! OpenAI-compatible chat-completions client used by the worker pipelines.
//! Responses stream over SSE; content deltas are handed to the caller as
//! they arrive and tool-call fragments are assembled across deltas. Every
//! call runs under a hard deadline and honours a cooperative cancel token
//! between stream chunks so a vanished peer aborts the request mid-flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::config::LlmConfig;
use crate::session::Session;
use crate::types::{HistoryEntry, Role};

#[derive(Debug, Error)]
pub enum LlmError {
    /// The per-call ceiling elapsed
    #[error("model call exceeded {0:?}")]
    Timeout(Duration),
    /// The peer went away; no user-visible error should be emitted
    #[error("call cancelled")]
    Cancelled,
    #[error("provider error: {0}")]
    Api(String),
    #[error("transport error: {0}")]
    Http(String),
}

/// Cooperative cancellation handle checked between stream chunks. Links to
/// a session so a transport disconnect aborts in-flight provider calls.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    session: Option<Arc<Session>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_session(session: Arc<Session>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            session: Some(session),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        self.session
            .as_ref()
            .map(|s| s.is_disconnected() || s.cancel_requested())
            .unwrap_or(false)
    }
}

/// One chat turn in provider wire format
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallOut>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant turn that requested tool invocations
    pub fn assistant_tool_calls(calls: Vec<ToolCallOut>) -> Self {
        Self {
            role: "assistant",
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

impl From<&HistoryEntry> for ChatMessage {
    fn from(entry: &HistoryEntry) -> Self {
        match entry.role {
            Role::System => ChatMessage::system(entry.content.clone()),
            Role::User => ChatMessage::user(entry.content.clone()),
            Role::Assistant => ChatMessage::assistant(entry.content.clone()),
            Role::Tool => ChatMessage {
                role: "tool",
                content: Some(entry.content.clone()),
                tool_calls: None,
                tool_call_id: None,
            },
        }
    }
}

/// Completed tool-call request assembled from the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCallOut {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them
    pub arguments: String,
}

/// Outcome of one streamed completion
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCallOut>,
}

/// Seam the workers call through; implemented by the HTTP client and by
/// scripted backends in tests.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Stream one completion. `model_override` carries the session's
    /// routing decision and takes precedence over the configured model;
    /// `on_delta` fires for each content fragment.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        model_override: Option<&str>,
        cancel: &CancelToken,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<StreamOutcome, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [serde_json::Value],
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: FunctionDelta,
}

#[derive(Debug, Deserialize, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates tool-call fragments keyed by stream index
#[derive(Default)]
struct ToolCallAssembler {
    partial: Vec<(String, String, String)>,
}

impl ToolCallAssembler {
    fn apply(&mut self, delta: &ToolCallDelta) {
        while self.partial.len() <= delta.index {
            self.partial.push((String::new(), String::new(), String::new()));
        }
        let slot = &mut self.partial[delta.index];
        if let Some(id) = &delta.id {
            slot.0.push_str(id);
        }
        if let Some(name) = &delta.function.name {
            slot.1.push_str(name);
        }
        if let Some(arguments) = &delta.function.arguments {
            slot.2.push_str(arguments);
        }
    }

    fn finish(self) -> Vec<ToolCallOut> {
        self.partial
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, arguments)| ToolCallOut {
                id,
                call_type: "function",
                function: FunctionCall { name, arguments },
            })
            .collect()
    }
}

/// HTTP client for an OpenAI-compatible endpoint
pub struct HttpLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl HttpLlm {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmBackend for HttpLlm {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        model_override: Option<&str>,
        cancel: &CancelToken,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<StreamOutcome, LlmError> {
        let deadline = Instant::now() + self.timeout;
        let request = ChatRequest {
            model: model_override.unwrap_or(&self.model),
            messages,
            max_tokens: self.max_tokens,
            stream: true,
            tools,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = tokio::time::timeout_at(deadline, builder.send())
            .await
            .map_err(|_| LlmError::Timeout(self.timeout))?
            .map_err(|e| LlmError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {body}")));
        }

        let mut stream = response.bytes_stream();
        let mut outcome = StreamOutcome::default();
        let mut assembler = ToolCallAssembler::default();
        let mut buffer = String::new();

        loop {
            if cancel.is_cancelled() {
                debug!("LLM stream cancelled mid-flight");
                return Err(LlmError::Cancelled);
            }
            let chunk = match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => return Err(LlmError::Timeout(self.timeout)),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(LlmError::Http(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are separated by blank lines
            while let Some(pos) = buffer.find("\n\n") {
                let event = buffer[..pos].to_string();
                buffer = buffer[pos + 2..].to_string();

                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) else {
                        continue;
                    };
                    let Some(choice) = parsed.choices.into_iter().next() else {
                        continue;
                    };
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            outcome.content.push_str(&content);
                            on_delta(&content);
                        }
                    }
                    for tool_delta in &choice.delta.tool_calls {
                        assembler.apply(tool_delta);
                    }
                }
            }
        }

        outcome.tool_calls = assembler.finish();
        Ok(outcome)
    }
}
