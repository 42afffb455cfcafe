//! Language-model client port.
//!
//! The engine never talks to a provider directly; it consumes this
//! contract. Semantic dependency analysis and LLM-assisted recovery are
//! best-effort consumers: a failing client degrades features, it does not
//! break execution.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::{EngineError, EngineResult};

/// One message of a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system", "user", or "assistant".
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Options for single-prompt requests.
#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    pub temperature: Option<f32>,
    /// Provider-specific response format hint (e.g. "json").
    pub response_format: Option<String>,
}

/// Client contract consumed by the engine.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Multi-message completion; returns the assistant's text.
    async fn complete(&self, messages: &[ChatMessage]) -> EngineResult<String>;

    /// Single-prompt completion.
    async fn send_message(&self, prompt: &str, opts: PromptOptions) -> EngineResult<String>;

    /// Completion expected to contain a structured (JSON) reply.
    ///
    /// The default implementation sends the prompt and parses the reply,
    /// falling back to a JSON string of the raw text when parsing fails.
    async fn complete_with_structured_response(&self, prompt: &str) -> EngineResult<Value> {
        let text = self
            .send_message(prompt, PromptOptions { response_format: Some("json".into()), ..Default::default() })
            .await?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Client used when no LLM is configured; every call fails cleanly.
#[derive(Debug, Default, Clone)]
pub struct NullLlm;

#[async_trait]
impl LlmClient for NullLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> EngineResult<String> {
        Err(EngineError::LlmUnavailable("no client configured".into()))
    }

    async fn send_message(&self, _prompt: &str, _opts: PromptOptions) -> EngineResult<String> {
        Err(EngineError::LlmUnavailable("no client configured".into()))
    }
}

/// Scripted client for tests: pops canned replies in order, then errors.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    replies: std::sync::Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> EngineResult<String> {
        self.send_message("", PromptOptions::default()).await
    }

    async fn send_message(&self, _prompt: &str, _opts: PromptOptions) -> EngineResult<String> {
        self.replies
            .lock()
            .expect("scripted llm lock")
            .pop_front()
            .ok_or_else(|| EngineError::LlmUnavailable("script exhausted".into()))
    }
}
