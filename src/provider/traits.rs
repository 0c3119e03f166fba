use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Everything a single reasoning-engine call needs.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub thinking_level: ThinkingLevel,
}

/// Tool definition sent to the LLM (schema only, no execute fn)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The engine's answer: one assistant message, plus token usage when reported.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub usage: Option<Usage>,
}

/// The core provider trait. Implement this for each LLM backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run one completion over the full history.
    async fn generate(
        &self,
        request: ChatRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Provider returned an empty response")]
    EmptyResponse,
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            Self::Api(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// An attached reasoning engine: the provider plus what it can do.
#[derive(Clone)]
pub struct Llm {
    pub provider: Arc<dyn ChatProvider>,
    pub model: String,
    /// Total context window (input + output), in tokens.
    pub max_context_size: usize,
    pub capabilities: HashSet<Capability>,
}

impl Llm {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        max_context_size: usize,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            max_context_size,
            capabilities: HashSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

impl std::fmt::Debug for Llm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Llm")
            .field("model", &self.model)
            .field("max_context_size", &self.max_context_size)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
