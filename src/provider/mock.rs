//! Mock provider for testing. No real API calls.

use super::traits::*;
use crate::types::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// A scripted response: plain text, tool calls, or a provider failure.
#[derive(Debug)]
pub enum MockResponse {
    Text(String),
    ToolCalls(Vec<MockToolCall>),
    Error(ProviderError),
}

#[derive(Debug, Clone)]
pub struct MockToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

impl MockToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Mock LLM provider for tests. Supply a sequence of responses.
pub struct MockProvider {
    responses: Mutex<Vec<MockResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    usage: Option<Usage>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            usage: None,
        }
    }

    /// Convenience: provider that always returns the same text
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![MockResponse::Text(text.into())])
    }

    /// Convenience: sequence of text responses
    pub fn texts(texts: Vec<impl Into<String>>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|t| MockResponse::Text(t.into()))
                .collect(),
        )
    }

    /// Report this usage on every successful response.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Number of `generate` calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn generate(
        &self,
        request: ChatRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let call_no = self.calls.fetch_add(1, Ordering::SeqCst);
        let model = request.model.clone();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let response = {
            let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
            if responses.is_empty() {
                MockResponse::Text("(no more mock responses)".into())
            } else {
                responses.remove(0)
            }
        };

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let content = match response {
            MockResponse::Error(e) => return Err(e),
            MockResponse::Text(text) => vec![Content::Text { text }],
            MockResponse::ToolCalls(calls) => calls
                .into_iter()
                .enumerate()
                .map(|(i, call)| Content::ToolCall {
                    id: format!("mock-{}-{}", call_no, i),
                    name: call.name,
                    arguments: call.arguments,
                })
                .collect(),
        };

        Ok(ChatResponse {
            message: Message::Assistant {
                content,
                model,
                timestamp: now_ms(),
            },
            usage: self.usage,
        })
    }
}
