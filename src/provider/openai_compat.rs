//! OpenAI Chat Completions compatible provider (non-streaming).
//!
//! Works against any endpoint speaking the Chat Completions dialect
//! (Moonshot/Kimi, OpenAI, DeepSeek, OpenRouter, local servers).
//! Status codes are surfaced as `ProviderError::Status` so the retry
//! policy can decide what is transient.

use super::traits::*;
use crate::types::*;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Per-request timeout. A timed-out request surfaces as `ProviderError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ProviderError> {
        self.client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn generate(
        &self,
        request: ChatRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = build_request_body(&request);
        debug!("OpenAI compat request: model={} url={}", request.model, url);

        let send = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = send => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("OpenAI compat error: status={} body={}", status, message);
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth(message),
                code => ProviderError::Status {
                    status: code,
                    message,
                },
            });
        }

        let completion: Completion = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            parsed = response.json::<Completion>() => parsed?,
        };

        parse_completion(completion, &request.model)
    }
}

fn build_request_body(request: &ChatRequest) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();

    if !request.system_prompt.is_empty() {
        messages.push(serde_json::json!({
            "role": "system",
            "content": request.system_prompt,
        }));
    }

    for msg in &request.messages {
        match msg {
            Message::System { content, .. } => messages.push(serde_json::json!({
                "role": "system",
                "content": content_to_openai(content),
            })),
            Message::User { content, .. } => messages.push(serde_json::json!({
                "role": "user",
                "content": content_to_openai(content),
            })),
            Message::Assistant { content, .. } => {
                let text = msg.text();
                let tool_calls: Vec<serde_json::Value> = content
                    .iter()
                    .filter_map(|c| match c {
                        Content::ToolCall {
                            id,
                            name,
                            arguments,
                        } => Some(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": arguments.to_string()},
                        })),
                        _ => None,
                    })
                    .collect();

                let mut obj = serde_json::json!({"role": "assistant", "content": text});
                if !tool_calls.is_empty() {
                    obj["tool_calls"] = serde_json::json!(tool_calls);
                }
                messages.push(obj);
            }
            Message::ToolResult {
                tool_call_id,
                content,
                ..
            } => messages.push(serde_json::json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content_to_openai(content),
            })),
        }
    }

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    let effort = match request.thinking_level {
        ThinkingLevel::Off => None,
        ThinkingLevel::Minimal | ThinkingLevel::Low => Some("low"),
        ThinkingLevel::Medium => Some("medium"),
        ThinkingLevel::High => Some("high"),
    };
    if let Some(effort) = effort {
        body["reasoning_effort"] = serde_json::json!(effort);
    }

    body
}

fn content_to_openai(content: &[Content]) -> serde_json::Value {
    if let [Content::Text { text }] = content {
        return serde_json::json!(text);
    }
    let parts: Vec<serde_json::Value> = content
        .iter()
        .filter_map(|c| match c {
            Content::Text { text } => Some(serde_json::json!({"type": "text", "text": text})),
            Content::Image { data, mime_type } => Some(serde_json::json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{};base64,{}", mime_type, data)},
            })),
            _ => None,
        })
        .collect();
    serde_json::json!(parts)
}

fn parse_completion(completion: Completion, model: &str) -> Result<ChatResponse, ProviderError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(ProviderError::EmptyResponse)?;

    let mut content = Vec::new();
    if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
        content.push(Content::Thinking {
            thinking: reasoning,
        });
    }
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(Content::Text { text });
    }
    for call in choice.message.tool_calls {
        let arguments = if call.function.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                ProviderError::Api(format!(
                    "invalid arguments for tool call {}: {}",
                    call.function.name, e
                ))
            })?
        };
        content.push(Content::ToolCall {
            id: call.id,
            name: call.function.name,
            arguments,
        });
    }

    if !content
        .iter()
        .any(|c| matches!(c, Content::Text { .. } | Content::ToolCall { .. }))
    {
        return Err(ProviderError::EmptyResponse);
    }

    Ok(ChatResponse {
        message: Message::Assistant {
            content,
            model: model.to_string(),
            timestamp: now_ms(),
        },
        usage: completion.usage.map(|u| Usage {
            input: u.prompt_tokens,
            output: u.completion_tokens,
            total: u.total_tokens,
        }),
    })
}

// Chat Completions response types
#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "kimi-k2".into(),
            system_prompt: "be brief".into(),
            messages,
            tools: vec![ToolDefinition {
                name: "bash".into(),
                description: "run".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            thinking_level: ThinkingLevel::High,
        }
    }

    #[test]
    fn test_body_includes_system_tools_and_effort() {
        let body = build_request_body(&request(vec![Message::user("hi")]));
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["tools"][0]["function"]["name"], "bash");
        assert_eq!(body["reasoning_effort"], "high");
    }

    #[test]
    fn test_body_serializes_tool_round_trip() {
        let assistant = Message::Assistant {
            content: vec![Content::ToolCall {
                id: "call_1".into(),
                name: "bash".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
            model: "kimi-k2".into(),
            timestamp: 0,
        };
        let result = Message::ToolResult {
            tool_call_id: "call_1".into(),
            tool_name: "bash".into(),
            content: vec![Content::text("file.txt")],
            is_error: false,
            timestamp: 0,
        };
        let body = build_request_body(&request(vec![assistant, result]));
        let calls = &body["messages"][1]["tool_calls"];
        assert_eq!(calls[0]["function"]["arguments"], "{\"command\":\"ls\"}");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_image_becomes_data_url() {
        let value = content_to_openai(&[Content::text("look"), Content::image(b"png", "image/png")]);
        let url = value[1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_empty_choice_is_empty_response() {
        let completion: Completion =
            serde_json::from_value(serde_json::json!({"choices": [{"message": {"content": ""}}]}))
                .unwrap();
        assert!(matches!(
            parse_completion(completion, "m"),
            Err(ProviderError::EmptyResponse)
        ));
    }
}
