//! Agent definition: a name, a system prompt and the tools it may call.

use crate::provider::ToolDefinition;
use crate::types::*;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a single tool call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Ok,
    Error,
    /// The user declined an approval the tool asked for.
    Rejected,
}

/// One executed tool call with its result message.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call: ToolCall,
    pub message: Message,
    pub status: ToolStatus,
}

/// The tools an agent may call, looked up by name.
#[derive(Default)]
pub struct Toolset {
    tools: Vec<Box<dyn AgentTool>>,
}

impl Toolset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tool: Box<dyn AgentTool>) {
        self.tools.push(tool);
    }

    pub fn with(mut self, tool: impl AgentTool + 'static) -> Self {
        self.add(Box::new(tool));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&dyn AgentTool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas sent to the reasoning engine.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Run all calls concurrently. Outcomes come back in request order,
    /// whatever order the calls finish in.
    pub async fn execute(
        &self,
        calls: &[ToolCall],
        tx: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Vec<ToolOutcome> {
        let futures: Vec<_> = calls
            .iter()
            .map(|call| self.execute_one(call, tx, cancel))
            .collect();
        join_all(futures).await
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        tx: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        tx.send(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        })
        .ok();

        let result = match self.get(&call.name) {
            Some(tool) => {
                let ctx = ToolContext {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    cancel: cancel.child_token(),
                };
                tool.execute(call.arguments.clone(), ctx).await
            }
            None => Err(ToolError::NotFound(call.name.clone())),
        };

        let (content, status) = match result {
            Ok(result) => (result.content, ToolStatus::Ok),
            Err(ToolError::Rejected) => (
                vec![Content::text(ToolError::Rejected.to_string())],
                ToolStatus::Rejected,
            ),
            Err(e) => {
                warn!(tool = %call.name, "tool call failed: {}", e);
                (vec![Content::text(e.to_string())], ToolStatus::Error)
            }
        };
        debug!(tool = %call.name, ?status, "tool call finished");

        let is_error = status != ToolStatus::Ok;
        tx.send(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            is_error,
        })
        .ok();

        ToolOutcome {
            call: call.clone(),
            message: Message::ToolResult {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content,
                is_error,
                timestamp: now_ms(),
            },
            status,
        }
    }
}

impl std::fmt::Debug for Toolset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// What the loop drives: identity, instructions and tools.
#[derive(Debug, Default)]
pub struct Agent {
    pub name: String,
    pub system_prompt: String,
    pub toolset: Toolset,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tool(mut self, tool: impl AgentTool + 'static) -> Self {
        self.toolset.add(Box::new(tool));
        self
    }

    pub fn with_toolset(mut self, toolset: Toolset) -> Self {
        self.toolset = toolset;
        self
    }
}
