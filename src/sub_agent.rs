//! Sub-agent tool: delegates a task to a nested agent loop.
//!
//! - **Context isolation**: each invocation starts with an empty context
//! - **Own approval session**: the child's tools ask through
//!   [`Approval::child`], and its requests are forwarded to the parent's
//!   outbound channel tagged with the child session id
//! - **Cancellation propagation**: the tool call's cancel token drives the child run
//! - **Step limit**: the child has its own, smaller step budget

use crate::agent::Agent;
use crate::agent_loop::{AgentLoop, FinishReason};
use crate::approval::Approval;
use crate::config::LoopControl;
use crate::error::RunError;
use crate::provider::Llm;
use crate::registry::{CapabilityRegistry, Dependency, DependencyKind, ToolFactory, ToolRegistry};
use crate::timeline::TimelineController;
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Default max steps for sub-agents (prevents runaway execution).
const DEFAULT_MAX_STEPS: usize = 10;

pub struct SubAgentTool {
    tool_name: String,
    tool_description: String,
    system_prompt: String,
    llm: Llm,
    approval: Approval,
    outbound: mpsc::UnboundedSender<AgentEvent>,
    tools: Arc<ToolRegistry>,
    loop_control: LoopControl,
}

impl SubAgentTool {
    /// `approval` and `outbound` belong to the parent; the child gets its
    /// own session derived from `approval`.
    pub fn new(
        name: impl Into<String>,
        llm: Llm,
        approval: Approval,
        outbound: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        let name = name.into();
        Self {
            tool_description: format!("Delegate a task to the '{}' sub-agent", name),
            tool_name: name,
            system_prompt: String::new(),
            llm,
            approval,
            outbound,
            tools: Arc::new(ToolRegistry::new()),
            loop_control: LoopControl::default().with_max_steps(DEFAULT_MAX_STEPS),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.tool_description = desc.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Tools are built per invocation so they bind to the child session.
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_loop_control(mut self, loop_control: LoopControl) -> Self {
        self.loop_control = loop_control;
        self
    }

    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.loop_control.max_steps_per_run = max;
        self
    }

    /// Registry factory: needs the parent's approval, outbound channel and engine.
    pub fn factory(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        tools: Arc<ToolRegistry>,
    ) -> ToolFactory {
        let name = name.into();
        let system_prompt = system_prompt.into();
        let tool_name = name.clone();
        ToolFactory::new(
            name,
            vec![
                DependencyKind::Approval,
                DependencyKind::Outbound,
                DependencyKind::Llm,
            ],
            move |registry| {
                let approval =
                    registry.require(&tool_name, DependencyKind::Approval, CapabilityRegistry::approval)?;
                let outbound =
                    registry.require(&tool_name, DependencyKind::Outbound, CapabilityRegistry::outbound)?;
                let llm = registry.require(&tool_name, DependencyKind::Llm, CapabilityRegistry::llm)?;
                Ok(Box::new(
                    SubAgentTool::new(tool_name.clone(), llm.clone(), approval.clone(), outbound.clone())
                        .with_system_prompt(system_prompt.clone())
                        .with_tools(Arc::clone(&tools)),
                ) as Box<dyn AgentTool>)
            },
        )
    }
}

#[async_trait]
impl AgentTool for SubAgentTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn label(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.tool_description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task to delegate to this sub-agent"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let task = params
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("Missing required 'task' parameter".into()))?
            .to_string();

        let approval = self.approval.child();
        let timeline = TimelineController::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let capabilities = CapabilityRegistry::new()
            .provide(Dependency::Approval(approval.clone()))
            .provide(Dependency::Timeline(timeline.clone()))
            .provide(Dependency::Outbound(tx.clone()))
            .provide(Dependency::Llm(self.llm.clone()));
        let toolset = self
            .tools
            .build_toolset(&capabilities, &[])
            .map_err(|e| ToolError::Failed(format!("sub-agent setup failed: {}", e)))?;
        drop(capabilities);

        let agent = Agent::new(self.tool_name.clone())
            .with_system_prompt(self.system_prompt.clone())
            .with_toolset(toolset);
        let mut child = AgentLoop::new(agent, tx)
            .with_llm(self.llm.clone())
            .with_loop_control(self.loop_control.clone())
            .with_approval(approval.clone())
            .with_timeline(timeline);

        // Only approval requests concern the parent; the rest is the child's business.
        let parent = self.outbound.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let AgentEvent::ApprovalRequested(request) = event {
                    parent.send(AgentEvent::ApprovalRequested(request)).ok();
                }
            }
        });

        debug!(sub_agent = %self.tool_name, session = %approval.session_id(), "starting sub-agent");
        let result = child.prompt(task, ctx.cancel.clone()).await;
        let final_text = extract_final_text(child.context().history());
        drop(child);
        let _ = forward.await;

        let summary = match result {
            Ok(summary) => summary,
            Err(RunError::Interrupted) => return Err(ToolError::Cancelled),
            Err(e) => return Err(ToolError::Failed(format!("sub-agent failed: {}", e))),
        };
        if summary.reason == FinishReason::ToolRejected {
            return Err(ToolError::Rejected);
        }

        Ok(ToolResult {
            content: vec![Content::Text { text: final_text }],
            details: serde_json::json!({
                "sub_agent": self.tool_name,
                "session_id": approval.session_id().to_string(),
                "steps": summary.steps,
            }),
        })
    }
}

/// Extract the final assistant text from the child's history.
fn extract_final_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .filter(|m| matches!(m, Message::Assistant { .. }))
        .map(Message::text)
        .find(|text| !text.is_empty())
        .unwrap_or_else(|| "(sub-agent produced no text output)".to_string())
}
