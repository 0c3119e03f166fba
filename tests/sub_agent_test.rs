//! Tests for SubAgentTool using MockProvider.

use async_trait::async_trait;
use std::sync::Arc;
use timeloop::approval::ApprovalResponse;
use timeloop::provider::{MockProvider, MockResponse, MockToolCall};
use timeloop::tools::BashTool;
use timeloop::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn ctx(name: &str, cancel: CancellationToken) -> ToolContext {
    ToolContext {
        tool_call_id: "parent-call".into(),
        tool_name: name.into(),
        cancel,
    }
}

fn llm(provider: &Arc<MockProvider>) -> Llm {
    Llm::new(provider.clone(), "mock", 200_000)
}

fn text_of(result: &ToolResult) -> &str {
    match &result.content[0] {
        Content::Text { text } => text,
        _ => panic!("expected text"),
    }
}

struct EchoTool;

#[async_trait]
impl AgentTool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn label(&self) -> &str {
        "Echo"
    }
    fn description(&self) -> &str {
        "Echo the input"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }
    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::text(params["text"].as_str().unwrap_or("")))
    }
}

fn echo_registry() -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new()
        .with(ToolFactory::new("echo", vec![], |_| {
            Ok(Box::new(EchoTool) as Box<dyn AgentTool>)
        }))
        .unwrap();
    Arc::new(registry)
}

fn bash_registry() -> Arc<ToolRegistry> {
    Arc::new(ToolRegistry::new().with(BashTool::factory()).unwrap())
}

// ---------------------------------------------------------------------------
// Basic sub-agent execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sub_agent_basic() {
    let provider = Arc::new(MockProvider::text("Research result: Rust is great"));
    let (tx, _rx) = mpsc::unbounded_channel();

    let sub_agent = SubAgentTool::new("researcher", llm(&provider), Approval::new(false), tx)
        .with_description("Researches topics")
        .with_system_prompt("You are a research assistant.");
    assert_eq!(sub_agent.name(), "researcher");
    assert_eq!(sub_agent.description(), "Researches topics");

    let result = sub_agent
        .execute(
            serde_json::json!({"task": "Tell me about Rust"}),
            ctx("researcher", CancellationToken::new()),
        )
        .await
        .unwrap();

    assert_eq!(text_of(&result), "Research result: Rust is great");
    assert_eq!(result.details["sub_agent"], "researcher");
    assert_eq!(result.details["steps"], 1);

    // fresh context: only the task, no parent history
    let request = &provider.requests()[0];
    assert_eq!(request.system_prompt, "You are a research assistant.");
    assert_eq!(request.messages.len(), 1);
    assert_eq!(request.messages[0].text(), "Tell me about Rust");
}

#[tokio::test]
async fn test_sub_agent_with_tools() {
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::ToolCalls(vec![MockToolCall::new(
            "echo",
            serde_json::json!({"text": "intermediate"}),
        )]),
        MockResponse::Text("Final answer after tool".into()),
    ]));
    let (tx, _rx) = mpsc::unbounded_channel();
    let sub_agent = SubAgentTool::new("worker", llm(&provider), Approval::new(false), tx)
        .with_tools(echo_registry());

    let result = sub_agent
        .execute(
            serde_json::json!({"task": "use the tool"}),
            ctx("worker", CancellationToken::new()),
        )
        .await
        .unwrap();
    assert_eq!(text_of(&result), "Final answer after tool");
    assert_eq!(result.details["steps"], 2);
    assert_eq!(provider.requests()[0].tools.len(), 1);
}

#[tokio::test]
async fn test_sub_agent_max_steps() {
    let responses = (0..10)
        .map(|i| {
            MockResponse::ToolCalls(vec![MockToolCall::new(
                "echo",
                serde_json::json!({"text": format!("loop {}", i)}),
            )])
        })
        .collect();
    let provider = Arc::new(MockProvider::new(responses));
    let (tx, _rx) = mpsc::unbounded_channel();
    let sub_agent = SubAgentTool::new("looper", llm(&provider), Approval::new(false), tx)
        .with_tools(echo_registry())
        .with_max_steps(3);

    let result = sub_agent
        .execute(
            serde_json::json!({"task": "never stop"}),
            ctx("looper", CancellationToken::new()),
        )
        .await;
    match result {
        Err(ToolError::Failed(msg)) => {
            assert!(msg.contains("Max number of steps reached: 3"), "{}", msg)
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn test_sub_agent_cancellation() {
    let provider = Arc::new(MockProvider::text("never seen"));
    let (tx, _rx) = mpsc::unbounded_channel();
    let sub_agent = SubAgentTool::new("worker", llm(&provider), Approval::new(false), tx);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = sub_agent
        .execute(serde_json::json!({"task": "anything"}), ctx("worker", cancel))
        .await;
    assert!(matches!(result, Err(ToolError::Cancelled)));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_sub_agent_missing_task_parameter() {
    let provider = Arc::new(MockProvider::text("unused"));
    let (tx, _rx) = mpsc::unbounded_channel();
    let sub_agent = SubAgentTool::new("worker", llm(&provider), Approval::new(false), tx);

    let result = sub_agent
        .execute(serde_json::json!({}), ctx("worker", CancellationToken::new()))
        .await;
    assert!(matches!(result, Err(ToolError::InvalidArgs(_))));
}

#[test]
fn test_sub_agent_factory_declares_parent_dependencies() {
    let tools = ToolRegistry::new()
        .with(SubAgentTool::factory("researcher", "", echo_registry()))
        .unwrap();
    let only_approval = CapabilityRegistry::new().provide(Dependency::Approval(Approval::new(false)));
    let err = tools.build_toolset(&only_approval, &[]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "unresolved tool dependencies: researcher needs outbound, researcher needs llm"
    );
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sub_agent_forwards_approval_requests() {
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::ToolCalls(vec![MockToolCall::new(
            "bash",
            serde_json::json!({"command": "echo from child"}),
        )]),
        MockResponse::Text("child done".into()),
    ]));
    let parent_approval = Approval::new(false);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub_agent = SubAgentTool::new("shell", llm(&provider), parent_approval.clone(), tx)
        .with_tools(bash_registry());

    let responder = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Some(AgentEvent::ApprovalRequested(request)) => {
                    assert_eq!(request.sender, "bash");
                    request.resolve(ApprovalResponse::Approve);
                    return request.session_id;
                }
                Some(_) => continue,
                None => panic!("channel closed before any approval request"),
            }
        }
    });

    let result = sub_agent
        .execute(
            serde_json::json!({"task": "say hi"}),
            ctx("shell", CancellationToken::new()),
        )
        .await
        .unwrap();
    assert_eq!(text_of(&result), "child done");

    let session = responder.await.unwrap();
    assert_ne!(session, parent_approval.session_id());
    assert_eq!(result.details["session_id"], session.to_string());

    // the command really ran in the child
    let tool_output = provider.requests()[1]
        .messages
        .iter()
        .find(|m| matches!(m, Message::ToolResult { .. }))
        .map(|m| m.text())
        .unwrap();
    assert!(tool_output.contains("from child"));
}

#[tokio::test]
async fn test_sub_agent_rejection_propagates() {
    let provider = Arc::new(MockProvider::new(vec![MockResponse::ToolCalls(vec![
        MockToolCall::new("bash", serde_json::json!({"command": "rm important.txt"})),
    ])]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub_agent = SubAgentTool::new("shell", llm(&provider), Approval::new(false), tx)
        .with_tools(bash_registry());

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let AgentEvent::ApprovalRequested(request) = event {
                request.resolve(ApprovalResponse::Reject);
            }
        }
    });

    let result = sub_agent
        .execute(
            serde_json::json!({"task": "clean up"}),
            ctx("shell", CancellationToken::new()),
        )
        .await;
    assert!(matches!(result, Err(ToolError::Rejected)));
    assert_eq!(provider.calls(), 1);
}

// ---------------------------------------------------------------------------
// Inside a parent loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sub_agent_in_parent_loop() {
    // parent call, child call, parent call: strictly sequential
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::ToolCalls(vec![MockToolCall::new(
            "researcher",
            serde_json::json!({"task": "look around"}),
        )]),
        MockResponse::Text("child findings".into()),
        MockResponse::Text("all done".into()),
    ]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let approval = Approval::new(false);

    let tools = ToolRegistry::new()
        .with(SubAgentTool::factory(
            "researcher",
            "You research things.",
            echo_registry(),
        ))
        .unwrap();
    let capabilities = CapabilityRegistry::new()
        .provide(Dependency::Approval(approval.clone()))
        .provide(Dependency::Outbound(tx.clone()))
        .provide(Dependency::Llm(llm(&provider)));
    let toolset = tools.build_toolset(&capabilities, &[]).unwrap();

    let mut agent_loop = AgentLoop::new(Agent::new("main").with_toolset(toolset), tx)
        .with_llm(llm(&provider))
        .with_approval(approval);

    let summary = agent_loop
        .prompt("investigate", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.steps, 2);
    assert_eq!(provider.calls(), 3);

    let tool_result = agent_loop
        .context()
        .history()
        .iter()
        .find(|m| matches!(m, Message::ToolResult { .. }))
        .map(|m| m.text())
        .unwrap();
    assert_eq!(tool_result, "child findings");

    // the child's own steps stay off the parent channel
    let mut steps = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::StepBegin { step } = event {
            steps.push(step);
        }
    }
    assert_eq!(steps, vec![1, 2]);
}
