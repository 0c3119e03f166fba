//! Tests for built-in tools.

use std::time::Duration;
use timeloop::approval::ApprovalResponse;
use timeloop::tools::*;
use timeloop::*;
use tokio_util::sync::CancellationToken;

/// Helper to build a ToolContext for tests.
fn ctx(name: &str) -> ToolContext {
    ToolContext {
        tool_call_id: "t1".into(),
        tool_name: name.into(),
        cancel: CancellationToken::new(),
    }
}

fn ctx_with_cancel(name: &str, cancel: CancellationToken) -> ToolContext {
    ToolContext {
        tool_call_id: "t1".into(),
        tool_name: name.into(),
        cancel,
    }
}

fn text_of(result: &ToolResult) -> &str {
    match &result.content[0] {
        Content::Text { text } => text,
        _ => panic!("expected text"),
    }
}

fn yolo_bash() -> BashTool {
    BashTool::new(Approval::new(true))
}

#[tokio::test]
async fn test_bash_echo() {
    let result = yolo_bash()
        .execute(serde_json::json!({"command": "echo hello"}), ctx("bash"))
        .await
        .unwrap();

    let text = text_of(&result);
    assert!(text.contains("hello"));
    assert!(text.contains("Exit code: 0"));
    assert_eq!(result.details["success"], true);
}

#[tokio::test]
async fn test_bash_failure() {
    // Non-zero exit codes return Ok with exit code in output (for LLM self-correction)
    let result = yolo_bash()
        .execute(
            serde_json::json!({"command": "echo oops >&2; exit 3"}),
            ctx("bash"),
        )
        .await
        .unwrap();

    let text = text_of(&result);
    assert!(text.contains("Exit code: 3"));
    assert!(text.contains("STDERR:\noops"));
    assert_eq!(result.details["exit_code"], 3);
}

#[tokio::test]
async fn test_bash_cwd() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

    let tool = yolo_bash().with_cwd(dir.path().to_string_lossy());
    let result = tool
        .execute(serde_json::json!({"command": "cat marker.txt"}), ctx("bash"))
        .await
        .unwrap();
    assert!(text_of(&result).contains("here"));
}

#[tokio::test]
async fn test_bash_output_is_capped() {
    let tool = yolo_bash().with_max_output_bytes(16);
    let result = tool
        .execute(
            serde_json::json!({"command": "printf 'x%.0s' $(seq 1 100)"}),
            ctx("bash"),
        )
        .await
        .unwrap();
    let text = text_of(&result);
    assert!(text.contains("(output truncated)"));
    assert!(!text.contains(&"x".repeat(17)));
}

#[tokio::test]
async fn test_bash_deny_pattern() {
    // denied before approval is even asked, so a non-yolo session never sees it
    let approval = Approval::new(false);
    let tool = BashTool::new(approval.clone());
    let result = tool
        .execute(serde_json::json!({"command": "rm -rf / --no-preserve-root"}), ctx("bash"))
        .await;
    match result {
        Err(ToolError::Failed(msg)) => assert!(msg.contains("blocked")),
        other => panic!("unexpected: {:?}", other),
    }

    let custom = BashTool::new(Approval::new(true)).with_deny_patterns(vec!["shutdown".into()]);
    assert!(custom
        .execute(serde_json::json!({"command": "shutdown -h now"}), ctx("bash"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_bash_missing_command() {
    let result = yolo_bash().execute(serde_json::json!({}), ctx("bash")).await;
    assert!(matches!(result, Err(ToolError::InvalidArgs(_))));
}

#[tokio::test]
async fn test_bash_timeout() {
    let tool = yolo_bash().with_timeout(Duration::from_millis(200));
    let result = tool
        .execute(serde_json::json!({"command": "sleep 5"}), ctx("bash"))
        .await;
    match result {
        Err(ToolError::Failed(msg)) => assert!(msg.contains("timed out")),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_bash_cancel() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = yolo_bash()
        .execute(
            serde_json::json!({"command": "sleep 5"}),
            ctx_with_cancel("bash", cancel),
        )
        .await;
    assert!(matches!(result, Err(ToolError::Cancelled)));
}

#[tokio::test]
async fn test_bash_rejected_by_user() {
    let approval = Approval::new(false);
    let questions = approval.clone();
    let responder = tokio::spawn(async move {
        let request = questions.fetch_request().await.unwrap();
        assert_eq!(request.sender, "bash");
        assert!(request.description.contains("touch /tmp/never"));
        request.resolve(ApprovalResponse::Reject);
    });

    let result = BashTool::new(approval)
        .execute(serde_json::json!({"command": "touch /tmp/never"}), ctx("bash"))
        .await;
    assert!(matches!(result, Err(ToolError::Rejected)));
    responder.await.unwrap();
}

#[tokio::test]
async fn test_bash_approve_for_session() {
    let approval = Approval::new(false);
    let questions = approval.clone();
    let responder = tokio::spawn(async move {
        let request = questions.fetch_request().await.unwrap();
        request.resolve(ApprovalResponse::ApproveForSession);
    });

    let tool = BashTool::new(approval);
    tool.execute(serde_json::json!({"command": "echo one"}), ctx("bash"))
        .await
        .unwrap();
    responder.await.unwrap();

    // second command runs without anyone answering
    let result = tool
        .execute(serde_json::json!({"command": "echo two"}), ctx("bash"))
        .await
        .unwrap();
    assert!(text_of(&result).contains("two"));
}

#[tokio::test]
async fn test_default_registry() {
    let tools = default_registry().unwrap();
    assert_eq!(tools.names(), vec!["bash", "send_correction"]);

    let capabilities = CapabilityRegistry::new()
        .provide(Dependency::Approval(Approval::new(true)))
        .provide(Dependency::Timeline(TimelineController::new()));
    let toolset = tools.build_toolset(&capabilities, &[]).unwrap();
    assert_eq!(toolset.len(), 2);
    assert!(toolset.contains("bash"));

    let only_timeline =
        CapabilityRegistry::new().provide(Dependency::Timeline(TimelineController::new()));
    let toolset = tools.build_toolset(&only_timeline, &["Bash"]).unwrap();
    assert_eq!(toolset.names(), vec!["send_correction"]);
    assert!(tools.build_toolset(&only_timeline, &[]).is_err());
}
