//! Serde tests for messages and embeddable configuration.

use timeloop::*;

fn roundtrip<T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug>(
    value: &T,
) {
    let json = serde_json::to_string(value).expect("serialize");
    let back: T = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(*value, back);
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[test]
fn test_message_variants_roundtrip() {
    roundtrip(&Message::user("Hello"));
    roundtrip(&Message::system("You are terse."));
    roundtrip(&Message::Assistant {
        content: vec![
            Content::Thinking {
                thinking: "let me look".into(),
            },
            Content::text("Checking."),
            Content::ToolCall {
                id: "tc-1".into(),
                name: "bash".into(),
                arguments: serde_json::json!({"command": "ls -la"}),
            },
        ],
        model: "kimi".into(),
        timestamp: 789,
    });
    roundtrip(&Message::ToolResult {
        tool_call_id: "tc-1".into(),
        tool_name: "bash".into(),
        content: vec![Content::text("Exit code: 0\n")],
        is_error: false,
        timestamp: 999,
    });
}

#[test]
fn test_message_wire_tags() {
    let json = serde_json::to_value(Message::ToolResult {
        tool_call_id: "tc-1".into(),
        tool_name: "bash".into(),
        content: vec![Content::image(b"abc", "image/png")],
        is_error: true,
        timestamp: 1,
    })
    .unwrap();
    assert_eq!(json["role"], "toolResult");
    assert_eq!(json["toolCallId"], "tc-1");
    assert_eq!(json["isError"], true);
    assert_eq!(json["content"][0]["type"], "image");
    assert_eq!(json["content"][0]["mimeType"], "image/png");
    assert_eq!(json["content"][0]["data"], "YWJj");
}

#[test]
fn test_full_conversation_roundtrip() {
    let conversation = vec![
        Message::user(system_tag("CHECKPOINT 0")),
        Message::user("Find the flag."),
        Message::Assistant {
            content: vec![Content::ToolCall {
                id: "tc-1".into(),
                name: "submit_answer".into(),
                arguments: serde_json::json!({"flag": "flag{x}"}),
            }],
            model: "mock".into(),
            timestamp: 2,
        },
        Message::ToolResult {
            tool_call_id: "tc-1".into(),
            tool_name: "submit_answer".into(),
            content: vec![Content::text("{\"correct\": true}")],
            is_error: false,
            timestamp: 3,
        },
    ];
    let json = serde_json::to_string(&conversation).unwrap();
    let back: Vec<Message> = serde_json::from_str(&json).unwrap();
    assert_eq!(conversation, back);
    assert_eq!(back[2].tool_calls()[0].name, "submit_answer");
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
struct AppConfig {
    #[serde(default)]
    model: ModelConfig,
    #[serde(default)]
    loop_control: LoopControl,
    #[serde(default)]
    loop_guard: LoopGuardConfig,
}

#[test]
fn test_config_sections_embed_with_defaults() {
    let config: AppConfig = serde_json::from_value(serde_json::json!({
        "model": {
            "base_url": "http://localhost:8000/v1",
            "model": "local",
            "capabilities": ["image_in", "thinking"]
        },
        "loop_control": {"max_steps_per_run": 15, "max_corrections_per_run": 2},
        "loop_guard": {"shell_tools": ["bash", "sh"], "enabled": false}
    }))
    .unwrap();

    assert_eq!(config.model.base_url, "http://localhost:8000/v1");
    assert_eq!(config.model.max_context_size, 128_000);
    assert_eq!(
        config.model.capabilities,
        vec![Capability::ImageIn, Capability::Thinking]
    );

    assert_eq!(
        config.loop_control,
        LoopControl::default()
            .with_max_steps(15)
            .with_max_corrections(2)
    );

    assert!(!config.loop_guard.enabled);
    assert_eq!(config.loop_guard.shell_tools, vec!["bash", "sh"]);
    assert_eq!(config.loop_guard.trigger_count, 18);
}

#[test]
fn test_empty_config_is_all_defaults() {
    let config: AppConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config.model, ModelConfig::default());
    assert_eq!(config.loop_control, LoopControl::default());
    assert_eq!(config.loop_guard, LoopGuardConfig::default());
    assert_eq!(config.loop_control.retry_config().max_attempts, 3);
}

#[test]
fn test_model_config_builds_engine() {
    let llm = ModelConfig {
        capabilities: vec![Capability::Thinking],
        ..Default::default()
    }
    .into_llm()
    .unwrap();
    assert_eq!(llm.model, "kimi-k2-turbo-preview");
    assert!(llm.supports(Capability::Thinking));
    assert!(!llm.supports(Capability::ImageIn));
}
