//! Bash tool: run shell commands after user approval.

use crate::approval::Approval;
use crate::registry::{CapabilityRegistry, DependencyKind, ToolFactory};
use crate::types::*;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

pub const BASH: &str = "bash";

/// Approval action key; approving it for the session covers all commands.
const RUN_COMMAND: &str = "run shell command";

/// Execute shell commands. Captures stdout + stderr.
pub struct BashTool {
    approval: Approval,
    /// Working directory for commands
    pub cwd: Option<String>,
    /// Max execution time per command
    pub timeout: Duration,
    /// Max output bytes to capture per stream
    pub max_output_bytes: usize,
    /// Substrings that get a command refused before approval is even asked
    pub deny_patterns: Vec<String>,
}

impl BashTool {
    pub fn new(approval: Approval) -> Self {
        Self {
            approval,
            cwd: None,
            timeout: Duration::from_secs(120),
            max_output_bytes: 256 * 1024,
            deny_patterns: vec![
                "rm -rf /".into(),
                "rm -rf /*".into(),
                "mkfs".into(),
                "dd if=".into(),
                ":(){:|:&};:".into(), // fork bomb
            ],
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_deny_patterns(mut self, patterns: Vec<String>) -> Self {
        self.deny_patterns = patterns;
        self
    }

    /// Registry factory for the default tool, bound to the registered approval session.
    pub fn factory() -> ToolFactory {
        ToolFactory::new(BASH, vec![DependencyKind::Approval], |registry| {
            let approval =
                registry.require(BASH, DependencyKind::Approval, CapabilityRegistry::approval)?;
            Ok(Box::new(BashTool::new(approval.clone())) as Box<dyn AgentTool>)
        })
    }

    fn cap(&self, bytes: &[u8]) -> String {
        let mut text = String::from_utf8_lossy(bytes).to_string();
        if text.len() > self.max_output_bytes {
            let mut end = self.max_output_bytes;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
            text.push_str("\n... (output truncated)");
        }
        text
    }
}

#[async_trait]
impl AgentTool for BashTool {
    fn name(&self) -> &str {
        BASH
    }

    fn label(&self) -> &str {
        "Execute Command"
    }

    fn description(&self) -> &str {
        "Execute a bash command and return stdout/stderr. Each command runs in a fresh shell; \
         prefer one script over many near-identical commands."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let command = params["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'command' parameter".into()))?;

        for pattern in &self.deny_patterns {
            if command.contains(pattern.as_str()) {
                return Err(ToolError::Failed(format!(
                    "Command blocked by safety policy: contains '{}'.",
                    pattern
                )));
            }
        }

        let description = format!("Run command `{}`", command);
        if !self.approval.request(&ctx, RUN_COMMAND, &description).await {
            return Err(ToolError::Rejected);
        }

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let timeout = self.timeout;
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                return Err(ToolError::Failed(format!(
                    "Command timed out after {}s",
                    timeout.as_secs()
                )));
            }
            result = cmd.output() => {
                result.map_err(|e| ToolError::Failed(format!("Failed to execute: {}", e)))?
            }
        };

        let stdout = self.cap(&result.stdout);
        let stderr = self.cap(&result.stderr);
        let exit_code = result.status.code().unwrap_or(-1);

        let output = if stderr.is_empty() {
            format!("Exit code: {}\n{}", exit_code, stdout)
        } else {
            format!(
                "Exit code: {}\nSTDOUT:\n{}\nSTDERR:\n{}",
                exit_code, stdout, stderr
            )
        };

        // non-zero exits are still results; the agent reads the output to recover
        Ok(ToolResult {
            content: vec![Content::Text { text: output }],
            details: serde_json::json!({ "exit_code": exit_code, "success": exit_code == 0 }),
        })
    }
}
