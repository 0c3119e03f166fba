//! Repetition guard for shell-like tools.
//!
//! Agents stuck in brute-force enumeration tend to issue the same command
//! over and over with a small change (an id, a path segment). The guard
//! compares each shell command with the one right before it; after a long
//! enough streak of near-duplicates it prepends an advisory to the step's
//! tool output. It never blocks a call.

use crate::types::*;
use serde::Deserialize;
use similar::TextDiff;
use std::collections::VecDeque;
use tracing::warn;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoopGuardConfig {
    pub enabled: bool,
    /// Tools whose `command` argument is tracked.
    pub shell_tools: Vec<String>,
    /// Shorter commands are ignored entirely.
    pub min_command_len: usize,
    /// Ratio in [0, 1] at or above which two commands count as the same.
    pub similarity_threshold: f64,
    /// Streak length that triggers the advisory.
    pub trigger_count: usize,
    pub history_capacity: usize,
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shell_tools: vec!["bash".into()],
            min_command_len: 10,
            similarity_threshold: 0.85,
            trigger_count: 18,
            history_capacity: 18,
        }
    }
}

/// Similarity ratio of two strings: `2 * matches / total_len`, in [0, 1].
pub fn similarity(a: &str, b: &str) -> f64 {
    f64::from(TextDiff::from_chars(a, b).ratio())
}

#[derive(Debug, Clone)]
pub struct LoopGuard {
    config: LoopGuardConfig,
    history: VecDeque<String>,
    similar_count: usize,
}

impl LoopGuard {
    pub fn new(config: LoopGuardConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_capacity),
            config,
            similar_count: 0,
        }
    }

    pub fn config(&self) -> &LoopGuardConfig {
        &self.config
    }

    /// Recorded commands, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    pub fn similar_count(&self) -> usize {
        self.similar_count
    }

    /// Feed one tool call. Returns the advisory text when the streak trips.
    pub fn observe(&mut self, call: &ToolCall) -> Option<String> {
        if !self.config.enabled || !self.config.shell_tools.iter().any(|t| t == &call.name) {
            return None;
        }
        let command = extract_command(&call.arguments)?;
        let command = command.trim();
        if command.chars().count() < self.config.min_command_len {
            return None;
        }

        let is_similar = self
            .history
            .back()
            .is_some_and(|last| similarity(command, last) >= self.config.similarity_threshold);

        // recorded after the comparison so a command is never compared with itself
        self.history.push_back(command.to_string());
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }

        if !is_similar {
            self.similar_count = 0;
            return None;
        }

        self.similar_count += 1;
        if self.similar_count < self.config.trigger_count {
            return None;
        }

        warn!(
            streak = self.similar_count,
            "repeated command pattern detected, injecting advisory"
        );
        let advisory = self.advisory();
        self.similar_count = 0;
        Some(advisory)
    }

    /// Run every call of a step through the guard. If any trips, the
    /// advisory is prepended to the first tool-result message.
    pub fn annotate(&mut self, calls: &[ToolCall], tool_messages: &mut [Message]) {
        let mut advisory = None;
        for call in calls {
            if let Some(text) = self.observe(call) {
                advisory = Some(text);
            }
        }
        if let (Some(text), Some(first)) = (advisory, tool_messages.first_mut()) {
            first.prepend_text(&system_tag(&text));
        }
    }

    fn advisory(&self) -> String {
        let n = self.similar_count;
        let history = self
            .history
            .iter()
            .map(|cmd| format!("- {}", cmd))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "\n{RULE}\n\
             ⚠️  Possible loop detected ({n} similar commands in a row)\n\
             {RULE}\n\n\
             Repeated near-identical commands usually mean an inefficient enumeration \
             or brute-force pattern (IDOR probing, directory scanning and the like).\n\n\
             The commands ran normally. Before continuing, rework the plan:\n\n\
             1. What is my core hypothesis?\n\
             2. Do the last {n} attempts show the hypothesis is wrong, or that it needs a precondition?\n\
             3. What other possibilities exist besides the current approach?\n\
             4. Is there a more efficient way (batching, a script) to reach the goal?\n\n\
             Recent commands:\n\
             {history}\n\n\
             💡 If the current strategy is confirmed correct, carry on; otherwise change approach.\n\
             {RULE}\n"
        )
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(LoopGuardConfig::default())
    }
}

/// The `command` argument, whether arguments arrived as an object or as a JSON string.
fn extract_command(arguments: &serde_json::Value) -> Option<String> {
    match arguments {
        serde_json::Value::String(raw) => serde_json::from_str::<serde_json::Value>(raw)
            .ok()?
            .get("command")?
            .as_str()
            .map(str::to_string),
        other => other.get("command")?.as_str().map(str::to_string),
    }
}
