//! Context compaction: shrink history once it nears the context window.
//!
//! A [`CompactionStrategy`] turns a full history into a shorter one. The
//! [`Compactor`] runs the strategy under the retry policy and rebuilds the
//! [`ContextStore`] around the result.

use crate::context::{is_checkpoint_marker, total_tokens, ContextStore};
use crate::error::RunError;
use crate::provider::{ChatRequest, Llm, ProviderError};
use crate::retry::{with_retry, OnRetryFn, RetryConfig};
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Produces a reduced message sequence from a full history.
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    async fn compact(
        &self,
        history: &[Message],
        llm: &Llm,
        cancel: CancellationToken,
    ) -> Result<Vec<Message>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Summarize
// ---------------------------------------------------------------------------

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that compacts conversation context.";

const SUMMARY_INSTRUCTIONS: &str = "Compact the conversation below into a dense summary that \
lets the work continue without it. Keep: the user's goals and constraints, decisions made, \
facts discovered (paths, identifiers, versions, credentials the user supplied), commands that \
worked or failed, and any open tasks. Drop pleasantries and verbatim tool output that no longer \
matters.";

/// Summarize older history through the engine.
///
/// The last `preserve` user/assistant messages (and whatever follows them)
/// are kept verbatim; everything before is sent to the engine as a numbered
/// transcript and replaced with a single user message carrying the summary.
#[derive(Debug, Clone)]
pub struct SummarizeCompaction {
    pub preserve: usize,
}

impl Default for SummarizeCompaction {
    fn default() -> Self {
        Self { preserve: 2 }
    }
}

impl SummarizeCompaction {
    fn transcript(messages: &[Message]) -> String {
        let mut out = String::from(SUMMARY_INSTRUCTIONS);
        for (i, msg) in messages.iter().enumerate() {
            out.push_str(&format!(
                "\n\n## Message {}\nRole: {}\nContent:\n",
                i + 1,
                msg.role()
            ));
            for part in msg.content() {
                match part {
                    Content::Text { text } => {
                        out.push_str(text);
                        out.push('\n');
                    }
                    Content::ToolCall {
                        name, arguments, ..
                    } => out.push_str(&format!("[tool call] {} {}\n", name, arguments)),
                    Content::Image { mime_type, .. } => {
                        out.push_str(&format!("[image: {}]\n", mime_type))
                    }
                    // reasoning traces are not worth the tokens
                    Content::Thinking { .. } => {}
                }
            }
        }
        out
    }
}

#[async_trait]
impl CompactionStrategy for SummarizeCompaction {
    async fn compact(
        &self,
        history: &[Message],
        llm: &Llm,
        cancel: CancellationToken,
    ) -> Result<Vec<Message>, ProviderError> {
        let split = preserved_start(history, self.preserve);
        if split == 0 {
            return Ok(history.to_vec());
        }
        let (older, preserved) = history.split_at(split);

        let request = ChatRequest {
            model: llm.model.clone(),
            system_prompt: SUMMARY_SYSTEM_PROMPT.into(),
            messages: vec![Message::user(Self::transcript(older))],
            tools: Vec::new(),
            thinking_level: ThinkingLevel::Off,
        };
        let response = llm.provider.generate(request, cancel).await?;
        let summary = response.message.text();
        if summary.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        debug!(
            compacted = older.len(),
            preserved = preserved.len(),
            "summarized history"
        );

        let mut reduced = Vec::with_capacity(preserved.len() + 1);
        reduced.push(Message::user_parts(vec![
            Content::text(system_tag(
                "Previous context has been compacted. Here is the compaction output:",
            )),
            Content::text(summary),
        ]));
        reduced.extend_from_slice(preserved);
        Ok(reduced)
    }
}

/// Index where the preserved tail begins: the `preserve`-th user or
/// assistant message counted from the end. Returns 0 when there are not
/// enough of them to leave anything to compact.
fn preserved_start(history: &[Message], preserve: usize) -> usize {
    if preserve == 0 {
        return history.len();
    }
    let mut seen = 0;
    for (i, msg) in history.iter().enumerate().rev() {
        if matches!(msg, Message::User { .. } | Message::Assistant { .. }) {
            seen += 1;
            if seen == preserve {
                return i;
            }
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Truncate
// ---------------------------------------------------------------------------

/// Engine-free compaction.
///
/// - Level 1: truncate long tool outputs (keep head + tail lines)
/// - Level 2: drop the middle of history (keep first + recent)
///
/// Stops as soon as the history fits in `target_ratio` of the context window.
#[derive(Debug, Clone)]
pub struct TruncateCompaction {
    pub tool_output_max_lines: usize,
    pub keep_first: usize,
    pub keep_recent: usize,
    pub target_ratio: f64,
}

impl Default for TruncateCompaction {
    fn default() -> Self {
        Self {
            tool_output_max_lines: 50,
            keep_first: 1,
            keep_recent: 10,
            target_ratio: 0.5,
        }
    }
}

impl TruncateCompaction {
    fn truncate_tool_outputs(&self, messages: &[Message]) -> Vec<Message> {
        messages
            .iter()
            .map(|msg| match msg {
                Message::ToolResult {
                    tool_call_id,
                    tool_name,
                    content,
                    is_error,
                    timestamp,
                } => Message::ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    content: content
                        .iter()
                        .map(|c| match c {
                            Content::Text { text } => Content::Text {
                                text: truncate_text_head_tail(text, self.tool_output_max_lines),
                            },
                            other => other.clone(),
                        })
                        .collect(),
                    is_error: *is_error,
                    timestamp: *timestamp,
                },
                other => other.clone(),
            })
            .collect()
    }

    fn drop_middle(&self, messages: &[Message], budget: usize) -> Vec<Message> {
        let first_end = turn_boundary(messages, self.keep_first.min(messages.len()));
        let mut recent_start = turn_boundary(
            messages,
            messages.len().saturating_sub(self.keep_recent).max(first_end),
        );

        let head_tokens = total_tokens(&messages[..first_end]);
        while recent_start < messages.len()
            && head_tokens + total_tokens(&messages[recent_start..]) > budget
        {
            recent_start = turn_boundary(messages, recent_start + 1);
        }

        let removed = recent_start - first_end;
        if removed == 0 {
            return messages.to_vec();
        }
        let mut result = messages[..first_end].to_vec();
        result.push(Message::user(system_tag(&format!(
            "Context compacted: {} messages removed to fit the context window",
            removed
        ))));
        result.extend_from_slice(&messages[recent_start..]);
        result
    }
}

#[async_trait]
impl CompactionStrategy for TruncateCompaction {
    async fn compact(
        &self,
        history: &[Message],
        llm: &Llm,
        _cancel: CancellationToken,
    ) -> Result<Vec<Message>, ProviderError> {
        let budget = (llm.max_context_size as f64 * self.target_ratio) as usize;
        if total_tokens(history) <= budget {
            return Ok(history.to_vec());
        }

        let truncated = self.truncate_tool_outputs(history);
        if total_tokens(&truncated) <= budget {
            return Ok(truncated);
        }

        Ok(self.drop_middle(&truncated, budget))
    }
}

/// First index at or after `from` that does not split a tool call from its result.
fn turn_boundary(messages: &[Message], from: usize) -> usize {
    let mut i = from;
    while i < messages.len() && matches!(messages[i], Message::ToolResult { .. }) {
        i += 1;
    }
    i
}

/// Truncate text keeping first N/2 and last N/2 lines.
fn truncate_text_head_tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }

    let head = max_lines / 2;
    let tail = max_lines - head;
    let omitted = lines.len() - head - tail;

    let mut result = lines[..head].join("\n");
    result.push_str(&format!("\n\n[... {} lines truncated ...]\n\n", omitted));
    result.push_str(&lines[lines.len() - tail..].join("\n"));
    result
}

// ---------------------------------------------------------------------------
// Compactor
// ---------------------------------------------------------------------------

/// Runs a strategy under the retry policy and rebuilds the context from its output.
#[derive(Clone)]
pub struct Compactor {
    strategy: Arc<dyn CompactionStrategy>,
    retry: RetryConfig,
}

impl Compactor {
    pub fn new(strategy: Arc<dyn CompactionStrategy>, retry: RetryConfig) -> Self {
        Self { strategy, retry }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Compact `store` in place.
    ///
    /// On success the store holds checkpoint 0, one fresh checkpoint and the
    /// reduced history; the token count is re-estimated from it. On failure
    /// (retries exhausted, cancellation) the store is untouched.
    pub async fn compact(
        &self,
        store: &mut ContextStore,
        llm: &Llm,
        add_marker: bool,
        on_retry: Option<&OnRetryFn>,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let history = store.history().to_vec();
        let before = store.token_count();

        let reduced = with_retry(&self.retry, "compaction", on_retry, || {
            let strategy = Arc::clone(&self.strategy);
            let llm = llm.clone();
            let history = history.clone();
            let cancel = cancel.clone();
            async move { strategy.compact(&history, &llm, cancel).await }
        })
        .await?;

        if store.n_checkpoints() == 0 {
            store.checkpoint(false);
        }
        store.revert_to(0)?;
        store.checkpoint(add_marker);
        // old markers name ids that are about to be reused
        store.extend(reduced.into_iter().filter(|m| !is_checkpoint_marker(m)));
        store.recount_tokens();

        info!(
            messages_before = history.len(),
            messages_after = store.len(),
            tokens_before = before,
            tokens_after = store.token_count(),
            "compacted context"
        );
        Ok(())
    }
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new(Arc::new(SummarizeCompaction::default()), RetryConfig::default())
    }
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
