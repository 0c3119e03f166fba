//! Conversation history with checkpoints and token accounting.
//!
//! A [`ContextStore`] is an append-only message log. Checkpoints record the
//! log length (and token count) at a point in time; reverting truncates back
//! to that point. Checkpoint ids are dense and start at 0.
//!
//! Token counts come from the engine's reported usage. When the engine
//! reports nothing, [`estimate_tokens`] gives a rough figure instead.

use crate::types::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Text of the user message that announces checkpoint `id` to the agent.
pub fn checkpoint_marker(id: usize) -> String {
    system_tag(&format!("CHECKPOINT {}", id))
}

pub fn is_checkpoint_marker(msg: &Message) -> bool {
    let Message::User { content, .. } = msg else {
        return false;
    };
    match content.as_slice() {
        [Content::Text { text }] => text
            .strip_prefix("<system>CHECKPOINT ")
            .and_then(|rest| rest.strip_suffix("</system>"))
            .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Rough token estimate: ~4 chars per token for English text.
/// Good enough for context budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a single message
pub fn message_tokens(msg: &Message) -> usize {
    match msg {
        Message::ToolResult {
            content, tool_name, ..
        } => content_tokens(content) + estimate_tokens(tool_name) + 8,
        other => content_tokens(other.content()) + 4,
    }
}

fn content_tokens(content: &[Content]) -> usize {
    content
        .iter()
        .map(|c| match c {
            Content::Text { text } => estimate_tokens(text),
            Content::Image { .. } => 1000,
            Content::Thinking { thinking } => estimate_tokens(thinking),
            Content::ToolCall {
                name, arguments, ..
            } => estimate_tokens(name) + estimate_tokens(&arguments.to_string()) + 8,
        })
        .sum()
}

/// Estimate total tokens for a message list
pub fn total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(message_tokens).sum()
}

// ---------------------------------------------------------------------------
// Checkpointed store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: usize,
    /// History length when the checkpoint was taken.
    pub history_len: usize,
    /// Token count when the checkpoint was taken.
    pub token_count: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("checkpoint {id} does not exist (have {n_checkpoints})")]
    UnknownCheckpoint { id: usize, n_checkpoints: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    history: Vec<Message>,
    token_count: usize,
    checkpoints: Vec<Checkpoint>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn n_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Record a new checkpoint and return its id.
    ///
    /// With `add_marker`, a `CHECKPOINT {id}` user message is appended after
    /// the checkpoint is recorded, so the agent can refer to it by id.
    pub fn checkpoint(&mut self, add_marker: bool) -> usize {
        let id = self.checkpoints.len();
        self.checkpoints.push(Checkpoint {
            id,
            history_len: self.history.len(),
            token_count: self.token_count,
        });
        debug!(checkpoint_id = id, history_len = self.history.len(), "checkpoint");
        if add_marker {
            self.append(Message::user(checkpoint_marker(id)));
        }
        id
    }

    pub fn append(&mut self, message: Message) {
        self.history.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.history.extend(messages);
    }

    /// Raise the token count to `tokens`. Never lowers it.
    pub fn update_token_count(&mut self, tokens: usize) {
        self.token_count = self.token_count.max(tokens);
    }

    /// Replace the token count with a fresh estimate of the history.
    pub(crate) fn recount_tokens(&mut self) {
        self.token_count = total_tokens(&self.history);
    }

    /// Truncate history to the state recorded at checkpoint `id`.
    ///
    /// Checkpoints after `id` are dropped; `id` itself is kept, so reverting
    /// to the same checkpoint twice changes nothing the second time.
    pub fn revert_to(&mut self, id: usize) -> Result<(), ContextError> {
        let checkpoint = *self
            .checkpoints
            .get(id)
            .ok_or(ContextError::UnknownCheckpoint {
                id,
                n_checkpoints: self.checkpoints.len(),
            })?;
        self.checkpoints.truncate(id + 1);
        self.history.truncate(checkpoint.history_len);
        self.token_count = checkpoint.token_count;
        debug!(
            checkpoint_id = id,
            history_len = checkpoint.history_len,
            "reverted context"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
