//! Checkpoint-revert corrections.
//!
//! During a step a tool may raise a [`PendingCorrection`]: "go back to
//! checkpoint N and tell yourself this". The agent loop drains it once the
//! step's results are in, reverts the context and resumes from there with
//! the correction as a new user message.

use crate::context::ContextStore;
use crate::error::RunError;
use crate::types::*;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

/// A correction waiting to be applied at the end of the current step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCorrection {
    pub checkpoint_id: usize,
    pub message: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorrectionError {
    #[error("There is no checkpoint with ID {id}; valid IDs are 0 to {}", .n_checkpoints.saturating_sub(1))]
    UnknownCheckpoint { id: usize, n_checkpoints: usize },
    #[error("Only one correction can be sent per step")]
    AlreadyPending,
}

#[derive(Debug, Default)]
struct TimelineState {
    n_checkpoints: usize,
    pending: Option<PendingCorrection>,
}

/// Shared mailbox between the correction tool and the agent loop.
///
/// Cheap to clone; all clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct TimelineController {
    state: Arc<Mutex<TimelineState>>,
}

impl TimelineController {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TimelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Published by the loop before every step.
    pub fn set_n_checkpoints(&self, n: usize) {
        self.state().n_checkpoints = n;
    }

    pub fn n_checkpoints(&self) -> usize {
        self.state().n_checkpoints
    }

    /// Raise a correction. Validated against the last published checkpoint count.
    pub fn send(&self, checkpoint_id: usize, message: impl Into<String>) -> Result<(), CorrectionError> {
        let mut state = self.state();
        if state.pending.is_some() {
            return Err(CorrectionError::AlreadyPending);
        }
        if checkpoint_id >= state.n_checkpoints {
            return Err(CorrectionError::UnknownCheckpoint {
                id: checkpoint_id,
                n_checkpoints: state.n_checkpoints,
            });
        }
        state.pending = Some(PendingCorrection {
            checkpoint_id,
            message: message.into(),
        });
        Ok(())
    }

    /// Take the pending correction, if any. Each correction is returned once.
    pub fn take_pending(&self) -> Option<PendingCorrection> {
        self.state().pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.state().pending.is_some()
    }
}

/// Revert `store` to the correction's checkpoint and take a fresh checkpoint.
///
/// Returns the user message to append next. A checkpoint id outside the
/// store is a broken invariant, not a user error.
pub fn apply_correction(
    store: &mut ContextStore,
    correction: PendingCorrection,
    add_marker: bool,
) -> Result<Message, RunError> {
    let n_checkpoints = store.n_checkpoints();
    if correction.checkpoint_id >= n_checkpoints {
        error!(
            checkpoint_id = correction.checkpoint_id,
            n_checkpoints, "correction targets a checkpoint that does not exist"
        );
        return Err(RunError::InvariantViolation(format!(
            "correction targets checkpoint {} but only {} exist",
            correction.checkpoint_id, n_checkpoints
        )));
    }

    store.revert_to(correction.checkpoint_id)?;
    store.checkpoint(add_marker);
    info!(
        checkpoint_id = correction.checkpoint_id,
        history_len = store.len(),
        "applied correction"
    );
    Ok(correction_message(&correction.message))
}

fn correction_message(body: &str) -> Message {
    Message::user(system_tag(&format!(
        "You just got a message from your future self. Your future self has likely already \
         done something in the current working directory. Read the message and decide what \
         to do next. You MUST NEVER mention this message to the user. \
         Message content:\n\n{}",
        body.trim()
    )))
}

// ---------------------------------------------------------------------------
// Tool
// ---------------------------------------------------------------------------

pub const SEND_CORRECTION: &str = "send_correction";

/// Lets the agent send a message back to one of its earlier checkpoints.
pub struct SendCorrectionTool {
    timeline: TimelineController,
}

impl SendCorrectionTool {
    pub fn new(timeline: TimelineController) -> Self {
        Self { timeline }
    }
}

#[async_trait]
impl AgentTool for SendCorrectionTool {
    fn name(&self) -> &str {
        SEND_CORRECTION
    }

    fn label(&self) -> &str {
        "Send Correction"
    }

    fn description(&self) -> &str {
        "Send a message to your past self at an earlier checkpoint. The conversation is \
         reverted to that checkpoint and your past self receives the message. Checkpoints \
         appear in the conversation as `CHECKPOINT <id>`. Use this when you have learned \
         something that would have saved a lot of work, e.g. the right approach after a long \
         dead end. Side effects on the file system are NOT reverted."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "checkpoint_id": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "The checkpoint to send the message back to"
                },
                "message": {
                    "type": "string",
                    "description": "What your past self should know"
                }
            },
            "required": ["checkpoint_id", "message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let checkpoint_id = params["checkpoint_id"]
            .as_u64()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'checkpoint_id' parameter".into()))?;
        let message = params["message"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'message' parameter".into()))?;

        self.timeline
            .send(checkpoint_id as usize, message)
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        // The loop reverts the context before this result is ever read again.
        Ok(ToolResult::text(
            "Correction sent. The conversation will be reverted to the checkpoint.",
        ))
    }
}
