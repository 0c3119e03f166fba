//! The step loop: checkpoint → engine call → tools → integrate → repeat.
//!
//! [`AgentLoop`] owns the conversation context and is the only thing that
//! mutates it. Each step:
//!
//! - compacts the context if it is close to the engine's window
//! - takes a checkpoint and calls the engine (with retries)
//! - runs the requested tools, in parallel, and passes the results
//!   through the loop guard
//! - appends everything to the context and decides what happens next
//!
//! A step ends in a [`StepOutcome`]. A correction raised during the step
//! reverts the context and re-runs from the target checkpoint without
//! consuming a step.

use crate::agent::{Agent, ToolOutcome, ToolStatus};
use crate::approval::{Approval, ApprovalRelay};
use crate::compaction::{CompactionStrategy, Compactor, SummarizeCompaction};
use crate::config::LoopControl;
use crate::context::{total_tokens, ContextStore};
use crate::error::{ConfigError, RunError};
use crate::loop_guard::{LoopGuard, LoopGuardConfig};
use crate::provider::{ChatRequest, Llm};
use crate::retry::{with_retry, OnRetryFn, RetryAttempt, RetryConfig};
use crate::timeline::{apply_correction, PendingCorrection, TimelineController, SEND_CORRECTION};
use crate::types::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Marker in a tool name that designates an answer-submission tool.
const ANSWER_TOOL_MARKER: &str = "submit_answer";
/// Present (whitespace removed, lowercased) in an accepted submission's output.
const ANSWER_ACCEPTED_MARKER: &str = "\"correct\":true";

/// Why a run ended successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The engine answered without calling any tool.
    NoToolCalls,
    /// An answer-submission tool reported a correct answer.
    AnswerAccepted,
    /// The user rejected a tool call.
    ToolRejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub reason: FinishReason,
    /// Number of the step the run finished in (1-based).
    pub steps: usize,
    pub corrections: usize,
}

/// How a single step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Finished(FinishReason),
    Revert(PendingCorrection),
}

pub struct AgentLoop {
    agent: Agent,
    llm: Option<Llm>,
    context: ContextStore,
    loop_control: LoopControl,
    retry: RetryConfig,
    compaction: Arc<dyn CompactionStrategy>,
    loop_guard: LoopGuard,
    approval: Approval,
    timeline: TimelineController,
    thinking_level: ThinkingLevel,
    on_retry: Option<OnRetryFn>,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentLoop {
    pub fn new(agent: Agent, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        let loop_control = LoopControl::default();
        Self {
            agent,
            llm: None,
            context: ContextStore::new(),
            retry: loop_control.retry_config(),
            loop_control,
            compaction: Arc::new(SummarizeCompaction::default()),
            loop_guard: LoopGuard::default(),
            approval: Approval::default(),
            timeline: TimelineController::new(),
            thinking_level: ThinkingLevel::Off,
            on_retry: None,
            tx,
        }
    }

    pub fn with_llm(mut self, llm: Llm) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Also resets the retry policy to match `max_retries_per_step`.
    pub fn with_loop_control(mut self, loop_control: LoopControl) -> Self {
        self.retry = loop_control.retry_config();
        self.loop_control = loop_control;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compaction(mut self, strategy: Arc<dyn CompactionStrategy>) -> Self {
        self.compaction = strategy;
        self
    }

    pub fn with_loop_guard(mut self, config: LoopGuardConfig) -> Self {
        self.loop_guard = LoopGuard::new(config);
        self
    }

    /// The approval session whose requests this loop relays.
    pub fn with_approval(mut self, approval: Approval) -> Self {
        self.approval = approval;
        self
    }

    /// Share the controller the correction tool was built with.
    pub fn with_timeline(mut self, timeline: TimelineController) -> Self {
        self.timeline = timeline;
        self
    }

    /// Called before every backoff sleep, for the step call and for compaction.
    pub fn on_retry(mut self, f: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.agent.name
    }

    pub fn model_name(&self) -> &str {
        self.llm.as_ref().map(|l| l.model.as_str()).unwrap_or("")
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn approval(&self) -> &Approval {
        &self.approval
    }

    pub fn timeline(&self) -> &TimelineController {
        &self.timeline
    }

    pub fn loop_guard(&self) -> &LoopGuard {
        &self.loop_guard
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        self.thinking_level
    }

    /// Turn extended thinking on or off. Requires an engine with the
    /// `thinking` capability to turn it on.
    pub fn set_thinking(&mut self, enabled: bool) -> Result<(), ConfigError> {
        let llm = self.llm.as_ref().ok_or(ConfigError::LlmNotSet)?;
        if enabled && !llm.supports(Capability::Thinking) {
            return Err(ConfigError::LlmNotSupported {
                model: llm.model.clone(),
                capabilities: vec![Capability::Thinking],
            });
        }
        self.thinking_level = if enabled {
            ThinkingLevel::High
        } else {
            ThinkingLevel::Off
        };
        Ok(())
    }

    pub fn status(&self) -> StatusSnapshot {
        let context_usage = match &self.llm {
            Some(llm) if llm.max_context_size > 0 => {
                self.context.token_count() as f64 / llm.max_context_size as f64
            }
            _ => 0.0,
        };
        StatusSnapshot { context_usage }
    }

    fn checkpoint_markers(&self) -> bool {
        self.agent.toolset.contains(SEND_CORRECTION)
    }

    /// Convenience for a text-only prompt.
    pub async fn prompt(
        &mut self,
        text: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        self.run(vec![Content::text(text)], cancel).await
    }

    /// Run the agent on one user input until it finishes, fails or is cancelled.
    pub async fn run(
        &mut self,
        input: Vec<Content>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let llm = self.llm.clone().ok_or(ConfigError::LlmNotSet)?;
        if self.loop_control.reserved_tokens > llm.max_context_size {
            return Err(ConfigError::ContextTooSmall {
                model: llm.model.clone(),
                max_context_size: llm.max_context_size,
                reserved_tokens: self.loop_control.reserved_tokens,
            }
            .into());
        }
        let message = Message::user_parts(input);
        if message.has_image() && !llm.supports(Capability::ImageIn) {
            return Err(ConfigError::LlmNotSupported {
                model: llm.model.clone(),
                capabilities: vec![Capability::ImageIn],
            }
            .into());
        }

        if let Some(stale) = self.timeline.take_pending() {
            debug!(
                checkpoint_id = stale.checkpoint_id,
                "dropping correction left over from a previous run"
            );
        }
        if self.context.n_checkpoints() == 0 {
            self.context.checkpoint(self.checkpoint_markers());
        }
        self.context.append(message);

        self.drive(&llm, &cancel).await
    }

    async fn drive(&mut self, llm: &Llm, cancel: &CancellationToken) -> Result<RunSummary, RunError> {
        let mut step_no = 1;
        let mut corrections = 0;
        loop {
            self.tx.send(AgentEvent::StepBegin { step: step_no }).ok();
            debug!(step = step_no, "beginning step");

            let relay = ApprovalRelay::start(self.approval.clone(), self.tx.clone());
            let outcome = self.step(llm, cancel).await;
            relay.stop().await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    if e.interrupts_step() {
                        warn!(step = step_no, "step interrupted: {}", e);
                        self.tx.send(AgentEvent::StepInterrupted).ok();
                    }
                    return Err(e);
                }
            };

            match outcome {
                StepOutcome::Finished(reason) => {
                    info!(steps = step_no, ?reason, "run finished");
                    return Ok(RunSummary {
                        reason,
                        steps: step_no,
                        corrections,
                    });
                }
                StepOutcome::Revert(correction) => {
                    corrections += 1;
                    if corrections > self.loop_control.max_corrections_per_run {
                        error!(corrections, "too many corrections in one run");
                        return Err(RunError::InvariantViolation(format!(
                            "more than {} corrections in one run",
                            self.loop_control.max_corrections_per_run
                        )));
                    }
                    let markers = self.checkpoint_markers();
                    let message = apply_correction(&mut self.context, correction, markers)?;
                    self.context.append(message);
                }
                StepOutcome::Continue => {
                    step_no += 1;
                    if step_no > self.loop_control.max_steps_per_run {
                        return Err(RunError::MaxStepsReached {
                            max_steps: self.loop_control.max_steps_per_run,
                        });
                    }
                }
            }
        }
    }

    async fn step(&mut self, llm: &Llm, cancel: &CancellationToken) -> Result<StepOutcome, RunError> {
        let markers = self.checkpoint_markers();

        if self.context.token_count() + self.loop_control.reserved_tokens >= llm.max_context_size {
            info!(
                tokens = self.context.token_count(),
                max = llm.max_context_size,
                "context too long, compacting"
            );
            self.tx.send(AgentEvent::CompactionBegin).ok();
            let compactor = Compactor::new(Arc::clone(&self.compaction), self.retry.clone());
            let compaction =
                compactor.compact(&mut self.context, llm, markers, self.on_retry.as_ref(), cancel);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RunError::Interrupted),
                result = compaction => result?,
            }
            self.tx.send(AgentEvent::CompactionEnd).ok();
        }

        self.context.checkpoint(markers);
        self.timeline.set_n_checkpoints(self.context.n_checkpoints());

        let request = ChatRequest {
            model: llm.model.clone(),
            system_prompt: self.agent.system_prompt.clone(),
            messages: self.context.history().to_vec(),
            tools: self.agent.toolset.definitions(),
            thinking_level: self.thinking_level,
        };
        let call = with_retry(&self.retry, "step", self.on_retry.as_ref(), || {
            let provider = Arc::clone(&llm.provider);
            let request = request.clone();
            let cancel = cancel.clone();
            async move { provider.generate(request, cancel).await }
        });
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Interrupted),
            response = call => response?,
        };

        if let Some(usage) = response.usage {
            self.context.update_token_count(usage.input as usize);
            self.tx
                .send(AgentEvent::StatusUpdate {
                    status: self.status(),
                })
                .ok();
        }
        self.tx
            .send(AgentEvent::MessageEnd {
                message: response.message.clone(),
            })
            .ok();

        let calls = response.message.tool_calls();
        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Interrupted),
            outcomes = self.agent.toolset.execute(&calls, &self.tx, cancel) => outcomes,
        };
        // a tool may cancel the run and finish in the same poll
        if cancel.is_cancelled() {
            return Err(RunError::Interrupted);
        }

        let mut tool_messages: Vec<Message> = outcomes.iter().map(|o| o.message.clone()).collect();
        self.loop_guard.annotate(&calls, &mut tool_messages);
        for message in &tool_messages {
            self.tx
                .send(AgentEvent::MessageEnd {
                    message: message.clone(),
                })
                .ok();
        }

        self.context.append(response.message);
        self.context.extend(tool_messages);
        match response.usage {
            Some(usage) => self.context.update_token_count(usage.total as usize),
            None => self
                .context
                .update_token_count(total_tokens(self.context.history())),
        }
        debug!(
            history_len = self.context.len(),
            tokens = self.context.token_count(),
            tool_calls = calls.len(),
            "step integrated"
        );

        Ok(self.decide(&outcomes, calls.is_empty()))
    }

    fn decide(&self, outcomes: &[ToolOutcome], no_tool_calls: bool) -> StepOutcome {
        if let Some(accepted) = outcomes.iter().find(|o| is_accepted_answer(o)) {
            info!(tool = %accepted.call.name, args = %accepted.call.arguments, "answer accepted");
            self.timeline.take_pending();
            return StepOutcome::Finished(FinishReason::AnswerAccepted);
        }

        if outcomes.iter().any(|o| o.status == ToolStatus::Rejected) {
            if let Some(discarded) = self.timeline.take_pending() {
                debug!(
                    checkpoint_id = discarded.checkpoint_id,
                    "tool rejected, discarding pending correction"
                );
            }
            return StepOutcome::Finished(FinishReason::ToolRejected);
        }

        if let Some(correction) = self.timeline.take_pending() {
            return StepOutcome::Revert(correction);
        }

        if no_tool_calls {
            StepOutcome::Finished(FinishReason::NoToolCalls)
        } else {
            StepOutcome::Continue
        }
    }
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("agent", &self.agent.name)
            .field("llm", &self.llm)
            .field("history_len", &self.context.len())
            .field("loop_control", &self.loop_control)
            .finish_non_exhaustive()
    }
}

fn is_accepted_answer(outcome: &ToolOutcome) -> bool {
    if !outcome.call.name.to_lowercase().contains(ANSWER_TOOL_MARKER) {
        return false;
    }
    let normalized: String = outcome
        .message
        .text()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    normalized.contains(ANSWER_ACCEPTED_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, output: &str, status: ToolStatus) -> ToolOutcome {
        ToolOutcome {
            call: ToolCall {
                id: "c".into(),
                name: name.into(),
                arguments: serde_json::json!({}),
            },
            message: Message::ToolResult {
                tool_call_id: "c".into(),
                tool_name: name.into(),
                content: vec![Content::text(output)],
                is_error: status != ToolStatus::Ok,
                timestamp: 0,
            },
            status,
        }
    }

    #[test]
    fn test_answer_marker_is_normalized() {
        assert!(is_accepted_answer(&outcome(
            "ctf_Submit_Answer",
            "{ \"Correct\" :\n true }",
            ToolStatus::Ok
        )));
        assert!(!is_accepted_answer(&outcome(
            "submit_answer",
            "{\"correct\": false}",
            ToolStatus::Ok
        )));
        assert!(!is_accepted_answer(&outcome(
            "bash",
            "{\"correct\": true}",
            ToolStatus::Ok
        )));
    }

    #[test]
    fn test_rejection_discards_pending_correction() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let agent_loop = AgentLoop::new(Agent::new("t"), tx);
        agent_loop.timeline.set_n_checkpoints(2);
        agent_loop.timeline.send(1, "go back").unwrap();

        let outcome = agent_loop.decide(
            &[
                outcome("bash", "ok", ToolStatus::Ok),
                outcome("bash", "rejected", ToolStatus::Rejected),
            ],
            false,
        );
        assert_eq!(outcome, StepOutcome::Finished(FinishReason::ToolRejected));
        assert!(!agent_loop.timeline.has_pending());
    }

    #[test]
    fn test_pending_correction_reverts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let agent_loop = AgentLoop::new(Agent::new("t"), tx);
        agent_loop.timeline.set_n_checkpoints(3);
        agent_loop.timeline.send(2, "try the other port").unwrap();

        let outcome = agent_loop.decide(&[outcome("bash", "ok", ToolStatus::Ok)], false);
        assert_eq!(
            outcome,
            StepOutcome::Revert(PendingCorrection {
                checkpoint_id: 2,
                message: "try the other port".into()
            })
        );
        assert_eq!(
            agent_loop.decide(&[], true),
            StepOutcome::Finished(FinishReason::NoToolCalls)
        );
    }

    #[test]
    fn test_set_thinking_requires_capability() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut agent_loop = AgentLoop::new(Agent::new("t"), tx);
        assert!(matches!(
            agent_loop.set_thinking(true),
            Err(ConfigError::LlmNotSet)
        ));
        assert_eq!(agent_loop.status().context_usage, 0.0);

        let provider = Arc::new(crate::provider::MockProvider::text("hi"));
        let mut agent_loop = agent_loop.with_llm(Llm::new(provider.clone(), "plain", 1000));
        assert!(matches!(
            agent_loop.set_thinking(true),
            Err(ConfigError::LlmNotSupported { .. })
        ));
        agent_loop.set_thinking(false).unwrap();

        let mut agent_loop = agent_loop
            .with_llm(Llm::new(provider, "thinker", 1000).with_capability(Capability::Thinking));
        agent_loop.set_thinking(true).unwrap();
        assert_eq!(agent_loop.thinking_level(), ThinkingLevel::High);
    }
}
