//! Errors surfaced by a run.

use crate::context::ContextError;
use crate::provider::ProviderError;
use crate::types::Capability;

/// The agent is not set up to handle the request. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LLM is not set")]
    LlmNotSet,
    #[error("LLM '{model}' does not support required capabilities: {}", format_capabilities(.capabilities))]
    LlmNotSupported {
        model: String,
        capabilities: Vec<Capability>,
    },
    #[error("LLM '{model}' has a context window of {max_context_size} tokens, smaller than the {reserved_tokens} reserved tokens")]
    ContextTooSmall {
        model: String,
        max_context_size: usize,
        reserved_tokens: usize,
    },
}

fn format_capabilities(capabilities: &[Capability]) -> String {
    capabilities
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(ProviderError),
    #[error("Interrupted")]
    Interrupted,
    #[error("Max number of steps reached: {max_steps}")]
    MaxStepsReached { max_steps: usize },
    /// A broken internal guarantee. Indicates a bug, not bad input.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl From<ProviderError> for RunError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Cancelled => Self::Interrupted,
            other => Self::Provider(other),
        }
    }
}

impl From<ContextError> for RunError {
    fn from(e: ContextError) -> Self {
        Self::InvariantViolation(e.to_string())
    }
}

impl RunError {
    /// Errors that abort a step mid-flight and are reported as an interruption.
    pub fn interrupts_step(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_provider_error_is_interruption() {
        let err: RunError = ProviderError::Cancelled.into();
        assert!(matches!(err, RunError::Interrupted));
        assert!(err.interrupts_step());
    }

    #[test]
    fn test_unsupported_message_lists_capabilities() {
        let err = ConfigError::LlmNotSupported {
            model: "kimi".into(),
            capabilities: vec![Capability::ImageIn, Capability::Thinking],
        };
        assert_eq!(
            err.to_string(),
            "LLM 'kimi' does not support required capabilities: image_in, thinking"
        );
    }
}
