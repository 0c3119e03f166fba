//! Loop and model configuration.
//!
//! All structs deserialize with defaults for missing fields so they can be
//! embedded in a larger config file.

use crate::provider::{Llm, OpenAiCompatProvider, ProviderError};
use crate::retry::RetryConfig;
use crate::types::Capability;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Limits for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoopControl {
    pub max_steps_per_run: usize,
    /// Total attempts for each engine call, the first one included.
    pub max_retries_per_step: usize,
    /// Corrections applied in one run before the run is aborted.
    pub max_corrections_per_run: usize,
    /// Headroom kept free in the context window; compaction starts when
    /// `tokens + reserved_tokens >= max_context_size`.
    pub reserved_tokens: usize,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            max_steps_per_run: 100,
            max_retries_per_step: 3,
            max_corrections_per_run: 8,
            reserved_tokens: 50_000,
        }
    }
}

impl LoopControl {
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps_per_run = max_steps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries_per_step = max_retries;
        self
    }

    pub fn with_max_corrections(mut self, max_corrections: usize) -> Self {
        self.max_corrections_per_run = max_corrections;
        self
    }

    pub fn with_reserved_tokens(mut self, reserved: usize) -> Self {
        self.reserved_tokens = reserved;
        self
    }

    /// Backoff policy for engine calls, bounded by `max_retries_per_step`.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::default().with_max_attempts(self.max_retries_per_step)
    }
}

/// An OpenAI-compatible reasoning engine endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_context_size: usize,
    pub capabilities: Vec<Capability>,
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.moonshot.cn/v1".into(),
            api_key: String::new(),
            model: "kimi-k2-turbo-preview".into(),
            max_context_size: 128_000,
            capabilities: Vec::new(),
            timeout_secs: 300,
        }
    }
}

impl ModelConfig {
    pub fn into_llm(self) -> Result<Llm, ProviderError> {
        let provider = OpenAiCompatProvider::new(self.base_url, self.api_key)
            .with_timeout(Duration::from_secs(self.timeout_secs))?;
        let mut llm = Llm::new(Arc::new(provider), self.model, self.max_context_size);
        llm.capabilities.extend(self.capabilities);
        Ok(llm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let control: LoopControl =
            serde_json::from_value(serde_json::json!({"max_steps_per_run": 15})).unwrap();
        assert_eq!(control.max_steps_per_run, 15);
        assert_eq!(control.max_retries_per_step, 3);
        assert_eq!(control.reserved_tokens, 50_000);
        assert_eq!(control.retry_config().max_attempts, 3);
    }

    #[test]
    fn test_model_config_builds_llm() {
        let config: ModelConfig = serde_json::from_value(serde_json::json!({
            "base_url": "http://localhost:8080/v1",
            "model": "local",
            "capabilities": ["image_in", "thinking"],
        }))
        .unwrap();
        let llm = config.into_llm().unwrap();
        assert_eq!(llm.model, "local");
        assert_eq!(llm.max_context_size, 128_000);
        assert!(llm.supports(Capability::ImageIn));
        assert!(llm.supports(Capability::Thinking));
    }
}
