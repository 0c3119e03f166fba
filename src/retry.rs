//! Retry with exponential backoff and jitter for provider calls.

use crate::provider::ProviderError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Called before each backoff sleep.
pub type OnRetryFn = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Configuration for automatic retry of transient provider errors.
///
/// Defaults: 3 attempts in total, 0.3s initial delay doubling each time,
/// up to 0.5s of added jitter, 10s max delay.
/// Use `RetryConfig::none()` to disable retries entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of calls, the first one included.
    pub max_attempts: usize,
    /// Delay before the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// Maximum delay between attempts (milliseconds).
    pub max_delay_ms: u64,
    /// Upper bound of the random delay added to each wait (milliseconds).
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 300,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter_ms: 500,
        }
    }
}

impl RetryConfig {
    /// No retries. Fail immediately on any error.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let base_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let jitter_ms = rand::random::<f64>() * self.jitter_ms as f64;
        let capped_ms = (base_ms + jitter_ms).min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped_ms as u64)
    }
}

/// HTTP statuses worth another try: gateway, rate-limit and CDN errors.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(
        status,
        404 | 408 | 429 | 500 | 502 | 503 | 504 | 520..=527
    )
}

impl ProviderError {
    /// Whether this error is safe to retry.
    ///
    /// Retryable: connection failures, timeouts, empty responses, transport
    /// I/O errors, and the statuses in [`is_retryable_status`].
    /// Not retryable: auth errors, API errors (bad request), cancellation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::EmptyResponse | Self::Transport(_) => {
                true
            }
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Auth(_) | Self::Api(_) | Self::Cancelled | Self::Other(_) => false,
        }
    }
}

/// One scheduled retry, as reported to [`OnRetryFn`].
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub label: String,
    /// The attempt that just failed (1-indexed).
    pub attempt: usize,
    pub delay: Duration,
    pub error: String,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` calls have been made. The last error is returned
/// unchanged.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    on_retry: Option<&OnRetryFn>,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                log_retry(label, attempt, max_attempts, &delay, &e);
                if let Some(on_retry) = on_retry {
                    on_retry(&RetryAttempt {
                        label: label.to_string(),
                        attempt,
                        delay,
                        error: e.to_string(),
                    });
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Log a retry attempt.
fn log_retry(label: &str, attempt: usize, max: usize, delay: &Duration, error: &ProviderError) {
    info!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        "Retrying {} (attempt {}/{}) in {:.1}s: {}",
        label,
        attempt,
        max,
        delay.as_secs_f64(),
        error
    );
}
