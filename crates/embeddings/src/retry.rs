//! Exponential backoff with bounded positive jitter for inline embedding calls.

use std::{future::Future, time::Duration};

use {moltis_config::EmbeddingRetryConfig, once_cell::sync::Lazy, regex::Regex, tracing::warn};

use crate::error::EmbeddingError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(8000);
/// Jitter is drawn from `[0, MAX_JITTER)` and only ever lengthens the delay.
pub const MAX_JITTER: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl From<&EmbeddingRetryConfig> for RetryPolicy {
    fn from(cfg: &EmbeddingRetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

#[allow(clippy::unwrap_used)]
static RETRYABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(rate[_ ]limit|too many requests|\b429\b|resource has been exhausted|\b5\d{2}\b|cloudflare)",
    )
    .unwrap()
});

/// Rate limits, 5xx responses and CDN edge failures are worth another try.
pub fn is_retryable_embedding_error(message: &str) -> bool {
    RETRYABLE.is_match(message)
}

/// Transient = classifier match on the full error chain, or a deadline hit.
pub fn is_transient(err: &anyhow::Error) -> bool {
    EmbeddingError::is_timeout(err) || is_retryable_embedding_error(&format!("{err:#}"))
}

/// Delay before retry number `retry` (1-based): `base * 2^(retry-1) * (1 + jitter)`,
/// capped at `max_delay`.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32, jitter: f64) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    let exp = policy.base_delay.saturating_mul(1u32 << exponent);
    let jittered = exp.mul_f64(1.0 + jitter.clamp(0.0, MAX_JITTER));
    jittered.min(policy.max_delay)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned unchanged.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    is_retryable: impl Fn(&anyhow::Error) -> bool,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= max_attempts || !is_retryable(&err) {
            return Err(err);
        }
        let delay = backoff_delay(policy, attempt, rand::random::<f64>() * MAX_JITTER);
        warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "embedding call failed, retrying"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!("moltis_memory_embedding_retries_total").increment(1);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
