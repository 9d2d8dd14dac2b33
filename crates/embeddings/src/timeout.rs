//! Deadlines for provider calls.
//!
//! The guarded future is dropped when the deadline fires, which aborts the
//! underlying HTTP request instead of leaving it running in the background.

use std::{future::Future, time::Duration};

use moltis_config::EmbeddingTimeoutConfig;

use crate::error::EmbeddingError;

pub const QUERY_TIMEOUT_REMOTE: Duration = Duration::from_secs(60);
pub const QUERY_TIMEOUT_LOCAL: Duration = Duration::from_secs(5 * 60);
pub const BATCH_TIMEOUT_REMOTE: Duration = Duration::from_secs(2 * 60);
pub const BATCH_TIMEOUT_LOCAL: Duration = Duration::from_secs(10 * 60);

/// Per-call deadlines, split by whether the provider runs in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub query_remote: Duration,
    pub query_local: Duration,
    pub batch_remote: Duration,
    pub batch_local: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            query_remote: QUERY_TIMEOUT_REMOTE,
            query_local: QUERY_TIMEOUT_LOCAL,
            batch_remote: BATCH_TIMEOUT_REMOTE,
            batch_local: BATCH_TIMEOUT_LOCAL,
        }
    }
}

impl From<&EmbeddingTimeoutConfig> for TimeoutPolicy {
    fn from(cfg: &EmbeddingTimeoutConfig) -> Self {
        Self {
            query_remote: Duration::from_secs(cfg.query_remote_secs),
            query_local: Duration::from_secs(cfg.query_local_secs),
            batch_remote: Duration::from_secs(cfg.batch_remote_secs),
            batch_local: Duration::from_secs(cfg.batch_local_secs),
        }
    }
}

impl TimeoutPolicy {
    pub fn query(&self, is_local: bool) -> Duration {
        if is_local {
            self.query_local
        } else {
            self.query_remote
        }
    }

    pub fn batch(&self, is_local: bool) -> Duration {
        if is_local {
            self.batch_local
        } else {
            self.batch_remote
        }
    }
}

/// Race `fut` against `timeout`. A zero timeout disables the deadline.
pub async fn with_timeout<T, F>(fut: F, timeout: Duration, message: &str) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(EmbeddingError::Timeout(message.to_string()).into()),
    }
}

/// "memory embeddings query timed out after 60s"
pub fn timeout_message(kind: &str, timeout: Duration) -> String {
    format!(
        "memory embeddings {kind} timed out after {}s",
        timeout.as_secs_f64().round() as u64
    )
}
