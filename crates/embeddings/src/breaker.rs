//! Failure counter that turns provider batch mode off after repeated failures.
//!
//! The transition is one-way: nothing in here re-enables batch mode. A
//! service that has tripped keeps using inline calls until it is rebuilt.

use {
    once_cell::sync::Lazy,
    regex::Regex,
    serde::Serialize,
    tokio::sync::Mutex,
    tracing::{debug, warn},
};

pub const DEFAULT_BATCH_FAILURE_LIMIT: u32 = 2;

#[allow(clippy::unwrap_used)]
static BATCH_UNSUPPORTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)asyncBatchEmbedContent not available").unwrap());

/// Errors saying the provider has no batch API at all. Retrying is pointless.
pub fn is_batch_unsupported_error(message: &str) -> bool {
    BATCH_UNSUPPORTED.is_match(message)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchFailureState {
    pub count: u32,
    pub last_error: Option<String>,
    pub last_provider: Option<String>,
    /// Set once the limit is reached and never cleared.
    pub tripped: bool,
}

/// Result of recording one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFailureOutcome {
    /// The limit has been reached; the caller must stop using batch mode.
    pub disabled: bool,
    pub count: u32,
}

/// Shared across every concurrent batch call of one service.
#[derive(Debug)]
pub struct BatchCircuitBreaker {
    state: Mutex<BatchFailureState>,
    limit: u32,
}

impl Default for BatchCircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_FAILURE_LIMIT)
    }
}

impl BatchCircuitBreaker {
    pub fn new(limit: u32) -> Self {
        Self {
            state: Mutex::new(BatchFailureState::default()),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count a failed batch submission. `attempts` is how many submissions the
    /// failure covers; `force_disable` jumps straight to the limit.
    pub async fn record_failure(
        &self,
        provider: &str,
        message: &str,
        attempts: u32,
        force_disable: bool,
    ) -> BatchFailureOutcome {
        let mut state = self.state.lock().await;
        state.count = if force_disable {
            self.limit
        } else {
            state.count.saturating_add(attempts.max(1))
        };
        state.last_error = Some(message.to_string());
        state.last_provider = Some(provider.to_string());
        state.tripped |= state.count >= self.limit;

        let outcome = BatchFailureOutcome {
            disabled: state.tripped,
            count: state.count,
        };
        warn!(
            provider,
            count = outcome.count,
            limit = self.limit,
            force_disable,
            "batch embedding failure recorded"
        );
        outcome
    }

    /// Clear the failure count. A tripped breaker keeps its state, including
    /// the error that tripped it.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        if state.tripped {
            debug!(
                count = state.count,
                "batch embedding succeeded after breaker tripped, keeping state"
            );
            return;
        }
        if state.count > 0 {
            debug!(previous = state.count, "batch embedding succeeded, resetting failures");
        }
        *state = BatchFailureState::default();
    }

    pub async fn snapshot(&self) -> BatchFailureState {
        self.state.lock().await.clone()
    }
}
