/// Errors callers may need to tell apart. Everything else travels as `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// A provider call or batch submission exceeded its deadline.
    #[error("{0}")]
    Timeout(String),

    /// A batch submission failed after `attempts` tries.
    #[error("{message}")]
    BatchFailed { message: String, attempts: u32 },

    #[error("embedding provider returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    /// A batch job finished but some requests have no vector.
    #[error("batch result missing {missing} of {expected} embeddings")]
    BatchIncomplete { missing: usize, expected: usize },
}

impl EmbeddingError {
    /// Number of submission attempts behind this error, for the circuit breaker.
    pub fn attempts_of(err: &anyhow::Error) -> u32 {
        match err.downcast_ref::<Self>() {
            Some(Self::BatchFailed { attempts, .. }) => *attempts,
            _ => 1,
        }
    }

    pub fn is_timeout(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Self>(), Some(Self::Timeout(_)))
    }
}
