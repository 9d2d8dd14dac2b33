//! Runtime settings for [`crate::service::EmbeddingService`], resolved from
//! the `[memory]` section of the moltis config.

use moltis_config::MemoryConfig;

use crate::{
    batch::BatchSettings, batching::DEFAULT_MAX_TOKENS_PER_BATCH,
    breaker::DEFAULT_BATCH_FAILURE_LIMIT, retry::RetryPolicy, timeout::TimeoutPolicy,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingServiceConfig {
    pub max_tokens_per_batch: usize,
    pub index_concurrency: usize,
    pub cache_enabled: bool,
    pub cache_max_entries: Option<usize>,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutPolicy,
    /// Whether provider batch APIs should be used when the provider has one.
    pub batch_enabled: bool,
    pub batch: BatchSettings,
    pub batch_failure_limit: u32,
}

impl Default for EmbeddingServiceConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_batch: DEFAULT_MAX_TOKENS_PER_BATCH,
            index_concurrency: 4,
            cache_enabled: true,
            cache_max_entries: None,
            retry: RetryPolicy::default(),
            timeouts: TimeoutPolicy::default(),
            batch_enabled: false,
            batch: BatchSettings::default(),
            batch_failure_limit: DEFAULT_BATCH_FAILURE_LIMIT,
        }
    }
}

impl From<&MemoryConfig> for EmbeddingServiceConfig {
    fn from(cfg: &MemoryConfig) -> Self {
        Self {
            max_tokens_per_batch: cfg.max_tokens_per_batch.max(1),
            index_concurrency: cfg.index_concurrency.max(1),
            cache_enabled: cfg.cache.enabled,
            cache_max_entries: cfg.cache.max_entries,
            retry: RetryPolicy::from(&cfg.retry),
            timeouts: TimeoutPolicy::from(&cfg.timeouts),
            batch_enabled: cfg.batch.enabled,
            batch: BatchSettings::from(&cfg.batch),
            batch_failure_limit: cfg.batch.failure_limit.max(1),
        }
    }
}
