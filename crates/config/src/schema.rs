/// Config schema types: LLM provider credentials and the memory embedding section.
use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MoltisConfig {
    pub providers: ProvidersConfig,
    pub memory: MemoryConfig,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider-specific settings keyed by provider name.
    /// Known keys for embeddings: "openai", "gemini".
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

/// Configuration for a single LLM provider.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    /// Whether this provider is enabled. Defaults to true.
    pub enabled: bool,

    /// Override the API key (optional; the provider's env var is used when unset).
    pub api_key: Option<String>,

    /// Override the base URL.
    pub base_url: Option<String>,

    /// Default model ID for this provider.
    pub model: Option<String>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

impl fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl ProvidersConfig {
    /// Check if a provider is enabled (defaults to true if not configured).
    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.get(name).is_none_or(|e| e.enabled)
    }

    /// Get the configured entry for a provider, if any.
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }
}

/// Which embedding backend the memory subsystem talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    #[default]
    Openai,
    Gemini,
    Local,
}

/// `[memory]` section: embedding cache, batching, retry and timeout knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub provider: EmbeddingProviderKind,
    /// Embedding model override; the provider default is used when unset.
    pub model: Option<String>,
    /// Token budget for a single inline `embed_batch` call.
    pub max_tokens_per_batch: usize,
    /// Parallelism for the indexing loop when batch mode is off.
    pub index_concurrency: usize,
    pub cache: EmbeddingCacheConfig,
    pub batch: BatchEmbeddingConfig,
    pub retry: EmbeddingRetryConfig,
    pub timeouts: EmbeddingTimeoutConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            model: None,
            max_tokens_per_batch: 8000,
            index_concurrency: 4,
            cache: EmbeddingCacheConfig::default(),
            batch: BatchEmbeddingConfig::default(),
            retry: EmbeddingRetryConfig::default(),
            timeouts: EmbeddingTimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingCacheConfig {
    pub enabled: bool,
    /// Upper bound on cached rows; `None` disables pruning.
    pub max_entries: Option<usize>,
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: None,
        }
    }
}

/// Provider batch API settings (OpenAI `/v1/batches`, Gemini `asyncBatchEmbedContent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchEmbeddingConfig {
    /// Opt-in: batch jobs trade latency for cost.
    pub enabled: bool,
    /// Block until the job finishes. When false an unfinished job is a failure.
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub timeout_minutes: u64,
    /// Failures before batch mode is turned off for the life of the service.
    pub failure_limit: u32,
    pub debug: bool,
}

impl Default for BatchEmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait: true,
            concurrency: 2,
            poll_interval_ms: 2000,
            timeout_minutes: 60,
            failure_limit: 2,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for EmbeddingRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

/// Per-call deadlines. Local providers are CPU-bound and get longer budgets.
/// A value of 0 disables the deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingTimeoutConfig {
    pub query_remote_secs: u64,
    pub query_local_secs: u64,
    pub batch_remote_secs: u64,
    pub batch_local_secs: u64,
}

impl Default for EmbeddingTimeoutConfig {
    fn default() -> Self {
        Self {
            query_remote_secs: 60,
            query_local_secs: 300,
            batch_remote_secs: 120,
            batch_local_secs: 600,
        }
    }
}
