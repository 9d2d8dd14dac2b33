//! Configuration loading for moltis: file discovery, `${ENV}` substitution,
//! and the typed schema (providers and the memory embedding section).

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, find_config_file, load_config},
    schema::{
        BatchEmbeddingConfig, EmbeddingCacheConfig, EmbeddingProviderKind, EmbeddingRetryConfig,
        EmbeddingTimeoutConfig, MemoryConfig, MoltisConfig, ProviderEntry, ProvidersConfig,
    },
};
