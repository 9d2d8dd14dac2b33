//! Memory embeddings: chunks → cached vectors, with token-budget batching,
//! retry/backoff, timeouts, provider batch APIs and a batch circuit breaker.

pub mod batch;
pub mod batch_gemini;
pub mod batch_openai;
pub mod batching;
pub mod breaker;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod embeddings;
pub mod embeddings_gemini;
pub mod embeddings_openai;
pub mod error;
mod http;
pub mod provider;
pub mod retry;
pub mod service;
pub mod timeout;

pub use {
    batch::{BatchFlavor, BatchJob, BatchOrchestrator, BatchOutcome, BatchRequest, BatchRunner},
    breaker::BatchCircuitBreaker,
    cache::{CacheScope, EmbeddingCacheStore},
    chunk::{Chunk, FileEntry, MemorySource},
    config::EmbeddingServiceConfig,
    embeddings::EmbeddingProvider,
    error::EmbeddingError,
    provider::{ProviderHandle, ProviderKind, resolve_provider},
    service::{BatchStatus, EmbeddingService},
};
