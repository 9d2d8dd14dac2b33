/// Provider-agnostic embedding capability.
use async_trait::async_trait;

use crate::error::EmbeddingError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a search query.
    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embed document texts. Must return one vector per input, in input order.
    /// Providers without a bulk endpoint fall back to one query call per text.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_query(text).await?);
        }
        Ok(out)
    }

    /// Model identifier, part of the cache key (e.g. "text-embedding-3-small").
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Distinguishes accounts/endpoints sharing a provider and model so cached
    /// vectors never leak across them.
    fn provider_key(&self) -> &str;
}

/// Reject provider responses whose length does not line up with the request.
pub fn ensure_vector_count(expected: usize, got: usize) -> anyhow::Result<()> {
    if expected != got {
        return Err(EmbeddingError::CountMismatch { expected, got }.into());
    }
    Ok(())
}
