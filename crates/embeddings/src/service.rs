//! Embedding façade used by the memory indexer.
//!
//! Chunks are served from the cache first. Misses go either through the
//! provider's batch API or inline through token-budget bins with retry and
//! timeouts. Batch failures are absorbed: they are recorded on the circuit
//! breaker and the same chunks are embedded inline instead.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    anyhow::Result,
    moltis_config::MoltisConfig,
    serde::Serialize,
    sqlx::SqlitePool,
    tracing::{debug, info, warn},
};

use crate::{
    batch::{BatchOrchestrator, BatchSettings},
    batching::{build_batches, estimate_tokens},
    breaker::{BatchCircuitBreaker, is_batch_unsupported_error},
    cache::{CacheScope, EmbeddingCacheStore},
    chunk::{Chunk, FileEntry, MemorySource},
    config::EmbeddingServiceConfig,
    embeddings::ensure_vector_count,
    error::EmbeddingError,
    provider::{ProviderHandle, resolve_provider},
    retry::{call_with_retry, is_transient},
    timeout::{timeout_message, with_timeout},
};

/// Snapshot of batch mode for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStatus {
    pub enabled: bool,
    pub failures: u32,
    pub limit: u32,
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub last_error: Option<String>,
    pub last_provider: Option<String>,
}

pub struct EmbeddingService {
    provider: ProviderHandle,
    cache: Arc<EmbeddingCacheStore>,
    scope: CacheScope,
    batch: Option<BatchOrchestrator>,
    breaker: BatchCircuitBreaker,
    batch_enabled: AtomicBool,
    config: EmbeddingServiceConfig,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("provider", &self.provider)
            .field("scope", &self.scope)
            .field("batch_enabled", &self.is_batch_enabled())
            .field("cache_enabled", &self.cache.is_enabled())
            .finish()
    }
}

/// Chunk positions that missed the cache, with their chunks.
type Missing<'a> = Vec<(usize, &'a Chunk)>;

impl EmbeddingService {
    pub fn new(
        provider: ProviderHandle,
        cache: Arc<EmbeddingCacheStore>,
        config: EmbeddingServiceConfig,
    ) -> Self {
        let batch = if config.batch_enabled {
            provider.batch_orchestrator(config.batch.clone())
        } else {
            None
        };
        let batch_enabled = batch.is_some();
        Self {
            scope: provider.cache_scope(),
            breaker: BatchCircuitBreaker::new(config.batch_failure_limit),
            batch_enabled: AtomicBool::new(batch_enabled),
            provider,
            cache,
            batch,
            config,
        }
    }

    /// Resolve the configured provider and open the cache on `pool`.
    pub async fn from_config(config: &MoltisConfig, pool: SqlitePool) -> Result<Self> {
        let service_config = EmbeddingServiceConfig::from(&config.memory);
        let provider = resolve_provider(config)?;
        let cache = EmbeddingCacheStore::open(pool, service_config.cache_enabled).await?;
        Ok(Self::new(provider, Arc::new(cache), service_config))
    }

    pub fn provider(&self) -> &ProviderHandle {
        &self.provider
    }

    pub fn cache(&self) -> &Arc<EmbeddingCacheStore> {
        &self.cache
    }

    /// Embed a search query. Deadline only: queries are neither cached nor retried.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let timeout = self.config.timeouts.query(self.provider.is_local());
        with_timeout(
            self.provider.provider().embed_query(text),
            timeout,
            &timeout_message("query", timeout),
        )
        .await
    }

    /// Embed every chunk of one file. Returns one vector per chunk, in order.
    pub async fn embed_chunks_for_file(
        &self,
        chunks: &[Chunk],
        file: &FileEntry,
        source: MemorySource,
    ) -> Result<Vec<Vec<f32>>> {
        match self.batch.as_ref() {
            Some(orchestrator) if self.is_batch_enabled() => {
                self.embed_chunks_with_batch(orchestrator, chunks, file, source)
                    .await
            },
            _ => self.embed_chunks_in_batches(chunks).await,
        }
    }

    /// Inline path: cache, then token-budget bins with retry and timeouts.
    pub async fn embed_chunks_in_batches(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let (mut slots, missing) = self.lookup_cached(chunks).await;
        if !missing.is_empty() {
            let vectors = self.embed_inline(&missing).await?;
            self.store(&missing, &vectors).await;
            fill(&mut slots, &missing, vectors);
        }
        collect_slots(slots)
    }

    async fn embed_chunks_with_batch(
        &self,
        orchestrator: &BatchOrchestrator,
        chunks: &[Chunk],
        file: &FileEntry,
        source: MemorySource,
    ) -> Result<Vec<Vec<f32>>> {
        let (mut slots, missing) = self.lookup_cached(chunks).await;
        if missing.is_empty() {
            return collect_slots(slots);
        }

        let vectors = match orchestrator.run(&missing, file, source).await {
            Ok(vectors) => {
                self.breaker.record_success().await;
                vectors
            },
            Err(err) => {
                self.record_batch_failure(orchestrator.provider_id(), &err)
                    .await;
                self.embed_inline(&missing).await?
            },
        };
        self.store(&missing, &vectors).await;
        fill(&mut slots, &missing, vectors);
        collect_slots(slots)
    }

    async fn record_batch_failure(&self, provider: &str, err: &anyhow::Error) {
        let message = format!("{err:#}");
        let force_disable = is_batch_unsupported_error(&message);
        let outcome = self
            .breaker
            .record_failure(
                provider,
                &message,
                EmbeddingError::attempts_of(err),
                force_disable,
            )
            .await;
        #[cfg(feature = "metrics")]
        metrics::counter!("moltis_memory_embedding_batch_failures_total").increment(1);

        if outcome.disabled {
            if self.batch_enabled.swap(false, Ordering::SeqCst) {
                #[cfg(feature = "metrics")]
                metrics::counter!("moltis_memory_embedding_batch_disabled_total").increment(1);
                info!(
                    provider,
                    failures = outcome.count,
                    limit = self.breaker.limit(),
                    "batch embeddings disabled, using inline calls"
                );
            }
        } else {
            warn!(
                provider,
                error = %message,
                failures = outcome.count,
                "batch embedding failed, falling back to inline calls"
            );
        }
    }

    /// Split `chunks` into cached vectors (by position) and misses.
    /// A failing cache read degrades to all-miss.
    async fn lookup_cached<'a>(&self, chunks: &'a [Chunk]) -> (Vec<Option<Vec<f32>>>, Missing<'a>) {
        let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
        let cached = match self.cache.lookup(&self.scope, &hashes).await {
            Ok(found) => found,
            Err(e) => {
                warn!(provider = %self.scope.provider, error = %e, "embedding cache lookup failed");
                Default::default()
            },
        };

        let mut slots = Vec::with_capacity(chunks.len());
        let mut missing = Vec::new();
        for (position, chunk) in chunks.iter().enumerate() {
            match cached.get(&chunk.hash) {
                Some(v) => slots.push(Some(v.clone())),
                None => {
                    slots.push(None);
                    missing.push((position, chunk));
                },
            }
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("moltis_memory_embedding_cache_hits_total")
                .increment((chunks.len() - missing.len()) as u64);
            metrics::counter!("moltis_memory_embedding_cache_misses_total")
                .increment(missing.len() as u64);
        }
        (slots, missing)
    }

    /// Embed `missing` through token-budget bins. One vector per entry, in order.
    async fn embed_inline(&self, missing: &[(usize, &Chunk)]) -> Result<Vec<Vec<f32>>> {
        let provider = self.provider.provider();
        let timeout = self.config.timeouts.batch(self.provider.is_local());
        let message = timeout_message("batch", timeout);
        let message = message.as_str();

        let bins = build_batches(
            missing.iter().map(|(_, chunk)| chunk.text.clone()),
            self.config.max_tokens_per_batch,
            |text| estimate_tokens(text),
        );
        debug!(
            provider = self.provider.id(),
            chunks = missing.len(),
            bins = bins.len(),
            "embedding chunks inline"
        );

        let mut out = Vec::with_capacity(missing.len());
        for texts in &bins {
            let vectors = call_with_retry(
                &self.config.retry,
                move || with_timeout(provider.embed_batch(texts), timeout, message),
                is_transient,
            )
            .await?;
            ensure_vector_count(texts.len(), vectors.len())?;
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Write fresh vectors back to the cache. Failures are logged, not returned.
    async fn store(&self, missing: &[(usize, &Chunk)], vectors: &[Vec<f32>]) {
        let entries: Vec<(&str, &[f32])> = missing
            .iter()
            .zip(vectors)
            .map(|((_, chunk), v)| (chunk.hash.as_str(), v.as_slice()))
            .collect();
        if let Err(e) = self.cache.upsert(&self.scope, &entries).await {
            warn!(provider = %self.scope.provider, error = %e, "embedding cache write failed");
        }
    }

    pub fn is_batch_enabled(&self) -> bool {
        self.batch_enabled.load(Ordering::SeqCst)
    }

    fn batch_settings(&self) -> &BatchSettings {
        self.batch
            .as_ref()
            .map_or(&self.config.batch, BatchOrchestrator::settings)
    }

    pub async fn batch_status(&self) -> BatchStatus {
        let state = self.breaker.snapshot().await;
        let batch = self.batch_settings();
        BatchStatus {
            enabled: self.is_batch_enabled(),
            failures: state.count,
            limit: self.breaker.limit(),
            wait: batch.wait,
            concurrency: batch.concurrency,
            poll_interval_ms: batch.poll_interval.as_millis() as u64,
            timeout_ms: batch.timeout.as_millis() as u64,
            last_error: state.last_error,
            last_provider: state.last_provider,
        }
    }

    pub async fn cache_entry_count(&self) -> Result<usize> {
        self.cache.count().await
    }

    /// Parallelism for the caller's per-file loop: the batch concurrency while
    /// batch mode is active, `default` otherwise.
    pub fn index_concurrency(&self, default: usize) -> usize {
        if self.is_batch_enabled() {
            self.batch_settings().concurrency
        } else {
            default
        }
    }

    /// [`Self::index_concurrency`] falling back to `[memory] index_concurrency`.
    pub fn configured_index_concurrency(&self) -> usize {
        self.index_concurrency(self.config.index_concurrency)
    }

    pub async fn prune_embedding_cache_if_needed(&self) -> Result<u64> {
        self.cache.prune(self.config.cache_max_entries).await
    }

    /// Copy every cached vector from `source` into this service's cache.
    pub async fn seed_embedding_cache(&self, source: &EmbeddingCacheStore) -> Result<u64> {
        self.cache.seed(source).await
    }
}

fn fill(slots: &mut [Option<Vec<f32>>], missing: &[(usize, &Chunk)], vectors: Vec<Vec<f32>>) {
    for ((position, _), v) in missing.iter().zip(vectors) {
        slots[*position] = Some(v);
    }
}

fn collect_slots(slots: Vec<Option<Vec<f32>>>) -> Result<Vec<Vec<f32>>> {
    let expected = slots.len();
    let vectors: Vec<Vec<f32>> = slots.into_iter().flatten().collect();
    ensure_vector_count(expected, vectors.len())?;
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            batch::{BatchJob, BatchOutcome, BatchRunner},
            embeddings::EmbeddingProvider,
            retry::RetryPolicy,
            timeout::TimeoutPolicy,
        },
        async_trait::async_trait,
        std::{
            collections::HashMap,
            sync::{Mutex, atomic::AtomicUsize},
            time::{Duration, Instant},
        },
    };

    fn vector_for(text: &str) -> Vec<f32> {
        vec![text.chars().count() as f32, 1.0]
    }

    #[derive(Default)]
    struct MockProvider {
        batch_calls: AtomicUsize,
        rate_limited_calls: AtomicUsize,
        bin_sizes: Mutex<Vec<usize>>,
        query_delay: Option<Duration>,
    }

    impl MockProvider {
        fn failing_first(n: usize) -> Self {
            Self {
                rate_limited_calls: AtomicUsize::new(n),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.batch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockProvider {
        async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(vector_for(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.rate_limited_calls.load(Ordering::SeqCst);
            if remaining > 0 {
                self.rate_limited_calls.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("openai embeddings failed: 429 Too Many Requests");
            }
            self.bin_sizes.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|t| vector_for(t)).collect())
        }

        fn model_name(&self) -> &str {
            "mock-embed"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn provider_key(&self) -> &str {
            "mock-key"
        }
    }

    enum RunnerMode {
        Echo,
        Ordered,
        Fail(&'static str),
        FailOnceThenEcho(&'static str),
        /// Sleep this long before answering, on the first `n` calls.
        SlowFirst(usize, Duration),
        /// Jobs containing `slow` succeed after `delay`; every other job fails.
        SlowOrFail { slow: &'static str, delay: Duration, error: &'static str },
    }

    struct MockRunner {
        mode: RunnerMode,
        calls: AtomicUsize,
    }

    impl MockRunner {
        fn new(mode: RunnerMode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn echo(job: &BatchJob) -> BatchOutcome {
        BatchOutcome::Reconciled(
            job.requests
                .iter()
                .map(|r| (r.custom_id.clone(), vector_for(r.payload.text())))
                .collect::<HashMap<_, _>>(),
        )
    }

    #[async_trait]
    impl BatchRunner for MockRunner {
        async fn run(&self, job: BatchJob) -> Result<BatchOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.mode {
                RunnerMode::Echo => Ok(echo(&job)),
                RunnerMode::Ordered => Ok(BatchOutcome::AlreadyOrdered(
                    job.requests
                        .iter()
                        .map(|r| vector_for(r.payload.text()))
                        .collect(),
                )),
                RunnerMode::Fail(msg) => anyhow::bail!("{msg}"),
                RunnerMode::FailOnceThenEcho(msg) if call == 0 => anyhow::bail!("{msg}"),
                RunnerMode::FailOnceThenEcho(_) => Ok(echo(&job)),
                RunnerMode::SlowFirst(n, delay) => {
                    if call < *n {
                        tokio::time::sleep(*delay).await;
                    }
                    Ok(echo(&job))
                },
                RunnerMode::SlowOrFail { slow, delay, error } => {
                    if job.requests.iter().any(|r| r.payload.text() == *slow) {
                        tokio::time::sleep(*delay).await;
                        Ok(echo(&job))
                    } else {
                        anyhow::bail!("{error}")
                    }
                },
            }
        }
    }

    fn test_config(batch_enabled: bool) -> EmbeddingServiceConfig {
        EmbeddingServiceConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
            batch_enabled,
            batch: BatchSettings {
                poll_interval: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
                ..BatchSettings::default()
            },
            ..EmbeddingServiceConfig::default()
        }
    }

    async fn cache_store() -> Arc<EmbeddingCacheStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Arc::new(EmbeddingCacheStore::open(pool, true).await.unwrap())
    }

    async fn openai_service(
        provider: Arc<MockProvider>,
        runner: Option<Arc<MockRunner>>,
        config: EmbeddingServiceConfig,
    ) -> EmbeddingService {
        let handle = ProviderHandle::OpenAi {
            provider,
            batch: runner.map(|r| r as Arc<dyn BatchRunner>),
        };
        EmbeddingService::new(handle, cache_store().await, config)
    }

    fn file(path: &str) -> FileEntry {
        FileEntry {
            path: path.into(),
            abs_path: format!("/data/{path}").into(),
            mtime_ms: 0,
            size: 0,
            hash: "file".into(),
        }
    }

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::new(*t, i + 1, i + 1))
            .collect()
    }

    fn expected(texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| vector_for(t)).collect()
    }

    #[tokio::test]
    async fn same_chunk_is_embedded_once() {
        let provider = Arc::new(MockProvider::default());
        let svc = openai_service(Arc::clone(&provider), None, test_config(false)).await;
        let input = chunks(&["remember the milk"]);

        let first = svc.embed_chunks_in_batches(&input).await.unwrap();
        let second = svc.embed_chunks_in_batches(&input).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
        assert_eq!(svc.cache_entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn order_is_preserved_across_hits_and_misses() {
        let provider = Arc::new(MockProvider::default());
        let svc = openai_service(Arc::clone(&provider), None, test_config(false)).await;
        svc.embed_chunks_in_batches(&chunks(&["bb", "dddd"]))
            .await
            .unwrap();

        let texts = ["a", "bb", "ccc", "dddd", "eeeee"];
        let out = svc.embed_chunks_in_batches(&chunks(&texts)).await.unwrap();
        assert_eq!(out, expected(&texts));
        // Second call only sent the three misses.
        assert_eq!(*provider.bin_sizes.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let provider = Arc::new(MockProvider::default());
        let svc = openai_service(Arc::clone(&provider), None, test_config(false)).await;
        assert!(svc.embed_chunks_in_batches(&[]).await.unwrap().is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn inline_bins_respect_token_budget() {
        let provider = Arc::new(MockProvider::default());
        let config = EmbeddingServiceConfig {
            max_tokens_per_batch: 10,
            ..test_config(false)
        };
        let svc = openai_service(Arc::clone(&provider), None, config).await;
        let texts = ["aaaa", "bbbb", "cccc", "dddddddddddddddd", "ee"];
        let out = svc.embed_chunks_in_batches(&chunks(&texts)).await.unwrap();
        assert_eq!(out, expected(&texts));
        assert_eq!(*provider.bin_sizes.lock().unwrap(), vec![2, 1, 1, 1]);
    }

    #[tokio::test]
    async fn rate_limited_bin_is_retried_then_cached() {
        let provider = Arc::new(MockProvider::failing_first(2));
        let svc = openai_service(Arc::clone(&provider), None, test_config(false)).await;
        let texts: Vec<String> = (0..10).map(|i| format!("chunk number {i}")).collect();
        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();

        let start = Instant::now();
        let out = svc
            .embed_chunks_for_file(&chunks(&texts), &file("a.md"), MemorySource::Memory)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(out.len(), 10);
        assert_eq!(out, expected(&texts));
        // One bin: two rate-limited attempts, then success.
        assert_eq!(provider.calls(), 3);
        assert!(elapsed >= Duration::from_millis(30), "{elapsed:?}");
        assert_eq!(svc.cache_entry_count().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn non_transient_inline_error_propagates() {
        struct Broken;

        #[async_trait]
        impl EmbeddingProvider for Broken {
            async fn embed_query(&self, _: &str) -> Result<Vec<f32>> {
                anyhow::bail!("401 invalid api key")
            }

            async fn embed_batch(&self, _: &[String]) -> Result<Vec<Vec<f32>>> {
                anyhow::bail!("401 invalid api key")
            }

            fn model_name(&self) -> &str {
                "m"
            }

            fn dimensions(&self) -> usize {
                1
            }

            fn provider_key(&self) -> &str {
                "k"
            }
        }

        let handle = ProviderHandle::Gemini {
            provider: Arc::new(Broken),
            batch: None,
        };
        let svc = EmbeddingService::new(handle, cache_store().await, test_config(false));
        let err = svc
            .embed_chunks_in_batches(&chunks(&["x"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid api key"));
    }

    #[tokio::test]
    async fn batch_path_reconciles_and_caches() {
        let provider = Arc::new(MockProvider::default());
        let runner = MockRunner::new(RunnerMode::Echo);
        let svc = openai_service(
            Arc::clone(&provider),
            Some(Arc::clone(&runner)),
            test_config(true),
        )
        .await;
        assert!(svc.is_batch_enabled());

        let texts = ["alpha", "be", "gamma-ray"];
        let out = svc
            .embed_chunks_for_file(&chunks(&texts), &file("notes.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert_eq!(out, expected(&texts));
        assert_eq!(runner.calls(), 1);
        assert_eq!(provider.calls(), 0);
        assert_eq!(svc.cache_entry_count().await.unwrap(), 3);

        // Fully cached: the runner is not consulted again.
        svc.embed_chunks_for_file(&chunks(&texts), &file("notes.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn already_ordered_results_are_used_and_cached() {
        let runner = MockRunner::new(RunnerMode::Ordered);
        let svc = openai_service(
            Arc::new(MockProvider::default()),
            Some(runner),
            test_config(true),
        )
        .await;
        let texts = ["one", "three", "fifteen"];
        let out = svc
            .embed_chunks_for_file(&chunks(&texts), &file("a.md"), MemorySource::Sessions)
            .await
            .unwrap();
        assert_eq!(out, expected(&texts));
        assert_eq!(svc.cache_entry_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unsupported_batch_api_disables_after_one_failure() {
        let provider = Arc::new(MockProvider::default());
        let runner = MockRunner::new(RunnerMode::Fail(
            "gemini batch create failed: asyncBatchEmbedContent not available for model gemini-embedding-001 (404)",
        ));
        let handle = ProviderHandle::Gemini {
            provider: Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
            batch: Some(Arc::clone(&runner) as Arc<dyn BatchRunner>),
        };
        let svc = EmbeddingService::new(handle, cache_store().await, test_config(true));

        let texts = ["first", "second"];
        let out = svc
            .embed_chunks_for_file(&chunks(&texts), &file("a.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert_eq!(out, expected(&texts));
        assert_eq!(provider.calls(), 1, "fell back to inline");

        let status = svc.batch_status().await;
        assert!(!status.enabled);
        assert!(status.failures >= status.limit);
        assert_eq!(status.last_provider.as_deref(), Some("gemini"));
        assert!(
            status
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("asyncBatchEmbedContent"))
        );
    }

    #[tokio::test]
    async fn breaker_stays_open_after_limit() {
        let provider = Arc::new(MockProvider::default());
        let runner = MockRunner::new(RunnerMode::Fail("openai batch batch_1 failed: 500"));
        let svc = openai_service(
            Arc::clone(&provider),
            Some(Arc::clone(&runner)),
            test_config(true),
        )
        .await;

        for (i, name) in ["a.md", "b.md", "c.md", "d.md"].iter().enumerate() {
            let text = format!("distinct text {i}");
            let out = svc
                .embed_chunks_for_file(&chunks(&[text.as_str()]), &file(name), MemorySource::Memory)
                .await
                .unwrap();
            assert_eq!(out, expected(&[text.as_str()]));
            if i == 0 {
                assert!(svc.is_batch_enabled());
            }
        }
        assert_eq!(runner.calls(), 2);
        assert_eq!(provider.calls(), 4);
        assert!(!svc.is_batch_enabled());
        assert_eq!(svc.index_concurrency(7), 7);
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let runner = MockRunner::new(RunnerMode::FailOnceThenEcho("500 upstream"));
        let svc = openai_service(
            Arc::new(MockProvider::default()),
            Some(runner),
            test_config(true),
        )
        .await;
        svc.embed_chunks_for_file(&chunks(&["x"]), &file("a.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert_eq!(svc.batch_status().await.failures, 1);

        svc.embed_chunks_for_file(&chunks(&["y"]), &file("b.md"), MemorySource::Memory)
            .await
            .unwrap();
        let status = svc.batch_status().await;
        assert!(status.enabled);
        assert_eq!(status.failures, 0);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn late_success_keeps_the_failure_that_disabled_batch() {
        let provider = Arc::new(MockProvider::default());
        let runner = MockRunner::new(RunnerMode::SlowOrFail {
            slow: "slow chunk",
            delay: Duration::from_millis(100),
            error: "gemini batch create failed: asyncBatchEmbedContent not available (404)",
        });
        let handle = ProviderHandle::Gemini {
            provider: Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
            batch: Some(Arc::clone(&runner) as Arc<dyn BatchRunner>),
        };
        let svc = EmbeddingService::new(handle, cache_store().await, test_config(true));

        let slow_chunks = chunks(&["slow chunk"]);
        let fast_chunks = chunks(&["fast chunk"]);
        let slow_file = file("slow.md");
        let fast_file = file("fast.md");
        let (slow, fast) = tokio::join!(
            svc.embed_chunks_for_file(&slow_chunks, &slow_file, MemorySource::Memory),
            svc.embed_chunks_for_file(&fast_chunks, &fast_file, MemorySource::Memory),
        );
        assert_eq!(slow.unwrap(), expected(&["slow chunk"]));
        assert_eq!(fast.unwrap(), expected(&["fast chunk"]));
        assert_eq!(runner.calls(), 2);
        assert_eq!(provider.calls(), 1);

        let status = svc.batch_status().await;
        assert!(!status.enabled);
        assert!(status.failures >= status.limit, "{status:?}");
        assert_eq!(status.last_provider.as_deref(), Some("gemini"));
        assert!(
            status
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("asyncBatchEmbedContent"))
        );
    }

    #[tokio::test]
    async fn configured_index_concurrency_follows_batch_mode() {
        let provider = Arc::new(MockProvider::default());
        let runner = MockRunner::new(RunnerMode::Fail("openai batch batch_1 failed: 500"));
        let config = EmbeddingServiceConfig {
            index_concurrency: 6,
            batch_failure_limit: 1,
            ..test_config(true)
        };
        let svc = openai_service(provider, Some(runner), config).await;
        assert_eq!(svc.configured_index_concurrency(), 2);

        svc.embed_chunks_for_file(&chunks(&["x"]), &file("a.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert!(!svc.is_batch_enabled());
        assert_eq!(svc.configured_index_concurrency(), 6);
    }

    #[tokio::test]
    async fn batch_timeout_is_retried_once() {
        let runner = MockRunner::new(RunnerMode::SlowFirst(1, Duration::from_secs(5)));
        let mut config = test_config(true);
        config.batch.timeout = Duration::from_millis(50);
        let svc = openai_service(
            Arc::new(MockProvider::default()),
            Some(Arc::clone(&runner)),
            config,
        )
        .await;

        let out = svc
            .embed_chunks_for_file(&chunks(&["slow"]), &file("a.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert_eq!(out, expected(&["slow"]));
        assert_eq!(runner.calls(), 2);
        assert_eq!(svc.batch_status().await.failures, 0);
    }

    #[tokio::test]
    async fn repeated_batch_timeout_counts_both_attempts() {
        let provider = Arc::new(MockProvider::default());
        let runner = MockRunner::new(RunnerMode::SlowFirst(usize::MAX, Duration::from_secs(5)));
        let mut config = test_config(true);
        config.batch.timeout = Duration::from_millis(30);
        let svc = openai_service(Arc::clone(&provider), Some(Arc::clone(&runner)), config).await;

        let out = svc
            .embed_chunks_for_file(&chunks(&["stuck"]), &file("a.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert_eq!(out, expected(&["stuck"]));
        assert_eq!(runner.calls(), 2);
        assert_eq!(provider.calls(), 1);
        let status = svc.batch_status().await;
        assert_eq!(status.failures, 2);
        assert!(!status.enabled);
    }

    #[tokio::test]
    async fn batch_disabled_in_config_never_uses_runner() {
        let runner = MockRunner::new(RunnerMode::Echo);
        let svc = openai_service(
            Arc::new(MockProvider::default()),
            Some(Arc::clone(&runner)),
            test_config(false),
        )
        .await;
        svc.embed_chunks_for_file(&chunks(&["x"]), &file("a.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert_eq!(runner.calls(), 0);
        assert!(!svc.is_batch_enabled());
    }

    #[tokio::test]
    async fn local_provider_never_batches() {
        let provider = Arc::new(MockProvider::default());
        let handle = ProviderHandle::Local {
            provider: Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
        };
        let svc = EmbeddingService::new(handle, cache_store().await, test_config(true));
        assert!(!svc.is_batch_enabled());
        svc.embed_chunks_for_file(&chunks(&["x"]), &file("a.md"), MemorySource::Memory)
            .await
            .unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(svc.index_concurrency(3), 3);
    }

    #[tokio::test]
    async fn status_reports_settings() {
        let svc = openai_service(
            Arc::new(MockProvider::default()),
            Some(MockRunner::new(RunnerMode::Echo)),
            test_config(true),
        )
        .await;
        let status = svc.batch_status().await;
        assert_eq!(status, BatchStatus {
            enabled: true,
            failures: 0,
            limit: 2,
            wait: true,
            concurrency: 2,
            poll_interval_ms: 1,
            timeout_ms: 5000,
            last_error: None,
            last_provider: None,
        });
        assert_eq!(svc.index_concurrency(8), 2);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["timeout_ms"], 5000);
    }

    #[tokio::test]
    async fn query_is_not_cached_and_times_out() {
        let provider = Arc::new(MockProvider {
            query_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let config = EmbeddingServiceConfig {
            timeouts: TimeoutPolicy {
                query_remote: Duration::from_millis(20),
                ..TimeoutPolicy::default()
            },
            ..test_config(false)
        };
        let svc = openai_service(provider, None, config).await;
        let err = svc.embed_query("where is it").await.unwrap_err();
        assert!(EmbeddingError::is_timeout(&err));
        assert!(err.to_string().contains("query timed out"));
        assert_eq!(svc.cache_entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn query_passes_through() {
        let svc = openai_service(Arc::new(MockProvider::default()), None, test_config(false)).await;
        assert_eq!(svc.embed_query("abc").await.unwrap(), vector_for("abc"));
    }

    #[tokio::test]
    async fn seed_then_serve_from_seeded_cache() {
        let source = openai_service(Arc::new(MockProvider::default()), None, test_config(false)).await;
        let texts = ["shared one", "shared two", "shared three"];
        source
            .embed_chunks_in_batches(&chunks(&texts))
            .await
            .unwrap();

        let provider = Arc::new(MockProvider::default());
        let target = openai_service(Arc::clone(&provider), None, test_config(false)).await;
        assert_eq!(target.seed_embedding_cache(source.cache()).await.unwrap(), 3);
        assert_eq!(target.cache_entry_count().await.unwrap(), 3);

        let out = target
            .embed_chunks_in_batches(&chunks(&texts))
            .await
            .unwrap();
        assert_eq!(out, expected(&texts));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn prune_uses_configured_cap() {
        let config = EmbeddingServiceConfig {
            cache_max_entries: Some(2),
            ..test_config(false)
        };
        let svc = openai_service(Arc::new(MockProvider::default()), None, config).await;
        svc.embed_chunks_in_batches(&chunks(&["a", "b", "c", "d"]))
            .await
            .unwrap();
        assert_eq!(svc.prune_embedding_cache_if_needed().await.unwrap(), 2);
        assert_eq!(svc.cache_entry_count().await.unwrap(), 2);
        assert_eq!(svc.prune_embedding_cache_if_needed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn from_config_rejects_local_provider() {
        let mut cfg = MoltisConfig::default();
        cfg.memory.provider = moltis_config::EmbeddingProviderKind::Local;
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        assert!(EmbeddingService::from_config(&cfg, pool).await.is_err());
    }
}
