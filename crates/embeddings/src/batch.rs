//! Provider batch APIs: request building, submission, and reconciliation of
//! results back to chunk positions by deterministic custom IDs.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    futures::{StreamExt, TryStreamExt, stream},
    moltis_config::BatchEmbeddingConfig,
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    chunk::{Chunk, FileEntry, MemorySource, hash_text},
    embeddings_gemini::{GeminiContent, TASK_RETRIEVAL_DOCUMENT},
    error::EmbeddingError,
    timeout::{timeout_message, with_timeout},
};

/// One embedding request inside a provider batch job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRequest {
    pub custom_id: String,
    #[serde(flatten)]
    pub payload: BatchPayload,
}

/// Provider-specific request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchPayload {
    /// A line of an OpenAI `/v1/batches` input file.
    OpenAi {
        method: &'static str,
        url: &'static str,
        body: OpenAiBatchBody,
    },
    /// A Gemini `asyncBatchEmbedContent` request.
    Gemini {
        content: GeminiContent,
        #[serde(rename = "taskType")]
        task_type: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenAiBatchBody {
    pub model: String,
    pub input: String,
}

impl BatchPayload {
    /// The text being embedded.
    pub fn text(&self) -> &str {
        match self {
            Self::OpenAi { body, .. } => &body.input,
            Self::Gemini { content, .. } => content
                .parts
                .first()
                .map(|p| p.text.as_str())
                .unwrap_or_default(),
        }
    }
}

/// Which batch API a request set targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchFlavor {
    OpenAi { model: String },
    Gemini,
}

impl BatchFlavor {
    pub fn provider_id(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Gemini => "gemini",
        }
    }

    fn payload(&self, text: &str) -> BatchPayload {
        match self {
            Self::OpenAi { model } => BatchPayload::OpenAi {
                method: "POST",
                url: "/v1/embeddings",
                body: OpenAiBatchBody {
                    model: model.clone(),
                    input: text.to_string(),
                },
            },
            Self::Gemini => BatchPayload::Gemini {
                content: GeminiContent::text(text),
                task_type: TASK_RETRIEVAL_DOCUMENT,
            },
        }
    }
}

/// Everything a runner needs to execute one batch submission.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub requests: Vec<BatchRequest>,
    /// Block until the provider finishes the job.
    pub wait: bool,
    /// How many request groups may be in flight at once.
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub debug: bool,
}

/// What a runner hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Vectors keyed by custom ID; the orchestrator maps them to positions.
    Reconciled(HashMap<String, Vec<f32>>),
    /// Vectors already in request order; no custom-ID reconciliation needed.
    AlreadyOrdered(Vec<Vec<f32>>),
}

/// Executes batch jobs against one provider's batch API.
#[async_trait]
pub trait BatchRunner: Send + Sync {
    async fn run(&self, job: BatchJob) -> anyhow::Result<BatchOutcome>;
}

/// Stable ID for a chunk inside a batch, so resubmissions reconcile identically.
pub fn batch_custom_id(
    source: MemorySource,
    path: &str,
    start_line: usize,
    end_line: usize,
    chunk_hash: &str,
    index: usize,
) -> String {
    hash_text(&format!(
        "{}:{path}:{start_line}:{end_line}:{chunk_hash}:{index}",
        source.as_str()
    ))
}

/// Submission knobs resolved from `[memory.batch]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub debug: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from(&BatchEmbeddingConfig::default())
    }
}

impl From<&BatchEmbeddingConfig> for BatchSettings {
    fn from(cfg: &BatchEmbeddingConfig) -> Self {
        Self {
            wait: cfg.wait,
            concurrency: cfg.concurrency.max(1),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            timeout: Duration::from_secs(cfg.timeout_minutes.saturating_mul(60)),
            debug: cfg.debug,
        }
    }
}

/// Turns cache-miss chunks into a provider batch job and reconciles the
/// output back to chunk positions.
pub struct BatchOrchestrator {
    flavor: BatchFlavor,
    runner: Arc<dyn BatchRunner>,
    settings: BatchSettings,
}

impl BatchOrchestrator {
    pub fn new(flavor: BatchFlavor, runner: Arc<dyn BatchRunner>, settings: BatchSettings) -> Self {
        Self {
            flavor,
            runner,
            settings,
        }
    }

    pub fn provider_id(&self) -> &'static str {
        self.flavor.provider_id()
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// One request per chunk. `position` is the chunk's index in the file's
    /// chunk list and is part of the custom ID.
    pub fn build_requests(
        &self,
        chunks: &[(usize, &Chunk)],
        file: &FileEntry,
        source: MemorySource,
    ) -> Vec<BatchRequest> {
        chunks
            .iter()
            .map(|(position, chunk)| BatchRequest {
                custom_id: batch_custom_id(
                    source,
                    &file.path,
                    chunk.start_line,
                    chunk.end_line,
                    &chunk.hash,
                    *position,
                ),
                payload: self.flavor.payload(&chunk.text),
            })
            .collect()
    }

    /// Embed `chunks` through the batch API. Returns one vector per chunk, in
    /// the order given. Any error means the batch attempt failed as a whole.
    pub async fn run(
        &self,
        chunks: &[(usize, &Chunk)],
        file: &FileEntry,
        source: MemorySource,
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        let requests = self.build_requests(chunks, file, source);
        let ids: Vec<String> = requests.iter().map(|r| r.custom_id.clone()).collect();
        debug!(
            provider = self.provider_id(),
            path = %file.path,
            requests = requests.len(),
            "submitting embedding batch"
        );
        let outcome = self.submit_with_timeout_retry(requests).await?;
        reconcile(&ids, outcome)
    }

    async fn submit(&self, requests: Vec<BatchRequest>) -> anyhow::Result<BatchOutcome> {
        let job = BatchJob {
            requests,
            wait: self.settings.wait,
            concurrency: self.settings.concurrency,
            poll_interval: self.settings.poll_interval,
            timeout: self.settings.timeout,
            debug: self.settings.debug,
        };
        let timeout = self.settings.timeout;
        with_timeout(
            self.runner.run(job),
            timeout,
            &timeout_message(&format!("{} batch", self.provider_id()), timeout),
        )
        .await
    }

    /// A timeout gets exactly one more full submission; anything else fails fast.
    async fn submit_with_timeout_retry(
        &self,
        requests: Vec<BatchRequest>,
    ) -> anyhow::Result<BatchOutcome> {
        match self.submit(requests.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if is_batch_timeout(&err) => {
                warn!(
                    provider = self.provider_id(),
                    error = %err,
                    "embedding batch timed out, retrying once"
                );
                self.submit(requests).await.map_err(|retry_err| {
                    EmbeddingError::BatchFailed {
                        message: format!("{retry_err:#}"),
                        attempts: 2,
                    }
                    .into()
                })
            },
            Err(err) => Err(err),
        }
    }
}

/// Our own deadline, or a runner's poll deadline ("... timed out after Nms").
/// HTTP statuses such as "504 Gateway Timeout" are not batch timeouts.
fn is_batch_timeout(err: &anyhow::Error) -> bool {
    EmbeddingError::is_timeout(err) || format!("{err:#}").contains("timed out after")
}

/// Map a runner outcome onto `ids` order. Missing vectors fail the batch.
fn reconcile(ids: &[String], outcome: BatchOutcome) -> anyhow::Result<Vec<Vec<f32>>> {
    match outcome {
        BatchOutcome::AlreadyOrdered(vectors) => {
            if vectors.len() != ids.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: ids.len(),
                    got: vectors.len(),
                }
                .into());
            }
            Ok(vectors)
        },
        BatchOutcome::Reconciled(mut by_id) => {
            let mut out = Vec::with_capacity(ids.len());
            let mut missing = 0;
            for id in ids {
                match by_id.remove(id) {
                    Some(v) => out.push(v),
                    None => missing += 1,
                }
            }
            if !by_id.is_empty() {
                debug!(unknown = by_id.len(), "ignoring batch results with unknown custom ids");
            }
            if missing > 0 {
                return Err(EmbeddingError::BatchIncomplete {
                    missing,
                    expected: ids.len(),
                }
                .into());
            }
            Ok(out)
        },
    }
}

/// Split requests into provider-sized groups.
pub(crate) fn split_requests(requests: Vec<BatchRequest>, max: usize) -> Vec<Vec<BatchRequest>> {
    let max = max.max(1);
    let mut groups = Vec::with_capacity(requests.len().div_ceil(max));
    let mut iter = requests.into_iter().peekable();
    while iter.peek().is_some() {
        groups.push(iter.by_ref().take(max).collect());
    }
    groups
}

/// Run one future per group with at most `concurrency` in flight, merging the
/// per-group `custom_id → vector` maps. The first error aborts the rest.
pub(crate) async fn run_groups<F, Fut>(
    groups: Vec<Vec<BatchRequest>>,
    concurrency: usize,
    run_group: F,
) -> anyhow::Result<HashMap<String, Vec<f32>>>
where
    F: Fn(Vec<BatchRequest>) -> Fut,
    Fut: Future<Output = anyhow::Result<HashMap<String, Vec<f32>>>>,
{
    stream::iter(groups.into_iter().map(run_group))
        .buffer_unordered(concurrency.max(1))
        .try_fold(HashMap::new(), |mut acc, part| async move {
            acc.extend(part);
            Ok(acc)
        })
        .await
}
