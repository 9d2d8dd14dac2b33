//! OpenAI `/v1/batches` runner: upload a JSONL input file, create the batch,
//! poll until it settles, then download and parse the output file.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    reqwest::multipart::{Form, Part},
    serde::Deserialize,
    tokio::time::Instant,
    tracing::{debug, info, warn},
};

use crate::{
    batch::{BatchJob, BatchOutcome, BatchRequest, BatchRunner, run_groups, split_requests},
    embeddings_openai::OpenAiEmbeddingProvider,
    http::{check_status, parse_jsonl, to_jsonl},
};

/// Provider cap on requests per batch input file.
pub const OPENAI_BATCH_MAX_REQUESTS: usize = 50_000;
const COMPLETION_WINDOW: &str = "24h";
const EMBEDDINGS_ENDPOINT: &str = "/v1/embeddings";

pub struct OpenAiBatchRunner {
    provider: Arc<OpenAiEmbeddingProvider>,
    max_requests: usize,
}

impl OpenAiBatchRunner {
    pub fn new(provider: Arc<OpenAiEmbeddingProvider>) -> Self {
        Self {
            provider,
            max_requests: OPENAI_BATCH_MAX_REQUESTS,
        }
    }

    #[must_use]
    pub fn with_max_requests(mut self, max: usize) -> Self {
        self.max_requests = max.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.provider.base_url())
    }

    async fn upload(&self, requests: &[BatchRequest]) -> anyhow::Result<String> {
        let body = to_jsonl(requests)?;
        let file = Part::bytes(body.into_bytes())
            .file_name("memory-embeddings.jsonl")
            .mime_str("application/jsonl")?;
        let form = Form::new().text("purpose", "batch").part("file", file);
        let resp = self
            .provider
            .client()
            .post(self.url("/v1/files"))
            .bearer_auth(self.provider.api_key())
            .multipart(form)
            .send()
            .await?;
        let file = check_status(resp, "openai batch file upload")
            .await?
            .json::<FileObject>()
            .await?;
        Ok(file.id)
    }

    async fn create(&self, input_file_id: &str) -> anyhow::Result<BatchObject> {
        let resp = self
            .provider
            .client()
            .post(self.url("/v1/batches"))
            .bearer_auth(self.provider.api_key())
            .json(&serde_json::json!({
                "input_file_id": input_file_id,
                "endpoint": EMBEDDINGS_ENDPOINT,
                "completion_window": COMPLETION_WINDOW,
                "metadata": { "source": "moltis-memory" },
            }))
            .send()
            .await?;
        Ok(check_status(resp, "openai batch create")
            .await?
            .json::<BatchObject>()
            .await?)
    }

    async fn fetch(&self, batch_id: &str) -> anyhow::Result<BatchObject> {
        let resp = self
            .provider
            .client()
            .get(self.url(&format!("/v1/batches/{batch_id}")))
            .bearer_auth(self.provider.api_key())
            .send()
            .await?;
        Ok(check_status(resp, "openai batch status")
            .await?
            .json::<BatchObject>()
            .await?)
    }

    async fn download(&self, file_id: &str) -> anyhow::Result<String> {
        let resp = self
            .provider
            .client()
            .get(self.url(&format!("/v1/files/{file_id}/content")))
            .bearer_auth(self.provider.api_key())
            .send()
            .await?;
        Ok(check_status(resp, "openai batch file content")
            .await?
            .text()
            .await?)
    }

    /// Poll until `completed`, failing on a terminal state or the deadline.
    async fn wait_for(
        &self,
        mut batch: BatchObject,
        poll_interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<BatchObject> {
        let deadline = Instant::now() + timeout;
        loop {
            match batch.status.as_str() {
                "completed" => return Ok(batch),
                "failed" | "expired" | "cancelled" | "cancelling" => {
                    let detail = match batch.error_file_id.as_deref() {
                        Some(id) => match self.download(id).await {
                            Ok(body) => body,
                            Err(e) => {
                                warn!(
                                    batch = %batch.id,
                                    error = %e,
                                    "failed to download openai batch error file"
                                );
                                batch.error_summary()
                            },
                        },
                        None => batch.error_summary(),
                    };
                    anyhow::bail!(
                        "openai batch {} {}: {}",
                        batch.id,
                        batch.status,
                        detail.trim()
                    );
                },
                status => debug!(batch = %batch.id, status, "openai batch pending"),
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "openai batch {} timed out after {}ms",
                    batch.id,
                    timeout.as_millis()
                );
            }
            tokio::time::sleep(poll_interval).await;
            batch = self.fetch(&batch.id).await?;
        }
    }

    async fn run_group(
        &self,
        requests: Vec<BatchRequest>,
        job: &BatchJob,
    ) -> anyhow::Result<HashMap<String, Vec<f32>>> {
        let input_file_id = self.upload(&requests).await?;
        let batch = self.create(&input_file_id).await?;
        info!(
            batch = %batch.id,
            requests = requests.len(),
            status = %batch.status,
            "openai embedding batch created"
        );
        if batch.status != "completed" && !job.wait {
            anyhow::bail!(
                "openai batch {} submitted but not finished and waiting is disabled",
                batch.id
            );
        }
        let mut batch = self.wait_for(batch, job.poll_interval, job.timeout).await?;
        if batch.output_file_id.is_none() {
            debug!(
                batch = %batch.id,
                "completed openai batch has no output file yet, refetching"
            );
            batch = self.fetch(&batch.id).await?;
        }
        let output_file_id = batch
            .output_file_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("openai batch {} completed without output file", batch.id))?;
        let body = self.download(output_file_id).await?;
        if job.debug {
            debug!(batch = %batch.id, bytes = body.len(), "openai batch output downloaded");
        }
        parse_output(&batch.id, &body)
    }
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    errors: Option<BatchErrors>,
}

#[derive(Debug, Deserialize)]
struct BatchErrors {
    #[serde(default)]
    data: Vec<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl BatchObject {
    fn error_summary(&self) -> String {
        self.errors
            .as_ref()
            .and_then(|e| e.data.iter().find_map(|d| d.message.clone()))
            .unwrap_or_else(|| "no error detail".into())
    }
}

#[derive(Deserialize)]
struct OutputLine {
    custom_id: String,
    #[serde(default)]
    response: Option<OutputResponse>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct OutputResponse {
    status_code: u16,
    #[serde(default)]
    body: Option<OutputBody>,
}

#[derive(Deserialize)]
struct OutputBody {
    #[serde(default)]
    data: Vec<OutputData>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct OutputData {
    embedding: Vec<f32>,
}

fn parse_output(batch_id: &str, body: &str) -> anyhow::Result<HashMap<String, Vec<f32>>> {
    let mut out = HashMap::new();
    let mut errors = Vec::new();
    for line in parse_jsonl::<OutputLine>(body)? {
        if let Some(err) = line.error {
            errors.push(format!(
                "{}: {}",
                line.custom_id,
                err.message.unwrap_or_default()
            ));
            continue;
        }
        let Some(resp) = line.response else {
            errors.push(format!("{}: missing response", line.custom_id));
            continue;
        };
        let mut body = resp.body.unwrap_or(OutputBody {
            data: Vec::new(),
            error: None,
        });
        if resp.status_code >= 400 {
            let msg = body.error.and_then(|e| e.message).unwrap_or_default();
            errors.push(format!("{}: {} {msg}", line.custom_id, resp.status_code));
            continue;
        }
        match body.data.pop() {
            Some(d) if body.data.is_empty() => {
                out.insert(line.custom_id, d.embedding);
            },
            _ => errors.push(format!("{}: expected one embedding", line.custom_id)),
        }
    }
    if let Some(first) = errors.first() {
        anyhow::bail!(
            "openai batch {batch_id} failed for {} requests: {first}",
            errors.len()
        );
    }
    Ok(out)
}

#[async_trait]
impl BatchRunner for OpenAiBatchRunner {
    async fn run(&self, job: BatchJob) -> anyhow::Result<BatchOutcome> {
        if job.requests.is_empty() {
            return Ok(BatchOutcome::Reconciled(HashMap::new()));
        }
        let groups = split_requests(job.requests.clone(), self.max_requests);
        let job = &job;
        let merged = run_groups(groups, job.concurrency, |group| self.run_group(group, job)).await?;
        Ok(BatchOutcome::Reconciled(merged))
    }
}
