//! Gemini `asyncBatchEmbedContent` runner.
//!
//! The input file goes up through the media upload endpoint as
//! `multipart/related`; the job is then polled by name until it reaches a
//! terminal state. Output lines carry the request `key` and the embedding.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    reqwest::StatusCode,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::time::Instant,
    tracing::{debug, info},
};

use crate::{
    batch::{BatchJob, BatchOutcome, BatchRequest, BatchRunner, run_groups, split_requests},
    embeddings::EmbeddingProvider,
    embeddings_gemini::{
        GeminiContent, GeminiEmbedding, GeminiEmbeddingProvider, TASK_RETRIEVAL_DOCUMENT,
    },
    http::{check_status, parse_jsonl, to_jsonl},
};

pub const GEMINI_BATCH_MAX_REQUESTS: usize = 50_000;
const UPLOAD_BOUNDARY: &str = "moltis-memory-batch-boundary";

pub struct GeminiBatchRunner {
    provider: Arc<GeminiEmbeddingProvider>,
    max_requests: usize,
}

#[derive(Serialize)]
struct InputLine<'a> {
    key: &'a str,
    request: InputRequest,
}

#[derive(Serialize)]
struct InputRequest {
    content: GeminiContent,
    task_type: &'static str,
}

#[derive(Deserialize)]
struct OutputLine {
    key: String,
    #[serde(default)]
    response: Option<OutputResponse>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct OutputResponse {
    embedding: GeminiEmbedding,
}

/// The parts of a batch resource we care about. Gemini wraps it either as a
/// bare batch or as a long-running operation with the batch in `metadata` /
/// `response`, so fields are picked out of raw JSON.
#[derive(Debug)]
struct BatchState {
    name: String,
    state: String,
    responses_file: Option<String>,
    error: Option<String>,
}

impl BatchState {
    fn from_json(value: &Value) -> anyhow::Result<Self> {
        let inner = ["response", "metadata"]
            .iter()
            .filter_map(|k| value.get(*k))
            .find(|v| v.get("state").is_some() || v.get("output").is_some())
            .unwrap_or(value);
        let name = value
            .get("name")
            .or_else(|| inner.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("gemini batch response has no name"))?
            .to_string();
        let state = inner
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or(if value.get("done").and_then(Value::as_bool) == Some(true) {
                "SUCCEEDED"
            } else {
                "PENDING"
            })
            .to_string();
        let responses_file = inner
            .pointer("/output/responsesFile")
            .and_then(Value::as_str)
            .map(str::to_string);
        let error = value
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            name,
            state,
            responses_file,
            error,
        })
    }

    fn succeeded(&self) -> bool {
        self.state.ends_with("SUCCEEDED")
    }

    fn terminal_failure(&self) -> bool {
        self.error.is_some()
            || ["FAILED", "CANCELLED", "EXPIRED"]
                .iter()
                .any(|s| self.state.ends_with(s))
    }
}

impl GeminiBatchRunner {
    pub fn new(provider: Arc<GeminiEmbeddingProvider>) -> Self {
        Self {
            provider,
            max_requests: GEMINI_BATCH_MAX_REQUESTS,
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
        let lines: Vec<InputLine<'_>> = requests
            .iter()
            .map(|r| InputLine {
                key: &r.custom_id,
                request: InputRequest {
                    content: GeminiContent::text(r.payload.text()),
                    task_type: TASK_RETRIEVAL_DOCUMENT,
                },
            })
            .collect();
        let jsonl = to_jsonl(&lines)?;
        let metadata = serde_json::json!({
            "file": {"displayName": "memory-embeddings", "mimeType": "application/jsonl"}
        });
        let body = format!(
            "--{UPLOAD_BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{UPLOAD_BOUNDARY}\r\nContent-Type: application/jsonl\r\n\r\n{jsonl}\r\n\
             --{UPLOAD_BOUNDARY}--\r\n"
        );
        let resp = self
            .provider
            .client()
            .post(self.url("/upload/v1beta/files?uploadType=multipart"))
            .header("x-goog-api-key", self.provider.api_key())
            .header(
                "content-type",
                format!("multipart/related; boundary={UPLOAD_BOUNDARY}"),
            )
            .body(body)
            .send()
            .await?;
        let uploaded: Value = check_status(resp, "gemini batch file upload")
            .await?
            .json()
            .await?;
        uploaded
            .pointer("/file/name")
            .or_else(|| uploaded.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("gemini batch file upload returned no file name"))
    }

    async fn create(&self, file_name: &str) -> anyhow::Result<BatchState> {
        let model = self.provider.model_name();
        let resp = self
            .provider
            .client()
            .post(self.url(&format!(
                "/v1beta/models/{model}:asyncBatchEmbedContent"
            )))
            .header("x-goog-api-key", self.provider.api_key())
            .json(&serde_json::json!({
                "batch": {
                    "displayName": "memory-embeddings",
                    "inputConfig": {"fileName": file_name}
                }
            }))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            anyhow::bail!(
                "gemini batch create failed: asyncBatchEmbedContent not available for model {model} (404)"
            );
        }
        let created: Value = check_status(resp, "gemini batch create")
            .await?
            .json()
            .await?;
        BatchState::from_json(&created)
    }

    async fn fetch(&self, name: &str) -> anyhow::Result<BatchState> {
        let resp = self
            .provider
            .client()
            .get(self.url(&format!("/v1beta/{name}")))
            .header("x-goog-api-key", self.provider.api_key())
            .send()
            .await?;
        let value: Value = check_status(resp, "gemini batch status")
            .await?
            .json()
            .await?;
        BatchState::from_json(&value)
    }

    async fn download(&self, file: &str) -> anyhow::Result<String> {
        let resp = self
            .provider
            .client()
            .get(self.url(&format!("/download/v1beta/{file}:download?alt=media")))
            .header("x-goog-api-key", self.provider.api_key())
            .send()
            .await?;
        Ok(check_status(resp, "gemini batch download")
            .await?
            .text()
            .await?)
    }

    async fn wait_for(
        &self,
        mut batch: BatchState,
        poll_interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<BatchState> {
        let deadline = Instant::now() + timeout;
        loop {
            if batch.succeeded() {
                return Ok(batch);
            }
            if batch.terminal_failure() {
                anyhow::bail!(
                    "gemini batch {} {}: {}",
                    batch.name,
                    batch.state,
                    batch.error.as_deref().unwrap_or("no error detail")
                );
            }
            debug!(batch = %batch.name, state = %batch.state, "gemini batch pending");
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "gemini batch {} timed out after {}ms",
                    batch.name,
                    timeout.as_millis()
                );
            }
            tokio::time::sleep(poll_interval).await;
            batch = self.fetch(&batch.name).await?;
        }
    }

    async fn run_group(
        &self,
        requests: Vec<BatchRequest>,
        job: &BatchJob,
    ) -> anyhow::Result<HashMap<String, Vec<f32>>> {
        let file_name = self.upload(&requests).await?;
        let batch = self.create(&file_name).await?;
        info!(
            batch = %batch.name,
            requests = requests.len(),
            state = %batch.state,
            "gemini embedding batch created"
        );
        if !batch.succeeded() && !job.wait {
            anyhow::bail!(
                "gemini batch {} submitted but not finished and waiting is disabled",
                batch.name
            );
        }
        let batch = self.wait_for(batch, job.poll_interval, job.timeout).await?;
        let file = batch
            .responses_file
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("gemini batch {} has no responses file", batch.name))?;
        let body = self.download(file).await?;
        if job.debug {
            debug!(batch = %batch.name, bytes = body.len(), "gemini batch output downloaded");
        }
        parse_output(&batch.name, &body)
    }
}

fn parse_output(batch: &str, body: &str) -> anyhow::Result<HashMap<String, Vec<f32>>> {
    let mut out = HashMap::new();
    let mut errors = Vec::new();
    for line in parse_jsonl::<OutputLine>(body)? {
        match (line.response, line.error) {
            (_, Some(err)) => errors.push(format!(
                "{}: {}",
                line.key,
                err.get("message").and_then(Value::as_str).unwrap_or("error")
            )),
            (Some(resp), None) if !resp.embedding.values.is_empty() => {
                out.insert(line.key, resp.embedding.values);
            },
            _ => errors.push(format!("{}: missing embedding", line.key)),
        }
    }
    if let Some(first) = errors.first() {
        anyhow::bail!(
            "gemini batch {batch} failed for {} requests: {first}",
            errors.len()
        );
    }
    Ok(out)
}

#[async_trait]
impl BatchRunner for GeminiBatchRunner {
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

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            batch::{BatchFlavor, BatchOrchestrator, BatchSettings},
            breaker::is_batch_unsupported_error,
            chunk::{Chunk, FileEntry, MemorySource},
        },
        secrecy::Secret,
        wiremock::{
            Mock, MockServer, ResponseTemplate,
            matchers::{header, method, path},
        },
    };

    fn provider(server: &MockServer) -> Arc<GeminiEmbeddingProvider> {
        Arc::new(
            GeminiEmbeddingProvider::new(Secret::new("g-key".into())).with_base_url(server.uri()),
        )
    }

    fn requests(provider: Arc<GeminiEmbeddingProvider>, n: usize) -> Vec<BatchRequest> {
        let chunks: Vec<Chunk> = (0..n)
            .map(|i| Chunk::new(format!("chunk {i}"), i, i))
            .collect();
        let pairs: Vec<(usize, &Chunk)> = chunks.iter().enumerate().collect();
        let file = FileEntry {
            path: "memory/a.md".into(),
            abs_path: "/tmp/memory/a.md".into(),
            mtime_ms: 0,
            size: 0,
            hash: "h".into(),
        };
        BatchOrchestrator::new(
            BatchFlavor::Gemini,
            Arc::new(GeminiBatchRunner::new(provider)),
            BatchSettings::default(),
        )
        .build_requests(&pairs, &file, MemorySource::Memory)
    }

    fn job(requests: Vec<BatchRequest>) -> BatchJob {
        BatchJob {
            requests,
            wait: true,
            concurrency: 1,
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
            debug: true,
        }
    }

    async fn mount_upload(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/upload/v1beta/files"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "file": {"name": "files/input-1"}
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn batch_state_reads_operation_wrappers() {
        let op = serde_json::json!({
            "name": "batches/abc",
            "metadata": {
                "state": "BATCH_STATE_SUCCEEDED",
                "output": {"responsesFile": "files/out-1"}
            }
        });
        let state = BatchState::from_json(&op).unwrap();
        assert_eq!(state.name, "batches/abc");
        assert!(state.succeeded());
        assert_eq!(state.responses_file.as_deref(), Some("files/out-1"));

        let failed = BatchState::from_json(&serde_json::json!({
            "name": "batches/x", "state": "JOB_STATE_FAILED"
        }))
        .unwrap();
        assert!(failed.terminal_failure());
    }

    #[tokio::test]
    async fn missing_endpoint_yields_unsupported_message() {
        let server = MockServer::start().await;
        mount_upload(&server).await;
        Mock::given(method("POST"))
            .and(path(
                "/v1beta/models/gemini-embedding-001:asyncBatchEmbedContent",
            ))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let p = provider(&server);
        let reqs = requests(Arc::clone(&p), 1);
        let err = GeminiBatchRunner::new(p)
            .run(job(reqs))
            .await
            .unwrap_err()
            .to_string();
        assert!(is_batch_unsupported_error(&err), "{err}");
    }

    #[tokio::test]
    async fn polls_and_maps_keys() {
        let server = MockServer::start().await;
        mount_upload(&server).await;
        Mock::given(method("POST"))
            .and(path(
                "/v1beta/models/gemini-embedding-001:asyncBatchEmbedContent",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "batches/b1",
                "metadata": {"state": "BATCH_STATE_PENDING"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1beta/batches/b1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "batches/b1",
                "metadata": {
                    "state": "BATCH_STATE_SUCCEEDED",
                    "output": {"responsesFile": "files/out-1"}
                }
            })))
            .mount(&server)
            .await;

        let p = provider(&server);
        let reqs = requests(Arc::clone(&p), 2);
        let output = reqs
            .iter()
            .enumerate()
            .map(|(i, r)| {
                serde_json::json!({
                    "key": r.custom_id,
                    "response": {"embedding": {"values": [i as f32, 1.0]}}
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n");
        Mock::given(method("GET"))
            .and(path("/download/v1beta/files/out-1:download"))
            .respond_with(ResponseTemplate::new(200).set_body_string(output))
            .mount(&server)
            .await;

        let out = GeminiBatchRunner::new(p).run(job(reqs.clone())).await.unwrap();
        let BatchOutcome::Reconciled(map) = out else {
            panic!("expected reconciled outcome");
        };
        assert_eq!(map[&reqs[1].custom_id], vec![1.0, 1.0]);

        let uploaded = server.received_requests().await.unwrap_or_default();
        let body = String::from_utf8_lossy(&uploaded[0].body).to_string();
        assert!(body.contains("\"task_type\":\"RETRIEVAL_DOCUMENT\""), "{body}");
        assert!(body.contains(&reqs[0].custom_id));
    }

    #[test]
    fn failed_lines_fail_the_batch() {
        let err = parse_output(
            "batches/b1",
            "{\"key\":\"a\",\"error\":{\"message\":\"quota\"}}\n{\"key\":\"b\",\"response\":{\"embedding\":{\"values\":[1.0]}}}",
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("quota"), "{err}");
        assert!(err.contains("1 requests"), "{err}");
    }
}
