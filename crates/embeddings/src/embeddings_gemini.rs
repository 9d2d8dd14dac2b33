/// Gemini embeddings provider (`embedContent` / `batchEmbedContents`).
use async_trait::async_trait;
use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::{
    embeddings::{EmbeddingProvider, ensure_vector_count},
    http::{check_status, compute_provider_key},
};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_EMBEDDING_MODEL: &str = "gemini-embedding-001";

pub(crate) const TASK_RETRIEVAL_QUERY: &str = "RETRIEVAL_QUERY";
pub(crate) const TASK_RETRIEVAL_DOCUMENT: &str = "RETRIEVAL_DOCUMENT";

pub struct GeminiEmbeddingProvider {
    client: reqwest::Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
    dims: usize,
    provider_key: String,
}

impl std::fmt::Debug for GeminiEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiEmbeddingProvider")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

fn default_dims(model: &str) -> usize {
    match model {
        "text-embedding-004" | "embedding-001" => 768,
        _ => 3072,
    }
}

/// Accept both `gemini-embedding-001` and `models/gemini-embedding-001`.
fn normalize_model(model: &str) -> String {
    model.strip_prefix("models/").unwrap_or(model).to_string()
}

impl GeminiEmbeddingProvider {
    pub fn new(api_key: Secret<String>) -> Self {
        let base_url = DEFAULT_GEMINI_BASE_URL.to_string();
        let model = DEFAULT_GEMINI_EMBEDDING_MODEL.to_string();
        Self {
            client: reqwest::Client::new(),
            api_key,
            provider_key: compute_provider_key("gemini", &base_url, &model),
            dims: default_dims(&model),
            base_url,
            model,
        }
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = normalize_model(&model);
        self.dims = default_dims(&self.model);
        self.provider_key = compute_provider_key("gemini", &self.base_url, &self.model);
        self
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self.provider_key = compute_provider_key("gemini", &self.base_url, &self.model);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    fn model_url(&self, action: &str) -> String {
        format!("{}/v1beta/models/{}:{action}", self.base_url, self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeminiContent {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeminiPart {
    pub text: String,
}

impl GeminiContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![GeminiPart { text: text.into() }],
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    content: GeminiContent,
    task_type: &'a str,
}

#[derive(Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedContentRequest<'a>>,
}

#[derive(Deserialize)]
pub(crate) struct GeminiEmbedding {
    #[serde(default)]
    pub values: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedContentResponse {
    embedding: GeminiEmbedding,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let req = EmbedContentRequest {
            model: None,
            content: GeminiContent::text(text),
            task_type: TASK_RETRIEVAL_QUERY,
        };
        let resp = self
            .client
            .post(self.model_url("embedContent"))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&req)
            .send()
            .await?;
        let resp = check_status(resp, "gemini embedContent")
            .await?
            .json::<EmbedContentResponse>()
            .await?;
        Ok(resp.embedding.values)
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = format!("models/{}", self.model);
        let req = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|t| EmbedContentRequest {
                    model: Some(model.clone()),
                    content: GeminiContent::text(t.as_str()),
                    task_type: TASK_RETRIEVAL_DOCUMENT,
                })
                .collect(),
        };
        let resp = self
            .client
            .post(self.model_url("batchEmbedContents"))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&req)
            .send()
            .await?;
        let resp = check_status(resp, "gemini batchEmbedContents")
            .await?
            .json::<BatchEmbedResponse>()
            .await?;
        ensure_vector_count(texts.len(), resp.embeddings.len())?;
        Ok(resp.embeddings.into_iter().map(|e| e.values).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }
}
