//! Response helpers shared by the HTTP providers and batch runners.

use sha2::{Digest, Sha256};

/// Pass successful responses through; turn anything else into an error that
/// carries the status line and body, so retry classification can see
/// `429`/`5xx`/rate-limit text.
pub(crate) async fn check_status(
    resp: reqwest::Response,
    context: &str,
) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("{context} failed: {status} {}", body.trim())
}

/// Short hash of everything that changes which account/endpoint produces vectors.
pub(crate) fn compute_provider_key(provider: &str, base_url: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b":");
    hasher.update(base_url.trim_end_matches('/').as_bytes());
    hasher.update(b":");
    hasher.update(model.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Split a JSONL body into parsed lines, skipping blanks.
pub(crate) fn parse_jsonl<T: serde::de::DeserializeOwned>(body: &str) -> anyhow::Result<Vec<T>> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| anyhow::anyhow!("invalid batch output line: {e}")))
        .collect()
}

/// Serialize values as newline-delimited JSON.
pub(crate) fn to_jsonl<T: serde::Serialize>(items: &[T]) -> anyhow::Result<String> {
    let mut out = String::new();
    for item in items {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
    }
    Ok(out)
}
