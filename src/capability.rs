//! OpenAI-compatible embed/chat capability.
//!
//! The engine consumes exactly two remote operations — `embed(texts)`
//! and `chat(prompt)` — behind the [`Capability`] trait so tests can
//! inject deterministic stubs. [`HttpCapability`] is the production
//! implementation: `POST {base}/v1/embeddings` and
//! `POST {base}/v1/chat/completions` with a bearer key read from the
//! environment, configurable extra headers, a per-request timeout, and
//! exponential backoff for transient failures.
//!
//! # Retry strategy
//!
//! - HTTP 429 and 5xx → retry with backoff (0.5s, 1s, 2s, … capped at 8s)
//! - other 4xx → fail immediately
//! - network errors → retry
//! - timeouts → [`KbError::CapabilityTimeout`] after retries
//!
//! Also provides the vector utilities used by the store and the
//! semantic ranker: [`vec_to_blob`] / [`blob_to_vec`] (little-endian f32
//! bytes) and [`cosine_similarity`].

use async_trait::async_trait;
use std::time::Duration;

use crate::config::CapabilityConfig;
use crate::error::{KbError, Result};

/// The embed/chat operations the engine consumes.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Identifier of the embedding model; stored alongside every vector
    /// so mismatched models are never compared.
    fn model_embed(&self) -> &str;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Single-turn chat completion.
    async fn chat(&self, prompt: &str) -> Result<String>;
}

/// Production capability backed by an OpenAI-compatible HTTP endpoint.
pub struct HttpCapability {
    config: CapabilityConfig,
    client: reqwest::Client,
}

impl HttpCapability {
    pub fn new(config: &CapabilityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KbError::CapabilityUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    async fn post_json(&self, url: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let api_key = std::env::var(&self.config.api_key_env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let mut last_err: Option<KbError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let millis = 500u64 << (attempt - 1).min(4);
                tokio::time::sleep(Duration::from_millis(millis.min(8000))).await;
            }

            let mut request = self.client.post(url).json(payload);
            if let Some(key) = &api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }
            for (name, value) in &self.config.extra_headers {
                request = request.header(name.as_str(), value.as_str());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json().await.map_err(|e| {
                            KbError::CapabilityUnavailable(format!("invalid response body: {e}"))
                        });
                    }
                    let body = response.text().await.unwrap_or_default();
                    let err =
                        KbError::CapabilityUnavailable(format!("{url} returned {status}: {body}"));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(KbError::CapabilityTimeout(format!("{url}: {e}")));
                    continue;
                }
                Err(e) => {
                    last_err = Some(KbError::CapabilityUnavailable(format!("{url}: {e}")));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| KbError::CapabilityUnavailable("request failed".to_string())))
    }
}

#[async_trait]
impl Capability for HttpCapability {
    fn model_embed(&self) -> &str {
        &self.config.model_embed
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if !self.config.embed_enabled() {
            return Err(KbError::CapabilityUnavailable(
                "capability.base_url/model_embed not configured".to_string(),
            ));
        }
        let url = format!("{}/v1/embeddings", self.config.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.config.model_embed,
            "input": texts,
        });
        let json = self.post_json(&url, &payload).await?;
        parse_embeddings_response(&json)
    }

    async fn chat(&self, prompt: &str) -> Result<String> {
        if !self.config.chat_enabled() {
            return Err(KbError::CapabilityUnavailable(
                "capability.base_url/model_chat not configured".to_string(),
            ));
        }
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let payload = serde_json::json!({
            "model": self.config.model_chat,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });
        let json = self.post_json(&url, &payload).await?;
        json.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                KbError::CapabilityUnavailable("unexpected chat response shape".to_string())
            })
    }
}

/// Parse the embeddings response, re-ordering by the `index` field so
/// vectors always line up with the input batch.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            KbError::CapabilityUnavailable("embeddings response missing data array".to_string())
        })?;

    let mut indexed: Vec<(i64, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item.get("index").and_then(|v| v.as_i64()).unwrap_or(0);
        let vector = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                KbError::CapabilityUnavailable("embeddings response missing embedding".to_string())
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or
/// length-mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_or_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_parse_embeddings_reorders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0, 0.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_embeddings_response(&json).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![2.0, 0.0]);
    }

    #[test]
    fn test_parse_embeddings_rejects_bad_shape() {
        let json = serde_json::json!({"nope": true});
        assert!(parse_embeddings_response(&json).is_err());
    }
}
