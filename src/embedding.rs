//! Embedding service client.
//!
//! Talks to a local embedding endpoint (`POST {base_url}/api/embed` with
//! `{"model", "input"}` returning `{"embeddings": [[f32, ...]]}`), one call
//! per text. Responsibilities:
//!
//! - local validation (empty text, length ceiling) before any network call
//! - dimension validation of every returned vector
//! - retry with exponential backoff for service/network failures only
//! - batch mode that isolates failures per item
//! - a startup health check that reports degraded state without erroring
//!
//! Also provides the vector blob codec used for SQLite storage:
//! [`vec_to_blob`] / [`blob_to_vec`] (fixed-width little-endian f32).

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Attempts per text. Backoff doubles between attempts: 1s, 2s, then give up.
const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Result of a batch call: `vectors[i]` is `Some` iff text `i` succeeded;
/// `failed` lists the indices that exhausted their retries.
#[derive(Debug, Default)]
pub struct BatchEmbeddings {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failed: Vec<usize>,
}

/// Outcome of the startup health check. Never an error: ingestion runs in
/// degraded mode (chunks stored, embeddings skipped) when unhealthy.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub model: String,
    pub healthy: bool,
    pub message: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    max_text_chars: usize,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::EmbeddingService(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
            max_text_chars: config.max_text_chars,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a single text, retrying service failures with backoff.
    ///
    /// Local validation failures and dimension mismatches are returned
    /// immediately without a retry.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::EmbeddingService("text cannot be empty".to_string()));
        }
        if text.chars().count() > self.max_text_chars {
            return Err(Error::EmbeddingService(format!(
                "text exceeds maximum length of {} characters",
                self.max_text_chars
            )));
        }

        let mut last_err = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = INITIAL_RETRY_DELAY * 2u32.pow(attempt - 1);
                debug!(attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            match self.request_embedding(text).await {
                Ok(vector) => {
                    if vector.len() != self.dimension {
                        return Err(Error::DimensionMismatch {
                            expected: self.dimension,
                            actual: vector.len(),
                        });
                    }
                    return Ok(vector);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "embedding request failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::EmbeddingService("embedding failed after retries".into())))
    }

    /// Embed a batch of texts, one service call per text.
    ///
    /// One text's exhausted retries never abort the batch; its index is
    /// recorded in `failed` and the rest proceed.
    pub async fn embed_batch(&self, texts: &[String]) -> BatchEmbeddings {
        let mut out = BatchEmbeddings {
            vectors: vec![None; texts.len()],
            failed: Vec::new(),
        };

        for (i, text) in texts.iter().enumerate() {
            match self.embed(text).await {
                Ok(vector) => out.vectors[i] = Some(vector),
                Err(e) => {
                    warn!(index = i, error = %e, "failed to embed text in batch");
                    out.failed.push(i);
                }
            }
        }

        out
    }

    /// Issue one test embedding and report service health without erroring.
    pub async fn health_check(&self) -> ServiceHealth {
        match self.embed("test").await {
            Ok(_) => ServiceHealth {
                model: self.model.clone(),
                healthy: true,
                message: format!("embedding service is healthy, model {}", self.model),
            },
            Err(e) => ServiceHealth {
                model: self.model.clone(),
                healthy: false,
                message: format!("embedding service check failed: {}", e),
            },
        }
    }

    async fn request_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .http
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::EmbeddingService(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::EmbeddingService(format!(
                "embedding service returned {}: {}",
                status, body_text
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingService(format!("invalid response: {}", e)))?;

        parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingService("no embeddings in response".to_string()))
    }
}

/// Encode a float vector as a BLOB of little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
