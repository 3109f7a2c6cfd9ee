//! Embedding service client.
//!
//! Talks to an Ollama-style endpoint: `POST /api/embed` with
//! `{model, input: [...]}` returning `{embeddings: [[f32, ...], ...]}`.
//! Vectors are stored as little-endian packed f32 BLOBs.

use crate::config::EmbeddingConfig;
use crate::error::{FilingIndexError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Retries per remote batch call.
const BATCH_RETRIES: u32 = 3;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Batched embedding client with a fixed output dimension.
#[derive(Clone)]
pub struct EmbeddingClient {
    client: Client,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// The configured output dimension.
    pub fn dim(&self) -> usize {
        self.config.dim
    }

    fn embed_endpoint(&self) -> String {
        format!("{}/api/embed", self.config.url.trim_end_matches('/'))
    }

    /// Embed a list of texts, batching remote calls.
    ///
    /// An empty input returns an empty output without a remote call.
    /// A dimension mismatch against the configured dimension is fatal.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let embeddings = self.embed_batch(batch).await?;
            all.extend(embeddings);
        }
        Ok(all)
    }

    /// Embed a single text (query embedding).
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| FilingIndexError::Embedding("Empty embedding response".to_string()))
    }

    /// Embed one batch with bounded retries and backoff.
    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;

        for attempt in 0..BATCH_RETRIES {
            match self.embed_batch_once(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e @ FilingIndexError::EmbeddingDimension { .. }) => return Err(e),
                Err(e) => {
                    warn!("Embedding batch attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(500 * (1 << attempt))).await;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| FilingIndexError::Embedding("retries exhausted".to_string())))
    }

    async fn embed_batch_once(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.config.model,
            input: batch,
        };

        let response = self
            .client
            .post(self.embed_endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| FilingIndexError::Embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FilingIndexError::Embedding(format!(
                "Request failed ({}): {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| FilingIndexError::Embedding(format!("Malformed response: {}", e)))?;

        if parsed.embeddings.len() != batch.len() {
            return Err(FilingIndexError::Embedding(format!(
                "Expected {} embeddings, got {}",
                batch.len(),
                parsed.embeddings.len()
            )));
        }

        for vector in &parsed.embeddings {
            if vector.len() != self.config.dim {
                return Err(FilingIndexError::EmbeddingDimension {
                    expected: self.config.dim,
                    actual: vector.len(),
                });
            }
        }

        Ok(parsed.embeddings)
    }

    /// Check that the service is reachable and the model is available.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/tags", self.config.url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<TagsResponse>().await {
                Ok(tags) => tags.models.iter().any(|m| m.name.contains(&self.config.model)),
                Err(_) => false,
            },
            _ => false,
        }
    }
}

/// Pack a vector as a little-endian f32 BLOB.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Unpack a little-endian f32 BLOB into a vector.
pub fn blob_to_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(FilingIndexError::Serialization(format!(
            "Embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_length_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_blob_roundtrip() {
        let vector = vec![0.5f32, -1.25, 3.75, 0.0];
        let blob = vector_to_blob(&vector);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vector(&blob).unwrap(), vector);
    }

    #[test]
    fn test_blob_is_little_endian() {
        let blob = vector_to_blob(&[1.0f32]);
        assert_eq!(blob, 1.0f32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_blob_bad_length() {
        assert!(blob_to_vector(&[0u8, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn test_embed_empty_is_empty_without_remote_call() {
        // Unroutable URL: would error if a request were attempted.
        let client = EmbeddingClient::new(EmbeddingConfig {
            url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        });
        let vectors = client.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
