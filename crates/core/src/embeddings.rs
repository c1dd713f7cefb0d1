use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// External embedding collaborator. `embed` returns exactly one vector per
/// input text; any failure is an error, never a shortened batch.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic character-trigram hashing embedder. No network, no model:
/// the offline default and the workhorse of the test suite.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    pub dimensions: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashEmbedder {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// OpenAI-compatible HTTP embedding endpoint.
pub struct RemoteEmbeddingClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl RemoteEmbeddingClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingClient {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.endpoint.trim_end_matches('/')))
            .json(&json!({
                "model": self.model,
                "input": texts,
            }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Embedding(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        let rows = body
            .pointer("/data")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::Embedding("response missing data array".to_string()))?;

        let mut vectors = Vec::with_capacity(rows.len());
        for row in rows {
            let values = row
                .pointer("/embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| EngineError::Embedding("row missing embedding".to_string()))?;
            let vector: Vec<f32> = values
                .iter()
                .filter_map(Value::as_f64)
                .map(|value| value as f32)
                .collect();
            if vector.len() != values.len() {
                return Err(EngineError::Embedding(
                    "embedding contained non-numeric values".to_string(),
                ));
            }
            vectors.push(vector);
        }

        if vectors.len() != texts.len() {
            return Err(EngineError::Embedding(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                vectors.len()
            )));
        }

        Ok(vectors)
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm: f32 = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm: f32 = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let texts = vec!["hydraulic pressure and flow".to_string()];
        let first = embedder.embed(&texts).await.unwrap();
        let second = embedder.embed(&texts).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn hash_embedder_outputs_one_vector_per_text() {
        let embedder = HashEmbedder { dimensions: 32 };
        let texts = vec!["abc".to_string(), "def".to_string(), "".to_string()];
        let vectors = embedder.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|vector| vector.len() == 32));
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let vector = vec![0.5f32, 0.1, 0.9];
        assert!((cosine_similarity(&vector, &vector) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_handles_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
