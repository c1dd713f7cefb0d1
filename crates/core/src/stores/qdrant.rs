use crate::embeddings::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::models::{
    BackendConfig, Chunk, DocumentPage, DocumentSummary, PageRequest, RetrievalMode,
    RetrievalRequest, RetrievedChunk,
};
use crate::strategy::{resolve_index_name, IndexScope, IndexStrategy};
use crate::traits::StorageBackend;
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

const BACKEND: &str = "qdrant";

/// Vector-database backend speaking the Qdrant HTTP API. Vector retrieval
/// only: keyword and hybrid modes fail validation for this backend.
pub struct QdrantStore {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    strategy: IndexStrategy,
}

impl QdrantStore {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let endpoint = url::Url::parse(&config.url)
            .map_err(|error| EngineError::Config(format!("invalid qdrant url: {error}")))?;
        Ok(Self {
            client: Client::new(),
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            strategy: config.strategy.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(api_key) => request.header("api-key", api_key),
            None => request,
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/collections/{}", self.endpoint, collection)
    }

    async fn scroll_page(
        &self,
        collection: &str,
        offset: Option<&Value>,
        limit: usize,
    ) -> Result<(Vec<Value>, Option<Value>)> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": false,
        });
        if let Some(offset) = offset {
            body["offset"] = offset.clone();
        }

        let response = self
            .authorize(
                self.client
                    .post(format!("{}/points/scroll", self.collection_url(collection))),
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::backend(BACKEND, response.status().to_string()));
        }

        let parsed: Value = response.json().await?;
        let points = parsed
            .pointer("/result/points")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let next = parsed
            .pointer("/result/next_page_offset")
            .filter(|value| !value.is_null())
            .cloned();
        Ok((points, next))
    }

    /// Walks the whole collection and collapses points into per-document
    /// summaries, ordered by doc_ref.
    async fn collect_documents(&self, collection: &str) -> Result<Vec<DocumentSummary>> {
        let mut summaries: BTreeMap<String, DocumentSummary> = BTreeMap::new();
        let mut offset: Option<Value> = None;

        loop {
            let (points, next) = self.scroll_page(collection, offset.as_ref(), 256).await?;
            for point in &points {
                let Some(doc_ref) = point
                    .pointer("/payload/doc_ref")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    continue;
                };
                let entry = summaries.entry(doc_ref.clone()).or_insert_with(|| DocumentSummary {
                    doc_ref,
                    source_file: point
                        .pointer("/payload/source_file")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    chunk_count: 0,
                    created_at: point
                        .pointer("/payload/created_at")
                        .and_then(Value::as_str)
                        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                        .map(|stamp| stamp.with_timezone(&chrono::Utc)),
                });
                entry.chunk_count += 1;
            }

            match next {
                Some(value) => offset = Some(value),
                None => break,
            }
        }

        Ok(summaries.into_values().collect())
    }
}

#[async_trait]
impl StorageBackend for QdrantStore {
    fn name(&self) -> &str {
        BACKEND
    }

    fn resolve_index_name(&self, scope: &IndexScope) -> Result<String> {
        resolve_index_name(&self.strategy, scope)
    }

    async fn create_store(&self, index_name: &str, dimensions: usize) -> Result<()> {
        let probe = self
            .authorize(self.client.get(self.collection_url(index_name)))
            .send()
            .await?;
        if probe.status().is_success() {
            return Ok(());
        }

        let response = self
            .authorize(self.client.put(self.collection_url(index_name)))
            .json(&json!({
                "vectors": {
                    "size": dimensions,
                    "distance": "Cosine"
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::backend(
                BACKEND,
                format!("collection setup failed with {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn index_chunks(
        &self,
        index_name: &str,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let embeddings = embedder.embed(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(EngineError::Embedding(format!(
                "embedding count {} does not match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }

        let mut doc_refs: Vec<&str> = chunks
            .iter()
            .map(|chunk| chunk.metadata.doc_ref.as_str())
            .collect();
        doc_refs.dedup();
        for doc_ref in doc_refs {
            self.delete_document(index_name, doc_ref).await?;
        }

        let points: Vec<Value> = chunks
            .iter()
            .zip(&embeddings)
            .map(|(chunk, embedding)| {
                json!({
                    "id": point_id(&chunk.metadata.doc_ref, chunk.metadata.position),
                    "vector": embedding,
                    "payload": {
                        "content": chunk.content,
                        "doc_ref": chunk.metadata.doc_ref,
                        "knowledge_id": chunk.metadata.knowledge_id,
                        "source_file": chunk.metadata.source_file,
                        "chunk_type": chunk.chunk_type,
                        "header_path": chunk.metadata.header_path,
                        "position": chunk.metadata.position,
                        "created_at": chunk.metadata.created_at,
                        "metadata": chunk.metadata.extra,
                    }
                })
            })
            .collect();

        let response = self
            .authorize(
                self.client
                    .put(format!("{}/points?wait=true", self.collection_url(index_name))),
            )
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::backend(BACKEND, response.status().to_string()));
        }
        Ok(chunks.len())
    }

    async fn retrieve(
        &self,
        index_name: &str,
        request: &RetrievalRequest,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<RetrievedChunk>> {
        if request.mode != RetrievalMode::Vector {
            return Err(EngineError::Validation(format!(
                "retrieval mode {:?} is not supported by the qdrant backend",
                request.mode
            )));
        }

        let query_vector = embedder
            .embed(&[request.query.clone()])
            .await?
            .pop()
            .ok_or_else(|| EngineError::Embedding("provider returned no vector".to_string()))?;

        let mut body = json!({
            "vector": query_vector,
            "limit": request.top_k,
            "with_payload": true,
        });
        if !request.metadata_filters.is_empty() {
            body["filter"] = json!({ "must": payload_filters(request) });
        }

        let response = self
            .authorize(
                self.client
                    .post(format!("{}/points/search", self.collection_url(index_name))),
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::backend(BACKEND, response.status().to_string()));
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::new();
        for hit in hits {
            // Cosine similarity maps onto [0, 1] so scores compare across
            // backends.
            let raw_score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
            let score = ((1.0 + raw_score) / 2.0).clamp(0.0, 1.0);
            if score < request.score_threshold {
                continue;
            }

            let mut metadata = BTreeMap::new();
            for field in ["doc_ref", "knowledge_id", "source_file", "chunk_type", "header_path"] {
                if let Some(value) = hit
                    .pointer(&format!("/payload/{field}"))
                    .and_then(Value::as_str)
                {
                    metadata.insert(field.to_string(), value.to_string());
                }
            }
            if let Some(extra) = hit.pointer("/payload/metadata").and_then(Value::as_object) {
                for (field, value) in extra {
                    if let Some(text) = value.as_str() {
                        metadata.insert(field.clone(), text.to_string());
                    }
                }
            }

            results.push(RetrievedChunk {
                content: hit
                    .pointer("/payload/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score,
                title: hit
                    .pointer("/payload/source_file")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                metadata,
            });
        }

        Ok(results)
    }

    async fn delete_document(&self, index_name: &str, doc_ref: &str) -> Result<()> {
        let response = self
            .authorize(self.client.post(format!(
                "{}/points/delete?wait=true",
                self.collection_url(index_name)
            )))
            .json(&json!({
                "filter": {
                    "must": [
                        {"key": "doc_ref", "match": {"value": doc_ref}}
                    ]
                }
            }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(EngineError::backend(BACKEND, response.status().to_string()));
        }
        Ok(())
    }

    async fn get_document(
        &self,
        index_name: &str,
        doc_ref: &str,
    ) -> Result<Option<DocumentSummary>> {
        let count_response = self
            .authorize(
                self.client
                    .post(format!("{}/points/count", self.collection_url(index_name))),
            )
            .json(&json!({
                "filter": {
                    "must": [
                        {"key": "doc_ref", "match": {"value": doc_ref}}
                    ]
                },
                "exact": true
            }))
            .send()
            .await?;

        if !count_response.status().is_success() {
            return Err(EngineError::backend(
                BACKEND,
                count_response.status().to_string(),
            ));
        }
        let parsed: Value = count_response.json().await?;
        let chunk_count = parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        if chunk_count == 0 {
            return Ok(None);
        }

        let scroll_response = self
            .authorize(
                self.client
                    .post(format!("{}/points/scroll", self.collection_url(index_name))),
            )
            .json(&json!({
                "filter": {
                    "must": [
                        {"key": "doc_ref", "match": {"value": doc_ref}}
                    ]
                },
                "limit": 1,
                "with_payload": true,
                "with_vector": false
            }))
            .send()
            .await?;

        if !scroll_response.status().is_success() {
            return Err(EngineError::backend(
                BACKEND,
                scroll_response.status().to_string(),
            ));
        }
        let parsed: Value = scroll_response.json().await?;
        let first = parsed
            .pointer("/result/points/0/payload")
            .cloned()
            .unwrap_or(Value::Null);

        Ok(Some(DocumentSummary {
            doc_ref: doc_ref.to_string(),
            source_file: first
                .pointer("/source_file")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            chunk_count,
            created_at: first
                .pointer("/created_at")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|stamp| stamp.with_timezone(&chrono::Utc)),
        }))
    }

    async fn list_documents(&self, index_name: &str, page: PageRequest) -> Result<DocumentPage> {
        let all = self.collect_documents(index_name).await?;
        let total = all.len();
        let page_number = page.page.max(1);
        let start = (page_number - 1) * page.page_size;

        Ok(DocumentPage {
            documents: all.into_iter().skip(start).take(page.page_size).collect(),
            page: page_number,
            page_size: page.page_size,
            total,
        })
    }

    async fn health_check(&self) -> bool {
        let probe = self
            .authorize(self.client.get(format!("{}/healthz", self.endpoint)))
            .send()
            .await;
        matches!(probe, Ok(response) if response.status().is_success())
    }
}

/// Deterministic point id: a UUID derived from the doc_ref and chunk
/// position, so re-indexing writes the same ids.
fn point_id(doc_ref: &str, position: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_ref.as_bytes());
    hasher.update(position.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

fn payload_filters(request: &RetrievalRequest) -> Vec<Value> {
    let known = ["doc_ref", "knowledge_id", "source_file", "chunk_type"];
    request
        .metadata_filters
        .iter()
        .map(|(field, value)| {
            let key = if known.contains(&field.as_str()) {
                field.clone()
            } else {
                format!("metadata.{field}")
            };
            json!({"key": key, "match": {"value": value}})
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;

    fn config(url: &str) -> BackendConfig {
        BackendConfig {
            url: url.to_string(),
            username: None,
            password: None,
            api_key: None,
            strategy: IndexStrategy::per_dataset("wegent"),
            options: BTreeMap::new(),
        }
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        let result = QdrantStore::new(&config("::nope::"));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn point_ids_are_deterministic_uuids() {
        let first = point_id("doc-1", 0);
        let second = point_id("doc-1", 0);
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
        assert_ne!(first, point_id("doc-1", 1));
    }

    #[tokio::test]
    async fn keyword_and_hybrid_modes_are_rejected() {
        let store = QdrantStore::new(&config("http://localhost:6333")).unwrap();
        let embedder = HashEmbedder::default();

        for mode in [RetrievalMode::Keyword, RetrievalMode::Hybrid] {
            let request = RetrievalRequest::new("query", 5, mode).unwrap();
            let result = store.retrieve("wegent_kb_42", &request, &embedder).await;
            assert!(matches!(result, Err(EngineError::Validation(_))));
        }
    }

    #[test]
    fn payload_filters_route_unknown_fields_into_metadata() {
        let request = RetrievalRequest::new("query", 5, RetrievalMode::Vector)
            .unwrap()
            .with_metadata_filter("knowledge_id", "42")
            .with_metadata_filter("page_number", "2");
        let filters = payload_filters(&request);
        let rendered = serde_json::to_string(&filters).unwrap();
        assert!(rendered.contains("\"key\":\"knowledge_id\""));
        assert!(rendered.contains("\"key\":\"metadata.page_number\""));
    }
}
