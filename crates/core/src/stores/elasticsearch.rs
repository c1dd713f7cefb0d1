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
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

const BACKEND: &str = "elasticsearch";

/// Search-engine backend speaking the Elasticsearch HTTP API. Supports all
/// three retrieval modes; hybrid combines normalized keyword and vector
/// scores with the request weights.
pub struct ElasticsearchStore {
    client: Arc<Client>,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
    api_key: Option<String>,
    strategy: IndexStrategy,
}

impl ElasticsearchStore {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let endpoint = url::Url::parse(&config.url)
            .map_err(|error| EngineError::Config(format!("invalid elasticsearch url: {error}")))?;
        Ok(Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            api_key: config.api_key.clone(),
            strategy: config.strategy.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(api_key) = &self.api_key {
            return request.header("Authorization", format!("ApiKey {api_key}"));
        }
        if let Some(username) = &self.username {
            return request.basic_auth(username, self.password.as_deref());
        }
        request
    }

    async fn search(&self, index_name: &str, body: &Value) -> Result<Value> {
        let response = self
            .authorize(
                self.client
                    .post(format!("{}/{}/_search", self.endpoint, index_name)),
            )
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::backend(BACKEND, response.status().to_string()));
        }
        Ok(response.json().await?)
    }

    async fn keyword_hits(
        &self,
        index_name: &str,
        request: &RetrievalRequest,
    ) -> Result<Vec<(String, f64, RetrievedChunk)>> {
        let body = json!({
            "size": request.top_k,
            "query": {
                "bool": {
                    "must": [
                        {
                            "multi_match": {
                                "query": request.query,
                                "fields": ["content", "header_path"]
                            }
                        }
                    ],
                    "filter": metadata_filters(request)
                }
            }
        });

        let response = self.search(index_name, &body).await?;
        let max_score = response
            .pointer("/hits/max_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let hits = response
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::new();
        for raw in hits {
            let score = raw.pointer("/_score").and_then(Value::as_f64).unwrap_or(0.0);
            let normalized = if max_score > 0.0 { score / max_score } else { 0.0 };
            results.push((hit_id(&raw), normalized, parse_hit(&raw)));
        }
        Ok(results)
    }

    async fn vector_hits(
        &self,
        index_name: &str,
        request: &RetrievalRequest,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<(String, f64, RetrievedChunk)>> {
        let query_vector = embedder
            .embed(&[request.query.clone()])
            .await?
            .pop()
            .ok_or_else(|| EngineError::Embedding("provider returned no vector".to_string()))?;

        let body = json!({
            "size": request.top_k,
            "knn": {
                "field": "embedding",
                "query_vector": query_vector,
                "k": request.top_k,
                "num_candidates": (request.top_k * 4).max(64),
                "filter": metadata_filters(request)
            }
        });

        let response = self.search(index_name, &body).await?;
        let hits = response
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Cosine scores from the knn endpoint already land in [0, 1].
        Ok(hits
            .iter()
            .map(|raw| {
                let score = raw
                    .pointer("/_score")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                (hit_id(raw), score, parse_hit(raw))
            })
            .collect())
    }
}

#[async_trait]
impl StorageBackend for ElasticsearchStore {
    fn name(&self) -> &str {
        BACKEND
    }

    fn resolve_index_name(&self, scope: &IndexScope) -> Result<String> {
        resolve_index_name(&self.strategy, scope)
    }

    async fn create_store(&self, index_name: &str, dimensions: usize) -> Result<()> {
        let response = self
            .authorize(self.client.head(format!("{}/{}", self.endpoint, index_name)))
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }
        if !response.status().is_client_error() {
            return Err(EngineError::backend(BACKEND, response.status().to_string()));
        }

        let response = self
            .authorize(self.client.put(format!("{}/{}", self.endpoint, index_name)))
            .json(&json!({
                "settings": {
                    "number_of_shards": 1,
                    "number_of_replicas": 0
                },
                "mappings": {
                    "properties": {
                        "content": {"type": "text"},
                        "doc_ref": {"type": "keyword"},
                        "knowledge_id": {"type": "keyword"},
                        "source_file": {"type": "keyword"},
                        "chunk_type": {"type": "keyword"},
                        "header_path": {"type": "text"},
                        "position": {"type": "long"},
                        "created_at": {"type": "date"},
                        "metadata": {"type": "object", "dynamic": true},
                        "embedding": {
                            "type": "dense_vector",
                            "dims": dimensions,
                            "index": true,
                            "similarity": "cosine"
                        }
                    }
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::backend(
                BACKEND,
                format!("index setup failed with {}", response.status()),
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

        // Replacement semantics: a doc_ref's previous chunks go first.
        let mut doc_refs: Vec<&str> = chunks
            .iter()
            .map(|chunk| chunk.metadata.doc_ref.as_str())
            .collect();
        doc_refs.dedup();
        for doc_ref in doc_refs {
            self.delete_document(index_name, doc_ref).await?;
        }

        let mut operations = Vec::new();
        for (chunk, embedding) in chunks.iter().zip(&embeddings) {
            operations.push(json!({
                "index": {
                    "_index": index_name,
                    "_id": chunk_id(&chunk.metadata.doc_ref, chunk.metadata.position),
                }
            }));
            operations.push(json!({
                "content": chunk.content,
                "doc_ref": chunk.metadata.doc_ref,
                "knowledge_id": chunk.metadata.knowledge_id,
                "source_file": chunk.metadata.source_file,
                "chunk_type": chunk.chunk_type,
                "header_path": chunk.metadata.header_path,
                "position": chunk.metadata.position,
                "created_at": chunk.metadata.created_at,
                "metadata": chunk.metadata.extra,
                "embedding": embedding,
            }));
        }

        let payload: String = operations
            .into_iter()
            .map(|value| serde_json::to_string(&value))
            .collect::<Result<Vec<_>, serde_json::Error>>()?
            .join("\n")
            + "\n";

        let response = self
            .authorize(
                self.client
                    .post(format!("{}/_bulk?refresh=true", self.endpoint)),
            )
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::backend(BACKEND, response.status().to_string()));
        }
        let body: Value = response.json().await?;
        if body.pointer("/errors").and_then(Value::as_bool).unwrap_or(false) {
            return Err(EngineError::backend(
                BACKEND,
                "bulk indexing reported item errors".to_string(),
            ));
        }

        Ok(chunks.len())
    }

    async fn retrieve(
        &self,
        index_name: &str,
        request: &RetrievalRequest,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<RetrievedChunk>> {
        let scored = match request.mode {
            RetrievalMode::Keyword => self.keyword_hits(index_name, request).await?,
            RetrievalMode::Vector => self.vector_hits(index_name, request, embedder).await?,
            RetrievalMode::Hybrid => {
                let weights = request.weights();
                let keyword = self.keyword_hits(index_name, request).await?;
                let vector = self.vector_hits(index_name, request, embedder).await?;

                let mut combined: BTreeMap<String, (f64, RetrievedChunk)> = BTreeMap::new();
                for (id, score, hit) in vector {
                    combined.insert(id, (weights.vector_weight * score, hit));
                }
                for (id, score, hit) in keyword {
                    combined
                        .entry(id)
                        .and_modify(|(total, _)| *total += weights.keyword_weight * score)
                        .or_insert((weights.keyword_weight * score, hit));
                }
                combined
                    .into_iter()
                    .map(|(id, (score, hit))| (id, score, hit))
                    .collect()
            }
        };

        let mut results: Vec<RetrievedChunk> = scored
            .into_iter()
            .map(|(_, score, mut hit)| {
                hit.score = score.clamp(0.0, 1.0);
                hit
            })
            .filter(|hit| hit.score >= request.score_threshold)
            .collect();
        results.sort_by(|left, right| right.score.total_cmp(&left.score));
        results.truncate(request.top_k);
        Ok(results)
    }

    async fn delete_document(&self, index_name: &str, doc_ref: &str) -> Result<()> {
        let response = self
            .authorize(self.client.post(format!(
                "{}/{}/_delete_by_query?refresh=true",
                self.endpoint, index_name
            )))
            .json(&json!({
                "query": {"term": {"doc_ref": doc_ref}}
            }))
            .send()
            .await?;

        // A missing index means there is nothing to delete.
        if response.status() == StatusCode::NOT_FOUND {
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
        let body = json!({
            "size": 1,
            "track_total_hits": true,
            "query": {"term": {"doc_ref": doc_ref}},
            "sort": [{"position": "asc"}]
        });
        let response = self.search(index_name, &body).await?;

        let total = response
            .pointer("/hits/total/value")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        if total == 0 {
            return Ok(None);
        }

        let first = response
            .pointer("/hits/hits/0/_source")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(Some(DocumentSummary {
            doc_ref: doc_ref.to_string(),
            source_file: first
                .pointer("/source_file")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            chunk_count: total,
            created_at: first
                .pointer("/created_at")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|stamp| stamp.with_timezone(&chrono::Utc)),
        }))
    }

    async fn list_documents(&self, index_name: &str, page: PageRequest) -> Result<DocumentPage> {
        let fetch = page.page.max(1) * page.page_size;
        let body = json!({
            "size": 0,
            "aggs": {
                "documents": {
                    "terms": {"field": "doc_ref", "size": fetch.max(1)},
                    "aggs": {
                        "sample": {"top_hits": {"size": 1, "sort": [{"position": "asc"}]}}
                    }
                },
                "document_total": {"cardinality": {"field": "doc_ref"}}
            }
        });
        let response = self.search(index_name, &body).await?;

        let total = response
            .pointer("/aggregations/document_total/value")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let buckets = response
            .pointer("/aggregations/documents/buckets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let start = (page.page.max(1) - 1) * page.page_size;
        let documents = buckets
            .iter()
            .skip(start)
            .take(page.page_size)
            .map(|bucket| {
                let source = bucket
                    .pointer("/sample/hits/hits/0/_source")
                    .cloned()
                    .unwrap_or(Value::Null);
                DocumentSummary {
                    doc_ref: bucket
                        .pointer("/key")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    source_file: source
                        .pointer("/source_file")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    chunk_count: bucket
                        .pointer("/doc_count")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize,
                    created_at: source
                        .pointer("/created_at")
                        .and_then(Value::as_str)
                        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                        .map(|stamp| stamp.with_timezone(&chrono::Utc)),
                }
            })
            .collect();

        Ok(DocumentPage {
            documents,
            page: page.page.max(1),
            page_size: page.page_size,
            total,
        })
    }

    async fn health_check(&self) -> bool {
        let probe = self
            .authorize(self.client.get(format!("{}/_cluster/health", self.endpoint)))
            .send()
            .await;
        matches!(probe, Ok(response) if response.status().is_success())
    }
}

fn chunk_id(doc_ref: &str, position: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_ref.as_bytes());
    hasher.update(position.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

fn hit_id(raw: &Value) -> String {
    raw.pointer("/_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_hit(raw: &Value) -> RetrievedChunk {
    let source = raw.pointer("/_source").cloned().unwrap_or(Value::Null);
    let mut metadata = BTreeMap::new();

    for field in ["doc_ref", "knowledge_id", "source_file", "chunk_type", "header_path"] {
        if let Some(value) = source.pointer(&format!("/{field}")).and_then(Value::as_str) {
            metadata.insert(field.to_string(), value.to_string());
        }
    }
    if let Some(extra) = source.pointer("/metadata").and_then(Value::as_object) {
        for (field, value) in extra {
            if let Some(text) = value.as_str() {
                metadata.insert(field.clone(), text.to_string());
            }
        }
    }

    RetrievedChunk {
        content: source
            .pointer("/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        score: 0.0,
        title: source
            .pointer("/source_file")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        metadata,
    }
}

fn metadata_filters(request: &RetrievalRequest) -> Vec<Value> {
    let known = ["doc_ref", "knowledge_id", "source_file", "chunk_type"];
    request
        .metadata_filters
        .iter()
        .map(|(field, value)| {
            let target = if known.contains(&field.as_str()) {
                field.clone()
            } else {
                format!("metadata.{field}")
            };
            let mut term = serde_json::Map::new();
            term.insert(target, json!(value));
            json!({ "term": term })
        })
        .collect()
}
