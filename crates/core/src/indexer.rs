use crate::cleaner::Cleaner;
use crate::embeddings::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::models::IndexOutcome;
use crate::pipeline::{DocumentSource, Pipeline, SplitterOptions};
use crate::strategy::IndexScope;
use crate::traits::StorageBackend;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Scalar document fields that survive metadata sanitization. Everything else
/// is dropped so backends that infer schema from the first document never see
/// conflicting field types.
pub const METADATA_ALLOW_LIST: [&str; 8] = [
    "file_name",
    "file_path",
    "file_type",
    "file_size",
    "creation_date",
    "last_modified_date",
    "page_label",
    "page_number",
];

/// Orchestrates pipeline selection, cleaning, metadata sanitization, and
/// delegation to the storage backend. Immutable after construction; indexing
/// different documents concurrently is safe without locking.
pub struct DocumentIndexer {
    backend: Arc<dyn StorageBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    cleaner: Cleaner,
}

impl DocumentIndexer {
    pub fn new(backend: Arc<dyn StorageBackend>, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        Ok(Self {
            backend,
            embedder,
            cleaner: Cleaner::new()?,
        })
    }

    pub async fn index_document(
        &self,
        knowledge_id: &str,
        path: &Path,
        doc_ref: &str,
        options: &SplitterOptions,
    ) -> Result<IndexOutcome> {
        self.index_source(
            knowledge_id,
            DocumentSource::Path(path.to_path_buf()),
            doc_ref,
            options,
        )
        .await
    }

    pub async fn index_from_binary(
        &self,
        knowledge_id: &str,
        bytes: Vec<u8>,
        file_name: &str,
        doc_ref: &str,
        options: &SplitterOptions,
    ) -> Result<IndexOutcome> {
        self.index_source(
            knowledge_id,
            DocumentSource::Binary {
                bytes,
                file_name: file_name.to_string(),
            },
            doc_ref,
            options,
        )
        .await
    }

    /// All-or-nothing: any failure propagates and nothing partial is
    /// reported; a successful outcome always has `indexed_count > 0`.
    async fn index_source(
        &self,
        knowledge_id: &str,
        source: DocumentSource,
        doc_ref: &str,
        options: &SplitterOptions,
    ) -> Result<IndexOutcome> {
        let pipeline = Pipeline::new(options)?;
        let processed = pipeline.process(&source).await?;
        let document_metadata = sanitize_metadata(&processed.metadata);

        let mut chunks = self.cleaner.clean(processed.chunks);
        if chunks.is_empty() {
            return Err(EngineError::Validation(format!(
                "document {} produced no indexable chunks",
                source.file_name()
            )));
        }

        let created_at = Utc::now();
        let source_file = source.file_name();
        for (position, chunk) in chunks.iter_mut().enumerate() {
            chunk.metadata.doc_ref = doc_ref.to_string();
            chunk.metadata.knowledge_id = knowledge_id.to_string();
            chunk.metadata.source_file = source_file.clone();
            chunk.metadata.created_at = Some(created_at);
            chunk.metadata.position = position as u64;
            for (field, value) in &document_metadata {
                chunk
                    .metadata
                    .extra
                    .entry(field.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        let index_name = self
            .backend
            .resolve_index_name(&IndexScope::knowledge(knowledge_id))?;
        self.backend
            .create_store(&index_name, self.embedder.dimensions())
            .await?;
        let indexed_count = self
            .backend
            .index_chunks(&index_name, &chunks, self.embedder.as_ref())
            .await?;

        info!(
            knowledge_id,
            doc_ref,
            index_name,
            indexed_count,
            source_file,
            "document indexed"
        );

        Ok(IndexOutcome {
            indexed_count,
            index_name,
            created_at,
        })
    }
}

/// Keeps only allow-listed scalar fields and coerces every kept value to a
/// string. Arrays and objects are dropped even when allow-listed.
pub fn sanitize_metadata(raw: &Map<String, Value>) -> BTreeMap<String, String> {
    let mut sanitized = BTreeMap::new();
    for field in METADATA_ALLOW_LIST {
        let Some(value) = raw.get(field) else {
            continue;
        };
        let coerced = match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        };
        if let Some(text) = coerced {
            sanitized.insert(field.to_string(), text);
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{cosine_similarity, HashEmbedder};
    use crate::models::{
        Chunk, DocumentPage, DocumentSummary, PageRequest, RetrievalMode, RetrievalRequest,
        RetrievedChunk,
    };
    use crate::strategy::{resolve_index_name, IndexStrategy};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StoredChunk {
        chunk: Chunk,
        vector: Vec<f32>,
    }

    /// In-memory stand-in for a physical backend: cosine scoring for vector
    /// mode, token-overlap scoring for keyword mode.
    struct MemoryBackend {
        strategy: IndexStrategy,
        indexes: Mutex<HashMap<String, Vec<StoredChunk>>>,
    }

    impl MemoryBackend {
        fn new(strategy: IndexStrategy) -> Self {
            Self {
                strategy,
                indexes: Mutex::new(HashMap::new()),
            }
        }

        fn stored_count(&self, index_name: &str) -> usize {
            self.indexes
                .lock()
                .unwrap()
                .get(index_name)
                .map(Vec::len)
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl StorageBackend for MemoryBackend {
        fn name(&self) -> &str {
            "memory"
        }

        fn resolve_index_name(&self, scope: &IndexScope) -> Result<String> {
            resolve_index_name(&self.strategy, scope)
        }

        async fn create_store(&self, index_name: &str, _dimensions: usize) -> Result<()> {
            self.indexes
                .lock()
                .unwrap()
                .entry(index_name.to_string())
                .or_default();
            Ok(())
        }

        async fn index_chunks(
            &self,
            index_name: &str,
            chunks: &[Chunk],
            embedder: &dyn EmbeddingProvider,
        ) -> Result<usize> {
            let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
            let vectors = embedder.embed(&texts).await?;

            let mut indexes = self.indexes.lock().unwrap();
            let stored = indexes.entry(index_name.to_string()).or_default();
            for doc_ref in chunks.iter().map(|chunk| &chunk.metadata.doc_ref) {
                stored.retain(|existing| &existing.chunk.metadata.doc_ref != doc_ref);
            }
            for (chunk, vector) in chunks.iter().zip(vectors) {
                stored.push(StoredChunk {
                    chunk: chunk.clone(),
                    vector,
                });
            }
            Ok(chunks.len())
        }

        async fn retrieve(
            &self,
            index_name: &str,
            request: &RetrievalRequest,
            embedder: &dyn EmbeddingProvider,
        ) -> Result<Vec<RetrievedChunk>> {
            let query_vector = embedder
                .embed(&[request.query.clone()])
                .await?
                .pop()
                .unwrap_or_default();

            let indexes = self.indexes.lock().unwrap();
            let empty = Vec::new();
            let stored = indexes.get(index_name).unwrap_or(&empty);

            let mut hits: Vec<RetrievedChunk> = stored
                .iter()
                .map(|entry| {
                    let vector_score =
                        f64::from((1.0 + cosine_similarity(&query_vector, &entry.vector)) / 2.0);
                    let keyword_score = keyword_overlap(&request.query, &entry.chunk.content);
                    let score = match request.mode {
                        RetrievalMode::Vector => vector_score,
                        RetrievalMode::Keyword => keyword_score,
                        RetrievalMode::Hybrid => {
                            let weights = request.weights();
                            weights.vector_weight * vector_score
                                + weights.keyword_weight * keyword_score
                        }
                    };
                    RetrievedChunk {
                        content: entry.chunk.content.clone(),
                        score,
                        title: entry.chunk.metadata.source_file.clone(),
                        metadata: entry.chunk.metadata.extra.clone(),
                    }
                })
                .filter(|hit| hit.score >= request.score_threshold)
                .collect();
            hits.sort_by(|left, right| right.score.total_cmp(&left.score));
            hits.truncate(request.top_k);
            Ok(hits)
        }

        async fn delete_document(&self, index_name: &str, doc_ref: &str) -> Result<()> {
            if let Some(stored) = self.indexes.lock().unwrap().get_mut(index_name) {
                stored.retain(|entry| entry.chunk.metadata.doc_ref != doc_ref);
            }
            Ok(())
        }

        async fn get_document(
            &self,
            index_name: &str,
            doc_ref: &str,
        ) -> Result<Option<DocumentSummary>> {
            let indexes = self.indexes.lock().unwrap();
            let chunks: Vec<_> = indexes
                .get(index_name)
                .map(|stored| {
                    stored
                        .iter()
                        .filter(|entry| entry.chunk.metadata.doc_ref == doc_ref)
                        .collect()
                })
                .unwrap_or_default();
            Ok(chunks.first().map(|entry| DocumentSummary {
                doc_ref: doc_ref.to_string(),
                source_file: entry.chunk.metadata.source_file.clone(),
                chunk_count: chunks.len(),
                created_at: entry.chunk.metadata.created_at,
            }))
        }

        async fn list_documents(
            &self,
            _index_name: &str,
            page: PageRequest,
        ) -> Result<DocumentPage> {
            Ok(DocumentPage {
                documents: Vec::new(),
                page: page.page,
                page_size: page.page_size,
                total: 0,
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn keyword_overlap(query: &str, content: &str) -> f64 {
        let lowered = content.to_lowercase();
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if terms.is_empty() {
            return 0.0;
        }
        let matched = terms.iter().filter(|term| lowered.contains(*term)).count();
        matched as f64 / terms.len() as f64
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn dimensions(&self) -> usize {
            8
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(EngineError::Embedding("provider offline".to_string()))
        }
    }

    fn indexer_with(
        backend: Arc<MemoryBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> DocumentIndexer {
        DocumentIndexer::new(backend, embedder).expect("indexer builds")
    }

    const SAMPLE: &str = "# Pump Maintenance\n\nCheck the intake filter weekly and replace it \
                          when pressure drops below the rated threshold for the installed model.\n\n\
                          Cavitation shows up as a crackling noise near the impeller housing.";

    #[tokio::test]
    async fn round_trip_returns_indexed_chunk_for_both_modes() {
        let backend = Arc::new(MemoryBackend::new(IndexStrategy::per_dataset("wegent")));
        let embedder = Arc::new(HashEmbedder::default());
        let indexer = indexer_with(backend.clone(), embedder.clone());

        let outcome = indexer
            .index_from_binary(
                "42",
                SAMPLE.as_bytes().to_vec(),
                "pump.md",
                "doc-1",
                &SplitterOptions::default(),
            )
            .await
            .unwrap();
        assert!(outcome.indexed_count > 0);
        assert_eq!(outcome.index_name, "wegent_kb_42");

        let probe = "Cavitation shows up as a crackling noise near the impeller housing.";
        for mode in [RetrievalMode::Vector, RetrievalMode::Keyword] {
            let request = RetrievalRequest::new(probe, 3, mode).unwrap();
            let hits = backend
                .retrieve("wegent_kb_42", &request, embedder.as_ref())
                .await
                .unwrap();
            assert!(
                hits.iter().any(|hit| hit.content.contains("Cavitation")),
                "expected the cavitation chunk among top hits for {mode:?}"
            );
            assert!(hits.iter().all(|hit| (0.0..=1.0).contains(&hit.score)));
        }
    }

    #[tokio::test]
    async fn reindexing_replaces_prior_chunks() {
        let backend = Arc::new(MemoryBackend::new(IndexStrategy::per_dataset("wegent")));
        let embedder = Arc::new(HashEmbedder::default());
        let indexer = indexer_with(backend.clone(), embedder);

        indexer
            .index_from_binary(
                "42",
                SAMPLE.as_bytes().to_vec(),
                "pump.md",
                "doc-1",
                &SplitterOptions::default(),
            )
            .await
            .unwrap();
        let first_count = backend.stored_count("wegent_kb_42");

        indexer
            .index_from_binary(
                "42",
                b"Replacement body with a single short paragraph.".to_vec(),
                "pump.txt",
                "doc-1",
                &SplitterOptions::default(),
            )
            .await
            .unwrap();

        let second_count = backend.stored_count("wegent_kb_42");
        assert!(first_count > 0);
        assert_eq!(second_count, 1);
    }

    #[tokio::test]
    async fn embedding_failure_aborts_without_partial_writes() {
        let backend = Arc::new(MemoryBackend::new(IndexStrategy::per_dataset("wegent")));
        let indexer = indexer_with(backend.clone(), Arc::new(FailingEmbedder));

        let result = indexer
            .index_from_binary(
                "42",
                SAMPLE.as_bytes().to_vec(),
                "pump.md",
                "doc-1",
                &SplitterOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(EngineError::Embedding(_))));
        assert_eq!(backend.stored_count("wegent_kb_42"), 0);
    }

    #[tokio::test]
    async fn chunks_carry_indexing_metadata() {
        let backend = Arc::new(MemoryBackend::new(IndexStrategy::per_dataset("wegent")));
        let embedder = Arc::new(HashEmbedder::default());
        let indexer = indexer_with(backend.clone(), embedder);

        indexer
            .index_from_binary(
                "7",
                SAMPLE.as_bytes().to_vec(),
                "pump.md",
                "doc-9",
                &SplitterOptions::default(),
            )
            .await
            .unwrap();

        let indexes = backend.indexes.lock().unwrap();
        let stored = indexes.get("wegent_kb_7").unwrap();
        for (position, entry) in stored.iter().enumerate() {
            assert_eq!(entry.chunk.metadata.doc_ref, "doc-9");
            assert_eq!(entry.chunk.metadata.knowledge_id, "7");
            assert_eq!(entry.chunk.metadata.source_file, "pump.md");
            assert_eq!(entry.chunk.metadata.position, position as u64);
            assert!(entry.chunk.metadata.created_at.is_some());
            assert_eq!(
                entry.chunk.metadata.extra.get("file_name"),
                Some(&"pump.md".to_string())
            );
        }
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let backend = Arc::new(MemoryBackend::new(IndexStrategy::per_dataset("wegent")));
        let embedder = Arc::new(HashEmbedder::default());
        let indexer = indexer_with(backend, embedder);

        let result = indexer
            .index_from_binary(
                "42",
                b"---\n\n   \n".to_vec(),
                "empty.txt",
                "doc-1",
                &SplitterOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn sanitize_keeps_only_allow_listed_scalars_as_strings() {
        let mut raw = Map::new();
        raw.insert("file_name".to_string(), json!("a.txt"));
        raw.insert("file_size".to_string(), json!(2048));
        raw.insert("page_number".to_string(), json!(3));
        raw.insert("embedding".to_string(), json!([0.1, 0.2]));
        raw.insert("author".to_string(), json!("someone"));
        raw.insert("page_label".to_string(), json!({"nested": true}));

        let sanitized = sanitize_metadata(&raw);
        assert_eq!(sanitized.get("file_name"), Some(&"a.txt".to_string()));
        assert_eq!(sanitized.get("file_size"), Some(&"2048".to_string()));
        assert_eq!(sanitized.get("page_number"), Some(&"3".to_string()));
        assert!(!sanitized.contains_key("embedding"));
        assert!(!sanitized.contains_key("author"));
        assert!(!sanitized.contains_key("page_label"));
    }
}
