use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::models::{Chunk, DocumentPage, DocumentSummary, PageRequest, RetrievalRequest, RetrievedChunk};
use crate::strategy::IndexScope;
use async_trait::async_trait;

/// Contract every physical backend must satisfy identically. Instances are
/// immutable after construction; concurrent calls for different documents
/// need no locking.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Pure index-name resolution from the instance's configured strategy.
    fn resolve_index_name(&self, scope: &IndexScope) -> Result<String>;

    /// Create the index/collection if it does not exist yet.
    async fn create_store(&self, index_name: &str, dimensions: usize) -> Result<()>;

    /// Embeds and writes chunks, returning the count written. Re-indexing a
    /// `doc_ref` replaces its prior chunk set.
    async fn index_chunks(
        &self,
        index_name: &str,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<usize>;

    /// Uniform ranked retrieval; scores are within [0, 1] regardless of the
    /// physical engine. Unsupported modes fail with a validation error.
    async fn retrieve(
        &self,
        index_name: &str,
        request: &RetrievalRequest,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Vec<RetrievedChunk>>;

    /// Removes every chunk of the document.
    async fn delete_document(&self, index_name: &str, doc_ref: &str) -> Result<()>;

    async fn get_document(&self, index_name: &str, doc_ref: &str)
        -> Result<Option<DocumentSummary>>;

    async fn list_documents(&self, index_name: &str, page: PageRequest) -> Result<DocumentPage>;

    /// Synchronous liveness probe. Must never error: any failure is `false`.
    async fn health_check(&self) -> bool;
}
