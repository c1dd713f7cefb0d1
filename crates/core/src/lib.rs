pub mod cleaner;
pub mod embeddings;
pub mod error;
pub mod indexer;
pub mod markdown;
pub mod models;
pub mod pipeline;
pub mod splitter;
pub mod stores;
pub mod strategy;
pub mod traits;

pub use cleaner::Cleaner;
pub use embeddings::{
    EmbeddingProvider, HashEmbedder, RemoteEmbeddingClient, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EngineError, Result};
pub use indexer::{sanitize_metadata, DocumentIndexer, METADATA_ALLOW_LIST};
pub use markdown::MarkdownSplitter;
pub use models::{
    BackendConfig, Chunk, ChunkMetadata, ChunkType, DocumentPage, DocumentSummary, HybridWeights,
    IndexOutcome, PageRequest, RetrievalMode, RetrievalRequest, RetrievedChunk,
};
pub use pipeline::{
    discover_supported_files, is_supported_extension, DocumentSource, Pipeline, ProcessedDocument,
    SplitterOptions,
};
pub use splitter::{SemanticSplitter, SentenceSplitter};
pub use stores::{BackendRegistry, ElasticsearchStore, QdrantStore};
pub use strategy::{resolve_index_name, IndexScope, IndexStrategy, StrategyMode};
pub use traits::StorageBackend;
