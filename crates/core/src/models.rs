use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed set of semantic chunk categories. Cleaning rules dispatch on this
/// exhaustively, so adding a category is a compile-time decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Paragraph,
    Code,
    Table,
    List,
    Qa,
    Heading,
    Blockquote,
    Definition,
    Flow,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChunkMetadata {
    pub doc_ref: String,
    pub knowledge_id: String,
    pub source_file: String,
    pub created_at: Option<DateTime<Utc>>,
    pub position: u64,
    /// Heading-hierarchy path of the chunk inside its document, e.g.
    /// "Install Guide > Requirements".
    pub header_path: Option<String>,
    /// Sanitized scalar fields carried from the source document. Values are
    /// always strings so schema-inferring backends see one type per field.
    pub extra: BTreeMap<String, String>,
}

/// The retrievable unit: cleaned text plus metadata. The embedding vector is
/// computed by the backend at write time and never stored here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub chunk_type: ChunkType,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(content: impl Into<String>, chunk_type: ChunkType) -> Self {
        Self {
            content: content.into(),
            chunk_type,
            metadata: ChunkMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Vector,
    Keyword,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HybridWeights {
    pub vector_weight: f64,
    pub keyword_weight: f64,
}

impl HybridWeights {
    /// Weights must each lie in [0, 1] and sum to 1.0 within ±0.01.
    pub fn new(vector_weight: f64, keyword_weight: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&vector_weight) || !(0.0..=1.0).contains(&keyword_weight) {
            return Err(EngineError::Validation(format!(
                "hybrid weights must be within [0, 1], got ({vector_weight}, {keyword_weight})"
            )));
        }
        let sum = vector_weight + keyword_weight;
        if (sum - 1.0).abs() > 0.01 {
            return Err(EngineError::Validation(format!(
                "hybrid weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(Self {
            vector_weight,
            keyword_weight,
        })
    }
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalRequest {
    pub query: String,
    pub top_k: usize,
    pub score_threshold: f64,
    pub mode: RetrievalMode,
    pub hybrid_weights: Option<HybridWeights>,
    /// Exact-match metadata conditions applied as filters by the backend.
    pub metadata_filters: BTreeMap<String, String>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, top_k: usize, mode: RetrievalMode) -> Result<Self> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(EngineError::Validation("query is empty".to_string()));
        }
        if top_k == 0 {
            return Err(EngineError::Validation("top_k must be positive".to_string()));
        }
        Ok(Self {
            query,
            top_k,
            score_threshold: 0.0,
            mode,
            hybrid_weights: None,
            metadata_filters: BTreeMap::new(),
        })
    }

    pub fn with_score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn with_hybrid_weights(mut self, weights: HybridWeights) -> Self {
        self.hybrid_weights = Some(weights);
        self
    }

    pub fn with_metadata_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_filters.insert(field.into(), value.into());
        self
    }

    pub fn weights(&self) -> HybridWeights {
        self.hybrid_weights.unwrap_or_default()
    }
}

/// One ranked retrieval hit. The shape is identical regardless of which
/// physical backend produced it; `score` is always within [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub score: f64,
    pub title: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOutcome {
    pub indexed_count: usize,
    pub index_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub doc_ref: String,
    pub source_file: String,
    pub chunk_count: usize,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPage {
    pub documents: Vec<DocumentSummary>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

/// Configuration surface for one backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub strategy: crate::strategy::IndexStrategy,
    /// Backend-specific free-form options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}
