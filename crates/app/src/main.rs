use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use kb_index_core::{
    discover_supported_files, BackendConfig, BackendRegistry, DocumentIndexer, EmbeddingProvider,
    HashEmbedder, HybridWeights, IndexScope, IndexStrategy, PageRequest, RemoteEmbeddingClient,
    RetrievalMode, RetrievalRequest, SplitterOptions, StorageBackend, StrategyMode,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
use kb_index_core::stores::{ElasticsearchStore, QdrantStore};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kb-index", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Which registered backend serves this invocation.
    #[arg(long, value_enum, default_value_t = BackendKind::Elasticsearch)]
    backend: BackendKind,

    /// Elasticsearch base URL
    #[arg(long, default_value = "http://localhost:9200")]
    elasticsearch_url: String,

    /// Qdrant base URL
    #[arg(long, default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Backend username (basic auth)
    #[arg(long)]
    username: Option<String>,

    /// Backend password (basic auth)
    #[arg(long)]
    password: Option<String>,

    /// Backend API key
    #[arg(long, env = "KB_INDEX_API_KEY")]
    api_key: Option<String>,

    /// Index naming strategy mode
    #[arg(long, value_enum, default_value_t = StrategyModeArg::PerDataset)]
    strategy: StrategyModeArg,

    /// Index name prefix (rolling, per_dataset, per_user)
    #[arg(long, default_value = "wegent")]
    prefix: String,

    /// Verbatim index name (fixed strategy)
    #[arg(long)]
    fixed_name: Option<String>,

    /// Bucket width (rolling strategy)
    #[arg(long)]
    rolling_step: Option<u32>,

    /// OpenAI-compatible embedding endpoint; hashing embedder when omitted.
    #[arg(long, env = "KB_INDEX_EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    /// Embedding model name
    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Embedding endpoint API key
    #[arg(long, env = "KB_INDEX_EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,

    /// Embedding vector dimensions
    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    Elasticsearch,
    Qdrant,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyModeArg {
    Fixed,
    Rolling,
    PerDataset,
    PerUser,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Vector,
    Keyword,
    Hybrid,
}

#[derive(Subcommand)]
enum Command {
    /// Index a file, or every supported file under a folder.
    Index {
        /// Knowledge base identifier
        #[arg(long)]
        knowledge_id: String,
        /// File or folder to index
        #[arg(long)]
        path: String,
        /// Document reference; defaults to the file name
        #[arg(long)]
        doc_ref: Option<String>,
        /// Maximum chunk size in characters
        #[arg(long, default_value = "1024")]
        chunk_size: usize,
        /// Characters carried over between chunks
        #[arg(long, default_value = "128")]
        chunk_overlap: usize,
    },
    /// Query a knowledge base.
    Search {
        #[arg(long)]
        knowledge_id: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "10")]
        top_k: usize,
        #[arg(long, value_enum, default_value_t = ModeArg::Vector)]
        mode: ModeArg,
        /// Vector weight for hybrid mode; keyword weight is the complement.
        #[arg(long, default_value = "0.7")]
        vector_weight: f64,
        #[arg(long, default_value = "0.0")]
        score_threshold: f64,
    },
    /// Remove every chunk of a document.
    Delete {
        #[arg(long)]
        knowledge_id: String,
        #[arg(long)]
        doc_ref: String,
    },
    /// Show one document's summary.
    Get {
        #[arg(long)]
        knowledge_id: String,
        #[arg(long)]
        doc_ref: String,
    },
    /// List indexed documents, paginated.
    List {
        #[arg(long)]
        knowledge_id: String,
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        page_size: usize,
    },
    /// Probe backend liveness.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let strategy = IndexStrategy {
        mode: match cli.strategy {
            StrategyModeArg::Fixed => StrategyMode::Fixed,
            StrategyModeArg::Rolling => StrategyMode::Rolling,
            StrategyModeArg::PerDataset => StrategyMode::PerDataset,
            StrategyModeArg::PerUser => StrategyMode::PerUser,
        },
        prefix: Some(cli.prefix.clone()),
        fixed_name: cli.fixed_name.clone(),
        rolling_step: cli.rolling_step,
    };

    let registry = BackendRegistry::new()
        .register(
            "elasticsearch",
            Arc::new(ElasticsearchStore::new(&BackendConfig {
                url: cli.elasticsearch_url.clone(),
                username: cli.username.clone(),
                password: cli.password.clone(),
                api_key: cli.api_key.clone(),
                strategy: strategy.clone(),
                options: BTreeMap::new(),
            })?) as Arc<dyn StorageBackend>,
        )
        .register(
            "qdrant",
            Arc::new(QdrantStore::new(&BackendConfig {
                url: cli.qdrant_url.clone(),
                username: None,
                password: None,
                api_key: cli.api_key.clone(),
                strategy: strategy.clone(),
                options: BTreeMap::new(),
            })?) as Arc<dyn StorageBackend>,
        );

    let backend = registry.get(match cli.backend {
        BackendKind::Elasticsearch => "elasticsearch",
        BackendKind::Qdrant => "qdrant",
    })?;

    let embedder: Arc<dyn EmbeddingProvider> = match &cli.embedding_endpoint {
        Some(endpoint) => Arc::new(RemoteEmbeddingClient::new(
            endpoint,
            &cli.embedding_model,
            cli.embedding_api_key.clone(),
            cli.embedding_dimensions,
        )),
        None => Arc::new(HashEmbedder {
            dimensions: cli.embedding_dimensions,
        }),
    };

    match cli.command {
        Command::Index {
            knowledge_id,
            path,
            doc_ref,
            chunk_size,
            chunk_overlap,
        } => {
            let indexer = DocumentIndexer::new(backend, embedder)?;
            let options = SplitterOptions {
                chunk_size,
                chunk_overlap,
                ..SplitterOptions::default()
            };

            let target = Path::new(&path);
            let files = if target.is_dir() {
                let discovered = discover_supported_files(target);
                if discovered.is_empty() {
                    bail!("no supported files found under {path}");
                }
                discovered
            } else {
                vec![target.to_path_buf()]
            };

            info!(count = files.len(), knowledge_id, "indexing files");
            for file in files {
                let reference = doc_ref.clone().unwrap_or_else(|| {
                    file.file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .unwrap_or_else(|| file.to_string_lossy().to_string())
                });
                match indexer
                    .index_document(&knowledge_id, &file, &reference, &options)
                    .await
                {
                    Ok(outcome) => println!(
                        "{}: {} chunks -> {} at {}",
                        file.display(),
                        outcome.indexed_count,
                        outcome.index_name,
                        outcome.created_at.to_rfc3339()
                    ),
                    Err(error) => {
                        warn!(path = %file.display(), %error, "indexing failed");
                        bail!("failed to index {}: {error}", file.display());
                    }
                }
            }
        }
        Command::Search {
            knowledge_id,
            query,
            top_k,
            mode,
            vector_weight,
            score_threshold,
        } => {
            let mode = match mode {
                ModeArg::Vector => RetrievalMode::Vector,
                ModeArg::Keyword => RetrievalMode::Keyword,
                ModeArg::Hybrid => RetrievalMode::Hybrid,
            };
            let mut request = RetrievalRequest::new(query, top_k, mode)
                .context("invalid retrieval request")?
                .with_score_threshold(score_threshold);
            if mode == RetrievalMode::Hybrid {
                let weights = HybridWeights::new(vector_weight, 1.0 - vector_weight)
                    .context("invalid hybrid weights")?;
                request = request.with_hybrid_weights(weights);
            }

            let index_name = backend.resolve_index_name(&IndexScope::knowledge(&knowledge_id))?;
            let hits = backend
                .retrieve(&index_name, &request, embedder.as_ref())
                .await?;

            println!("index: {index_name} hits: {}", hits.len());
            for hit in hits {
                println!("[{:.4}] {}", hit.score, hit.title);
                println!("  {}", hit.content.replace('\n', "\n  "));
            }
        }
        Command::Delete {
            knowledge_id,
            doc_ref,
        } => {
            let index_name = backend.resolve_index_name(&IndexScope::knowledge(&knowledge_id))?;
            backend.delete_document(&index_name, &doc_ref).await?;
            println!("deleted {doc_ref} from {index_name} at {}", Utc::now().to_rfc3339());
        }
        Command::Get {
            knowledge_id,
            doc_ref,
        } => {
            let index_name = backend.resolve_index_name(&IndexScope::knowledge(&knowledge_id))?;
            match backend.get_document(&index_name, &doc_ref).await? {
                Some(summary) => println!(
                    "{}: {} chunks, source={}",
                    summary.doc_ref, summary.chunk_count, summary.source_file
                ),
                None => println!("document {doc_ref} not found in {index_name}"),
            }
        }
        Command::List {
            knowledge_id,
            page,
            page_size,
        } => {
            let index_name = backend.resolve_index_name(&IndexScope::knowledge(&knowledge_id))?;
            let listing = backend
                .list_documents(&index_name, PageRequest { page, page_size })
                .await?;
            println!(
                "index: {index_name} page {}/{} total {}",
                listing.page,
                listing.total.div_ceil(listing.page_size.max(1)).max(1),
                listing.total
            );
            for document in listing.documents {
                println!(
                    "{}  chunks={}  source={}",
                    document.doc_ref, document.chunk_count, document.source_file
                );
            }
        }
        Command::Health => {
            let healthy = backend.health_check().await;
            println!("{}: {}", backend.name(), if healthy { "up" } else { "down" });
            if !healthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
