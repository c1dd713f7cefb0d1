use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid index strategy configuration: {0}")]
    Config(String),

    #[error("document conversion failed: {0}")]
    Conversion(String),

    #[error("embedding provider failed: {0}")]
    Embedding(String),

    #[error("backend {backend} error: {details}")]
    Backend { backend: String, details: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl EngineError {
    pub fn backend(backend: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            details: details.into(),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
