pub mod elasticsearch;
pub mod qdrant;

pub use elasticsearch::ElasticsearchStore;
pub use qdrant::QdrantStore;

use crate::error::{EngineError, Result};
use crate::traits::StorageBackend;
use std::collections::HashMap;
use std::sync::Arc;

/// Explicit, caller-constructed map of backend instances. Built once at
/// startup and passed by reference; there is no global registry.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageBackend>> {
        self.backends.get(name).cloned().ok_or_else(|| {
            EngineError::Config(format!(
                "unknown backend {name:?}, registered: {:?}",
                self.names()
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
