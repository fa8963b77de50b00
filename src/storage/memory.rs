//! In-memory backend for dry runs and tests.

use object_store::memory::InMemory;
use object_store::multipart::MultipartStore;
use object_store::path::Path;
use object_store::ObjectStore;
use std::sync::Arc;

use super::{BackendConfig, StorageProvider};

/// In-memory storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub key: Option<Path>,
}

impl StorageProvider {
    pub(super) fn construct_memory(config: MemoryConfig) -> Self {
        let memory_store = Arc::new(InMemory::new());
        let multipart_store: Arc<dyn MultipartStore> = memory_store.clone();
        let object_store: Arc<dyn ObjectStore> = memory_store;

        let canonical_url = match &config.key {
            Some(key) => format!("memory://{key}"),
            None => "memory://".to_string(),
        };

        Self {
            config: BackendConfig::Memory(config),
            object_store,
            multipart_store,
            canonical_url,
        }
    }

    /// Create a fresh in-memory provider with no key prefix.
    pub fn in_memory() -> Self {
        Self::construct_memory(MemoryConfig { key: None })
    }
}
