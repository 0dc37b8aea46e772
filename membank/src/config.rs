//! `ManagerConfig` assembles a [`crate::manager::Manager`]. The library takes
//! a plain struct, no config-file parsing — that lives in `membank-cli`.

use std::path::PathBuf;

use crate::cache::EvictionStrategy;
use crate::replication::ReplicationConfig;
use crate::resolver::ResolverMode;

#[derive(Debug, Clone)]
pub enum BackendKind {
    TabularDurable { path: PathBuf },
    TabularMemory,
    Tree { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_ms: Option<i64>,
    pub strategy: EvictionStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: 10_000,
            ttl_ms: None,
            strategy: EvictionStrategy::Lru,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub node_id: String,
    pub backend: BackendKind,
    pub cache: CacheConfig,
    pub replication: Option<ReplicationConfig>,
    pub resolver_mode: ResolverMode,
    /// Fixed embedding width for the indexer's vector store; `None`
    /// disables vector search.
    pub vector_dimensions: Option<usize>,
    pub namespaces_enabled: bool,
}

impl ManagerConfig {
    pub fn in_memory(node_id: impl Into<String>) -> Self {
        ManagerConfig {
            node_id: node_id.into(),
            backend: BackendKind::TabularMemory,
            cache: CacheConfig::default(),
            replication: None,
            resolver_mode: ResolverMode::VectorClock,
            vector_dimensions: None,
            namespaces_enabled: true,
        }
    }
}
