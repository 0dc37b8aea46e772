//! Single entry point coordinating backend, cache, indexer, resolver,
//! replication and namespaces (§4.8).

use std::collections::BTreeSet;

use chrono::Utc;

use crate::cache::Cache;
use crate::config::{BackendKind, ManagerConfig};
use crate::error::{CResult, Error};
use crate::events::{Event, EventBus};
use crate::indexer::Indexer;
use crate::namespace::NamespaceManager;
use crate::replication::{Envelope, Replicator};
use crate::resolver::{resolver_for_mode, Resolver};
use crate::storage::tabular::{DurableTabularBackend, MemoryTabularBackend};
use crate::storage::tree::TreeBackend;
use crate::storage::{Backend, BackendStats};
use crate::value::{composite_key, default_namespace, Action, Item, Metadata, Query, Value, Version};

const COUNTER_NAMESPACE: &str = "__system__";
const COUNTER_CATEGORY: &str = "__counters__";
const COUNTER_KEY: &str = "version_counter";

/// Caller-supplied fields for a new or updated item; the manager fills in
/// everything else (id, category default, random key, timestamp, version).
#[derive(Debug, Clone, Default)]
pub struct StoreRequest {
    pub value: Value,
    pub category: Option<String>,
    pub key: Option<String>,
    pub tags: BTreeSet<String>,
    pub source: Option<String>,
    pub confidence: Option<f64>,
    pub vector: Option<Vec<f32>>,
    pub ttl_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub backend: BackendStats,
    pub cache: crate::cache::CacheStats,
    pub node_id: String,
    pub replication: Option<crate::replication::ReplicationStats>,
}

pub enum ExportFormat {
    Snapshot,
    Markdown,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub namespace: Option<String>,
    pub categories: Option<BTreeSet<String>>,
    /// Requests at-rest encryption of the exported snapshot. Not
    /// implemented: rejected with `Error::ValidationError` rather than
    /// silently producing an unencrypted export.
    pub encrypt: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub namespace_override: Option<String>,
    pub merge: bool,
}

pub struct Manager {
    node_id: String,
    backend: Box<dyn Backend>,
    cache: Cache,
    indexer: Indexer,
    resolver: Box<dyn Resolver>,
    replicator: Option<Replicator>,
    namespaces: NamespaceManager,
    namespaces_enabled: bool,
    events: EventBus,
    counter: u64,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> CResult<Self> {
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::TabularMemory => Box::new(MemoryTabularBackend::new_in_memory()),
            BackendKind::TabularDurable { path } => Box::new(DurableTabularBackend::open(path)?),
            BackendKind::Tree { root } => Box::new(TreeBackend::new(root, true)),
        };
        let resolver = resolver_for_mode(config.resolver_mode);
        let mut manager = Manager {
            node_id: config.node_id,
            backend,
            cache: Cache::new(config.cache.max_size, config.cache.ttl_ms, config.cache.strategy),
            indexer: Indexer::new(config.vector_dimensions),
            resolver,
            replicator: None,
            namespaces: NamespaceManager::new(),
            namespaces_enabled: config.namespaces_enabled,
            events: EventBus::new(),
            counter: 0,
        };
        manager.initialize()?;
        Ok(manager)
    }

    /// Wires a transport in after construction; replication config isn't
    /// required to build a standalone single-node manager.
    pub fn with_replication(mut self, replicator: Replicator) -> Self {
        self.replicator = Some(replicator);
        self
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn initialize(&mut self) -> CResult<()> {
        self.backend.initialize()?;
        match self.indexer.initialize(self.backend.as_mut()) {
            Ok(()) => {}
            Err(e) => {
                log::warn!("indexer rebuild failed at startup, starting empty: {e}");
            }
        }
        self.counter = self.load_persisted_counter()?;
        self.events.publish(Event::Initialized);
        Ok(())
    }

    fn load_persisted_counter(&mut self) -> CResult<u64> {
        match self
            .backend
            .get(COUNTER_NAMESPACE, COUNTER_CATEGORY, COUNTER_KEY)?
        {
            Some(item) => match item.value {
                Value::Number(n) => Ok(n as u64),
                _ => Ok(0),
            },
            None => Ok(0),
        }
    }

    /// Monotonic within this node over the lifetime of the process,
    /// persisted after every increment so a restart resumes above the last
    /// value ever handed out.
    fn next_counter(&mut self) -> CResult<u64> {
        self.counter += 1;
        let now = self.now_ms();
        let mut metadata = Metadata::new(now, &self.node_id, Version::new(now, self.counter, &self.node_id));
        metadata.namespace = COUNTER_NAMESPACE.to_string();
        let item = Item {
            id: "system-version-counter".to_string(),
            category: COUNTER_CATEGORY.to_string(),
            key: COUNTER_KEY.to_string(),
            value: Value::Number(self.counter as f64),
            metadata,
            vector: None,
            ttl_ms: None,
        };
        self.backend.store(&item)?;
        Ok(self.counter)
    }

    fn check_permission(&self, principal: Option<&str>, action: Action, namespace: &str) -> CResult<()> {
        if !self.namespaces_enabled {
            return Ok(());
        }
        if let Some(p) = principal {
            if !self.namespaces.check(p, action, namespace) {
                return Err(Error::PermissionDenied(format!(
                    "'{p}' lacks {action:?} on namespace '{namespace}'"
                )));
            }
        }
        Ok(())
    }

    pub fn store(
        &mut self,
        request: StoreRequest,
        namespace: Option<String>,
        principal: Option<&str>,
    ) -> CResult<Item> {
        let ns = namespace.unwrap_or_else(default_namespace);
        self.check_permission(principal, Action::Write, &ns)?;

        let category = request.category.unwrap_or_else(|| "general".to_string());
        let key = request.key.unwrap_or_else(random_id);
        let now = self.now_ms();
        let counter = self.next_counter()?;
        let id = random_id();
        let version = Version::new(now, counter, &self.node_id);
        let mut metadata = Metadata::new(now, &self.node_id, version);
        metadata.namespace = ns.clone();
        metadata.tags = request.tags;
        metadata.source = request.source;
        metadata.confidence = request.confidence;

        let candidate = Item {
            id,
            category,
            key,
            value: request.value,
            metadata,
            vector: request.vector,
            ttl_ms: request.ttl_ms,
        };

        let existing = self.backend.get(&ns, &candidate.category, &candidate.key)?;
        let is_update = existing.is_some();
        let resolved = match &existing {
            Some(e) => self.resolver.resolve(e, &candidate, now, &self.node_id, counter),
            None => candidate,
        };

        self.backend.store(&resolved)?;
        self.cache.set(resolved.composite_key(), resolved.clone(), now);
        self.indexer.index(&resolved);

        if self.namespaces_enabled {
            self.namespaces.auto_create(&ns, principal.unwrap_or("system"));
        }

        if let Some(replicator) = &mut self.replicator {
            replicator.replicate(&Envelope::Item(resolved.clone()), &|d| std::thread::sleep(d));
        }

        self.events.publish(if is_update {
            Event::Updated(resolved.clone())
        } else {
            Event::Stored(resolved.clone())
        });

        Ok(resolved)
    }

    pub fn get(
        &mut self,
        category: &str,
        key: &str,
        namespace: Option<String>,
        principal: Option<&str>,
    ) -> CResult<Option<Item>> {
        let ns = namespace.unwrap_or_else(default_namespace);
        self.check_permission(principal, Action::Read, &ns)?;

        let ck = composite_key(&ns, category, key);
        let now = self.now_ms();

        if let Some(cached) = self.cache.get(&ck, now) {
            if !cached.is_expired(now) {
                self.events.publish(Event::CacheHit {
                    namespace: ns.clone(),
                    category: category.to_string(),
                    key: key.to_string(),
                });
                return Ok(Some(cached));
            }
        }

        let Some(item) = self.backend.get(&ns, category, key)? else {
            return Ok(None);
        };
        if item.is_expired(now) {
            return Ok(None);
        }
        if item.namespace() != ns {
            return Ok(None);
        }

        self.cache.set(ck, item.clone(), now);
        Ok(Some(item))
    }

    pub fn query(&mut self, query: &Query, principal: Option<&str>) -> CResult<Vec<Item>> {
        if let Some(ns) = &query.namespace {
            self.check_permission(principal, Action::Read, ns)?;
        }

        let now = self.now_ms();

        let mut items = if let (Some(vq), true) = (&query.vector, self.indexer.supports_vector_search()) {
            self.indexer
                .vector_search(vq)
                .into_iter()
                .map(|scored| scored.item)
                .collect::<Vec<_>>()
        } else {
            self.backend.query(query)?
        };

        items.retain(|item| {
            !item.is_expired(now) && item.category != COUNTER_CATEGORY && query.matches_filters(item)
        });
        Ok(items)
    }

    pub fn delete(
        &mut self,
        category: &str,
        key: &str,
        namespace: Option<String>,
        principal: Option<&str>,
    ) -> CResult<bool> {
        let ns = namespace.unwrap_or_else(default_namespace);
        self.check_permission(principal, Action::Delete, &ns)?;

        let ck = composite_key(&ns, category, key);
        let cache_had_it = self.cache.delete(&ck);
        let backend_had_it = self.backend.delete(&ns, category, key)?;
        self.indexer.remove(&ns, category, key);

        // Invariant-driven bug fix: replicate the tombstone iff either the
        // cache or the backend actually held the item, not only the
        // backend, else a cache-only-visible delete never propagates.
        let existed = cache_had_it || backend_had_it;

        if existed {
            if let Some(replicator) = &mut self.replicator {
                replicator.replicate(
                    &Envelope::Tombstone {
                        namespace: ns.clone(),
                        category: category.to_string(),
                        key: key.to_string(),
                    },
                    &|d| std::thread::sleep(d),
                );
            }
            self.events.publish(Event::Deleted {
                namespace: ns,
                category: category.to_string(),
                key: key.to_string(),
            });
        }

        Ok(existed)
    }

    /// Applies an incoming replicated item without re-replicating it.
    pub fn apply_replicated_item(&mut self, incoming: Item) -> CResult<Item> {
        let now = self.now_ms();
        if let Some(replicator) = &mut self.replicator {
            if replicator.is_suppressed(incoming.namespace(), &incoming.category, &incoming.key, now) {
                return Ok(incoming);
            }
        }
        let existing = self
            .backend
            .get(incoming.namespace(), &incoming.category, &incoming.key)?;
        let counter = self.next_counter()?;
        let node_id = self.node_id.clone();
        let resolved = if let Some(replicator) = &mut self.replicator {
            replicator.receive_item(existing.as_ref(), &incoming, now, &node_id, counter)
        } else {
            match &existing {
                Some(e) => self.resolver.resolve(e, &incoming, now, &node_id, counter),
                None => incoming,
            }
        };
        self.backend.store(&resolved)?;
        self.cache.set(resolved.composite_key(), resolved.clone(), now);
        self.indexer.index(&resolved);
        Ok(resolved)
    }

    /// Applies an incoming replicated tombstone without re-replicating it.
    pub fn apply_replicated_tombstone(&mut self, namespace: &str, category: &str, key: &str) -> CResult<bool> {
        let now = self.now_ms();
        let ck = composite_key(namespace, category, key);
        let cache_had_it = self.cache.delete(&ck);
        let backend_had_it = self.backend.delete(namespace, category, key)?;
        self.indexer.remove(namespace, category, key);
        let existed = cache_had_it || backend_had_it;
        if let Some(replicator) = &mut self.replicator {
            replicator.receive_tombstone(namespace, category, key, existed, now);
        }
        Ok(existed)
    }

    pub fn export(&mut self, format: ExportFormat, options: ExportOptions) -> CResult<String> {
        if options.encrypt {
            return Err(Error::ValidationError(
                "export encryption is not implemented".to_string(),
            ));
        }
        let query = Query {
            namespace: options.namespace,
            categories: options.categories,
            ..Query::default()
        };
        let items = self.query(&query, None)?;

        match format {
            ExportFormat::Snapshot => {
                let snapshot = crate::value::Snapshot {
                    format_version: 1,
                    timestamp: self.now_ms(),
                    node_id: self.node_id.clone(),
                    items,
                };
                Ok(serde_json::to_string_pretty(&snapshot)?)
            }
            ExportFormat::Markdown => Ok(render_markdown(&items, self.now_ms())),
        }
    }

    pub fn import(&mut self, snapshot: crate::value::Snapshot, options: ImportOptions) -> CResult<usize> {
        let mut count = 0;
        for mut item in snapshot.items {
            if let Some(ns) = &options.namespace_override {
                item.metadata.namespace = ns.clone();
            }
            if options.merge {
                let request = StoreRequest {
                    value: item.value,
                    category: Some(item.category),
                    key: Some(item.key),
                    tags: item.metadata.tags,
                    source: item.metadata.source,
                    confidence: item.metadata.confidence,
                    vector: item.vector,
                    ttl_ms: item.ttl_ms,
                };
                self.store(request, Some(item.metadata.namespace.clone()), None)?;
            } else {
                self.backend.store(&item)?;
                self.indexer.index(&item);
            }
            count += 1;
        }
        self.events.publish(Event::Imported { count });
        Ok(count)
    }

    pub fn get_stats(&mut self) -> CResult<ManagerStats> {
        Ok(ManagerStats {
            backend: self.backend.get_stats()?,
            cache: self.cache.get_stats(),
            node_id: self.node_id.clone(),
            replication: self.replicator.as_ref().map(|r| r.get_stats()),
        })
    }

    pub fn subscribe(&mut self) -> std::sync::mpsc::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn close(&mut self) -> CResult<()> {
        self.backend.close()?;
        self.indexer.close()?;
        if let Some(replicator) = &mut self.replicator {
            replicator.close()?;
        }
        self.cache.clear();
        self.events.publish(Event::Closed);
        Ok(())
    }
}

fn random_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

fn render_markdown(items: &[Item], now_ms: i64) -> String {
    use std::collections::BTreeMap;
    use std::fmt::Write;

    let timestamp = chrono::DateTime::<Utc>::from_timestamp_millis(now_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

    let mut by_category: BTreeMap<&str, Vec<&Item>> = BTreeMap::new();
    for item in items {
        by_category.entry(&item.category).or_default().push(item);
    }

    let mut out = String::new();
    let _ = writeln!(out, "# Memory export\n\n_generated {timestamp}_\n");
    for (category, items) in by_category {
        let _ = writeln!(out, "## {category}\n");
        for item in items {
            let _ = writeln!(out, "### {}\n", item.key);
            let _ = writeln!(out, "```json");
            let _ = writeln!(out, "{}", serde_json::to_string_pretty(item).unwrap_or_default());
            let _ = writeln!(out, "```\n");
        }
    }
    out
}
