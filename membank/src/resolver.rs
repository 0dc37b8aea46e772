//! Deterministic conflict resolution over two items sharing a
//! (namespace,category,key). Pure and total: every pair of well-formed
//! items has a defined outcome, never an error.

use crate::value::{Item, Metadata, Value};

/// Conflict resolution mode selected by replication config (§4.6).
pub trait Resolver: Send + Sync {
    /// Resolve existing item `e` against incoming item `i`; both share a
    /// (namespace, category, key). `now_ms` and `local_node_id` are supplied
    /// by the caller so merges stamp a fresh, locally-ordered version.
    fn resolve(&self, e: &Item, i: &Item, now_ms: i64, local_node_id: &str, next_counter: u64) -> Item;
}

/// The vector-clock resolver described in §4.1: orders by version, merges
/// mapping values on exact-version collisions.
pub struct VectorClockResolver;

impl Resolver for VectorClockResolver {
    fn resolve(&self, e: &Item, i: &Item, now_ms: i64, local_node_id: &str, next_counter: u64) -> Item {
        let ev = e.metadata.parsed_version();
        let iv = i.metadata.parsed_version();

        match ev.cmp(&iv) {
            std::cmp::Ordering::Less => i.clone(),
            std::cmp::Ordering::Greater => e.clone(),
            std::cmp::Ordering::Equal => merge(e, i, now_ms, local_node_id, next_counter),
        }
    }
}

/// Last-write-wins resolver: version comparison only, never merges. On an
/// exact tie, the incoming write is adopted (arbitrary but deterministic).
pub struct LastWriteWinsResolver;

impl Resolver for LastWriteWinsResolver {
    fn resolve(&self, e: &Item, i: &Item, _now_ms: i64, _local_node_id: &str, _next_counter: u64) -> Item {
        let ev = e.metadata.parsed_version();
        let iv = i.metadata.parsed_version();
        if ev > iv {
            e.clone()
        } else {
            i.clone()
        }
    }
}

/// Deep-merges mapping values, shallow-merges metadata (incoming overrides),
/// records `mergedFrom`/`mergedAt`, and rebases the version to a fresh local
/// write so future comparisons order correctly.
fn merge(e: &Item, i: &Item, now_ms: i64, local_node_id: &str, next_counter: u64) -> Item {
    let value = match (&e.value, &i.value) {
        (Value::Mapping(_), Value::Mapping(_)) => Value::deep_merge(&e.value, &i.value),
        _ => i.value.clone(),
    };

    let mut metadata = e.metadata.clone();
    metadata.tags.extend(i.metadata.tags.iter().cloned());
    if i.metadata.source.is_some() {
        metadata.source = i.metadata.source.clone();
    }
    if i.metadata.confidence.is_some() {
        metadata.confidence = i.metadata.confidence;
    }
    for (k, v) in &i.metadata.extra {
        metadata.extra.insert(k.clone(), v.clone());
    }

    metadata.merged_from = Some(vec![e.metadata.node_id.clone(), i.metadata.node_id.clone()]);
    metadata.merged_at = Some(now_ms);
    metadata.timestamp = now_ms;
    metadata.node_id = local_node_id.to_string();
    metadata.version = crate::value::Version::new(now_ms, next_counter, local_node_id).render();

    Item {
        id: e.id.clone(),
        category: e.category.clone(),
        key: e.key.clone(),
        value,
        metadata,
        vector: i.vector.clone().or_else(|| e.vector.clone()),
        ttl_ms: i.ttl_ms.or(e.ttl_ms),
    }
}

/// Builds a resolver for the configured mode. `Custom` is represented by the
/// caller simply constructing their own `Box<dyn Resolver>` rather than going
/// through this function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverMode {
    LastWriteWins,
    VectorClock,
}

pub fn resolver_for_mode(mode: ResolverMode) -> Box<dyn Resolver> {
    match mode {
        ResolverMode::LastWriteWins => Box::new(LastWriteWinsResolver),
        ResolverMode::VectorClock => Box::new(VectorClockResolver),
    }
}
