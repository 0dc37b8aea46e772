//! The canonical item, its metadata, namespaces, snapshots, and the query
//! descriptor, per the data model: a dynamically typed value (string,
//! number, boolean, sequence, or mapping), stamped with a version vector
//! the resolver can totally order.

use std::collections::{BTreeMap, BTreeSet};

use serde_derive::{Deserialize, Serialize};

/// An opaque, dynamically typed document. Deliberately not a fixed record
/// type: callers store strings, numbers, booleans, sequences or nested
/// mappings interchangeably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Number(f64),
    Boolean(bool),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
    Null,
}

impl Value {
    pub fn is_mapping(&self) -> bool {
        matches!(self, Value::Mapping(_))
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Deep merge per the resolver's policy: recurse when both sides are
    /// mappings; otherwise the incoming value wins outright.
    pub fn deep_merge(existing: &Value, incoming: &Value) -> Value {
        match (existing, incoming) {
            (Value::Mapping(e), Value::Mapping(i)) => {
                let mut merged = e.clone();
                for (k, iv) in i {
                    let nv = match merged.get(k) {
                        Some(ev) => Value::deep_merge(ev, iv),
                        None => iv.clone(),
                    };
                    merged.insert(k.clone(), nv);
                }
                Value::Mapping(merged)
            }
            _ => incoming.clone(),
        }
    }
}

/// The three-part CRDT version vector: `<timestamp>.<counter>.<nodeId>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: i64,
    pub counter: u64,
    pub node_id: String,
}

impl Version {
    pub fn new(timestamp: i64, counter: u64, node_id: impl Into<String>) -> Self {
        Version {
            timestamp,
            counter,
            node_id: node_id.into(),
        }
    }

    /// Parses `"<timestamp>.<counter>.<nodeId>"`. Malformed parts parse as
    /// zeros/empty per the resolver's "total over any two well-formed
    /// items" contract.
    pub fn parse(s: &str) -> Version {
        let mut parts = s.splitn(3, '.');
        let timestamp = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let counter = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let node_id = parts.next().unwrap_or("").to_string();
        Version {
            timestamp,
            counter,
            node_id,
        }
    }

    pub fn render(&self) -> String {
        format!("{}.{}.{}", self.timestamp, self.counter, self.node_id)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Ordering used by the resolver: numeric on timestamp, numeric on counter,
/// lexicographic on nodeId.
impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.counter.cmp(&other.counter))
            .then(self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Open metadata mapping; recognized fields are promoted to struct fields,
/// anything else collects in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub timestamp: i64,
    pub node_id: String,
    pub version: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub merged_from: Option<Vec<String>>,
    #[serde(default)]
    pub merged_at: Option<i64>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

pub fn default_namespace() -> String {
    "default".to_string()
}

impl Metadata {
    pub fn new(timestamp: i64, node_id: impl Into<String>, version: Version) -> Self {
        Metadata {
            timestamp,
            node_id: node_id.into(),
            version: version.render(),
            namespace: default_namespace(),
            tags: BTreeSet::new(),
            source: None,
            confidence: None,
            merged_from: None,
            merged_at: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn parsed_version(&self) -> Version {
        Version::parse(&self.version)
    }
}

/// The unit of storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub category: String,
    pub key: String,
    pub value: Value,
    pub metadata: Metadata,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    #[serde(default)]
    pub ttl_ms: Option<i64>,
}

impl Item {
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Absolute expiry timestamp if a TTL is set.
    pub fn expires_at(&self) -> Option<i64> {
        self.ttl_ms.map(|ttl| self.metadata.timestamp + ttl)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at(), Some(exp) if now_ms >= exp)
    }

    pub fn composite_key(&self) -> String {
        composite_key(&self.metadata.namespace, &self.category, &self.key)
    }
}

pub fn composite_key(namespace: &str, category: &str, key: &str) -> String {
    format!("{namespace}:{category}:{key}")
}

/// Four role lists an ACL check is evaluated against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: BTreeSet<String>,
    #[serde(default)]
    pub write: BTreeSet<String>,
    #[serde(default)]
    pub delete: BTreeSet<String>,
    #[serde(default)]
    pub admin: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    Read,
    Write,
    Delete,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
}

impl Namespace {
    pub fn default_namespace() -> Namespace {
        Namespace {
            id: default_namespace(),
            name: "Default".to_string(),
            description: Some("Implicit, universally accessible namespace".to_string()),
            permissions: Permissions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub timestamp: i64,
    pub node_id: String,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Timestamp,
    Key,
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub embedding: Vec<f32>,
    pub distance_threshold: Option<f32>,
    pub top_k: usize,
}

/// Predicate applied to each candidate item after index/backend filtering.
pub type Predicate = std::sync::Arc<dyn Fn(&Item) -> bool + Send + Sync>;

#[derive(Default, Clone)]
pub struct Query {
    pub categories: Option<BTreeSet<String>>,
    pub keys: Option<BTreeSet<String>>,
    pub tags: Option<BTreeSet<String>>,
    pub namespace: Option<String>,
    pub time_start: Option<i64>,
    pub time_end: Option<i64>,
    pub as_of: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub sort_field: Option<SortField>,
    pub sort_direction: SortDirection,
    pub vector: Option<VectorQuery>,
    pub predicate: Option<Predicate>,
}

impl Default for SortDirection {
    fn default() -> Self {
        SortDirection::Ascending
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("categories", &self.categories)
            .field("keys", &self.keys)
            .field("tags", &self.tags)
            .field("namespace", &self.namespace)
            .field("time_start", &self.time_start)
            .field("time_end", &self.time_end)
            .field("as_of", &self.as_of)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("sort_field", &self.sort_field)
            .field("sort_direction", &self.sort_direction)
            .field("has_vector", &self.vector.is_some())
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Query {
    pub fn matches_filters(&self, item: &Item) -> bool {
        if let Some(cats) = &self.categories {
            if !cats.contains(&item.category) {
                return false;
            }
        }
        if let Some(keys) = &self.keys {
            if !keys.contains(&item.key) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.iter().any(|t| item.metadata.tags.contains(t)) {
                return false;
            }
        }
        if let Some(ns) = &self.namespace {
            if item.metadata.namespace != *ns {
                return false;
            }
        }
        if let Some(start) = self.time_start {
            if item.metadata.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.time_end {
            if item.metadata.timestamp > end {
                return false;
            }
        }
        if let Some(as_of) = self.as_of {
            if item.metadata.timestamp > as_of {
                return false;
            }
        }
        if let Some(pred) = &self.predicate {
            if !pred(item) {
                return false;
            }
        }
        true
    }
}
