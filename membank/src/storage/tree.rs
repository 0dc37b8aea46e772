//! The tree backend: one markdown file per item under a category/namespace
//! directory layout, suitable for version-control sharing. A sidecar JSON
//! index gives O(1) lookup without re-walking the tree on every query.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::storage::{Backend, BackendStats};
use crate::value::{Item, Metadata, Query, SortDirection, SortField, Value, Version};

const SIDECAR_INDEX_NAME: &str = ".memory-index.json";
const VECTOR_MARKER: &str = "<!-- Vector Embedding -->";

/// Sidecar index entry: identity plus enough metadata to satisfy query
/// filters without reading the file from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    category: String,
    key: String,
    namespace: String,
    path: String,
    metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrontMatter {
    id: String,
    category: String,
    /// The original, unsanitized key — preserved here because the filename
    /// on disk is sanitized and the index rebuild has no other source of
    /// truth for it.
    key: String,
    created: String,
    version: String,
    namespace: String,
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    merged_from: Option<Vec<String>>,
    #[serde(default)]
    merged_at: Option<i64>,
    #[serde(default)]
    ttl_ms: Option<i64>,
}

/// Maps a category to its subdirectory per the fixed root layout; unknown
/// categories fall under `shared-knowledge/<category>/`.
fn category_dir(category: &str) -> String {
    match category {
        "agent-sessions" | "coordination" | "project-memory" | "github-integration" => {
            category.to_string()
        }
        other => format!("shared-knowledge/{other}"),
    }
}

/// Sanitizes a key into a filesystem-safe filename: lowercase, whitespace to
/// `-`, reserved characters to `-`, truncated to 255 chars, `.md` extension.
fn sanitize_filename(key: &str) -> String {
    const RESERVED: &str = "<>:\"/\\|?*";
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_whitespace() || RESERVED.contains(c) { '-' } else { c })
        .collect::<String>()
        .to_lowercase();
    sanitized.chars().take(255).collect()
}

fn item_path(root: &Path, namespace: &str, category: &str, key: &str) -> PathBuf {
    root.join(category_dir(category))
        .join(namespace)
        .join(format!("{}.md", sanitize_filename(key)))
}

fn extract_fenced_json(body: &str) -> Option<String> {
    let start = body.find("```json")?;
    let after_fence = &body[start + "```json".len()..];
    let end = after_fence.find("```")?;
    Some(after_fence[..end].trim().to_string())
}

fn decode_body(body: &str) -> Value {
    let trimmed = body.trim();
    if let Some(inner) = extract_fenced_json(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(&inner) {
            return v;
        }
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return v;
    }
    Value::String(body.trim_end().to_string())
}

fn encode_body(value: &Value, pretty_print: bool) -> CResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => {
            if pretty_print {
                let json = serde_json::to_string_pretty(other)?;
                Ok(format!("```json\n{json}\n```"))
            } else {
                Ok(serde_json::to_string(other)?)
            }
        }
    }
}

fn render_file(item: &Item, pretty_print: bool) -> CResult<String> {
    let front = FrontMatter {
        id: item.id.clone(),
        category: item.category.clone(),
        key: item.key.clone(),
        created: chrono_like_iso8601(item.metadata.timestamp),
        version: item.metadata.version.clone(),
        namespace: item.metadata.namespace.clone(),
        node_id: item.metadata.node_id.clone(),
        tags: item.metadata.tags.clone(),
        source: item.metadata.source.clone(),
        confidence: item.metadata.confidence,
        merged_from: item.metadata.merged_from.clone(),
        merged_at: item.metadata.merged_at,
        ttl_ms: item.ttl_ms,
    };
    let yaml = serde_yaml::to_string(&front)?;
    let body = encode_body(&item.value, pretty_print)?;

    let mut out = String::new();
    out.push_str(&format!("# {}\n", item.key));
    out.push_str("---\n");
    out.push_str(&yaml);
    out.push_str("---\n\n");
    out.push_str(&body);

    if let Some(vector) = &item.vector {
        out.push_str("\n\n");
        out.push_str(VECTOR_MARKER);
        out.push('\n');
        out.push_str("<!-- ");
        out.push_str(&serde_json::to_string(vector)?);
        out.push_str(" -->");
    }

    Ok(out)
}

fn parse_file(content: &str) -> CResult<(FrontMatter, String, Option<Vec<f32>>)> {
    let mut after_title = content.splitn(2, "---\n");
    let _title = after_title.next();
    let rest = after_title
        .next()
        .ok_or_else(|| Error::Parse("tree item missing frontmatter delimiter".into()))?;

    let mut fm_and_body = rest.splitn(2, "---\n");
    let yaml_str = fm_and_body.next().unwrap_or("");
    let remainder = fm_and_body.next().unwrap_or("");
    let body_and_vector = remainder.trim_start_matches('\n');

    let front: FrontMatter = serde_yaml::from_str(yaml_str)?;

    let (body, vector) = match body_and_vector.find(VECTOR_MARKER) {
        Some(idx) => {
            let body_part = body_and_vector[..idx].trim_end().to_string();
            let tail = &body_and_vector[idx + VECTOR_MARKER.len()..];
            let vector = tail
                .find("<!--")
                .and_then(|start| {
                    let after = &tail[start + "<!--".len()..];
                    after.find("-->").map(|end| after[..end].trim().to_string())
                })
                .and_then(|json| serde_json::from_str::<Vec<f32>>(&json).ok());
            (body_part, vector)
        }
        None => (body_and_vector.trim_end().to_string(), None),
    };

    Ok((front, body, vector))
}

fn chrono_like_iso8601(timestamp_ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn front_matter_to_item(front: FrontMatter, body: String, vector: Option<Vec<f32>>) -> Item {
    let mut metadata = Metadata::new(
        Version::parse(&front.version).timestamp,
        front.node_id,
        Version::parse(&front.version),
    );
    metadata.namespace = front.namespace;
    metadata.tags = front.tags;
    metadata.source = front.source;
    metadata.confidence = front.confidence;
    metadata.merged_from = front.merged_from;
    metadata.merged_at = front.merged_at;

    Item {
        id: front.id,
        category: front.category,
        key: front.key.clone(),
        value: decode_body(&body),
        metadata,
        vector,
        ttl_ms: front.ttl_ms,
    }
}

/// One markdown file per item, with a JSON sidecar index for fast lookup.
pub struct TreeBackend {
    root: PathBuf,
    pretty_print: bool,
    /// Best-effort external VCS command (e.g. `git add <path>`), invoked
    /// after writes/deletes; failures never abort the operation.
    vcs_hook: Option<String>,
    index: BTreeMap<String, IndexEntry>,
}

impl TreeBackend {
    pub fn new(root: PathBuf, pretty_print: bool) -> Self {
        Self {
            root,
            pretty_print,
            vcs_hook: None,
            index: BTreeMap::new(),
        }
    }

    pub fn with_vcs_hook(mut self, command: impl Into<String>) -> Self {
        self.vcs_hook = Some(command.into());
        self
    }

    fn index_key(namespace: &str, category: &str, key: &str) -> String {
        crate::value::composite_key(namespace, category, key)
    }

    fn sidecar_path(&self) -> PathBuf {
        self.root.join(SIDECAR_INDEX_NAME)
    }

    fn load_index(&mut self) -> CResult<bool> {
        let path = self.sidecar_path();
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(&path)?;
        match serde_json::from_slice::<BTreeMap<String, IndexEntry>>(&bytes) {
            Ok(index) => {
                self.index = index;
                Ok(true)
            }
            Err(err) => {
                log::warn!("sidecar index unreadable, will rebuild: {err}");
                Ok(false)
            }
        }
    }

    fn persist_index(&self) -> CResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.index)?;
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.sidecar_path(), bytes)?;
        Ok(())
    }

    /// Walks the tree root and rebuilds the sidecar index from whatever
    /// `.md` files are found, per §4.3's "missing or unreadable" recovery
    /// path.
    fn rebuild_index(&mut self) -> CResult<()> {
        self.index.clear();
        if !self.root.exists() {
            return Ok(());
        }
        for entry in walkdir::WalkDir::new(&self.root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(err) => {
                    log::warn!("skipping unreadable tree item {:?}: {err}", entry.path());
                    continue;
                }
            };
            match parse_file(&content) {
                Ok((front, body, vector)) => {
                    let item = front_matter_to_item(front, body, vector);
                    let entry_key = Self::index_key(&item.metadata.namespace, &item.category, &item.key);
                    self.index.insert(
                        entry_key,
                        IndexEntry {
                            category: item.category.clone(),
                            key: item.key.clone(),
                            namespace: item.metadata.namespace.clone(),
                            path: entry.path().to_string_lossy().to_string(),
                            metadata: item.metadata.clone(),
                        },
                    );
                }
                Err(err) => log::warn!("skipping malformed tree item {:?}: {err}", entry.path()),
            }
        }
        self.persist_index()
    }

    fn run_vcs_hook(&self, path: &Path, action: &str) {
        let Some(command) = &self.vcs_hook else { return };
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("{command} {action} {}", path.display()))
            .status();
        if let Err(err) = status {
            log::warn!("vcs hook failed for {:?}: {err}", path);
        }
    }

    fn read_item(&self, entry: &IndexEntry) -> CResult<Option<Item>> {
        let path = PathBuf::from(&entry.path);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let (front, body, vector) = parse_file(&content)?;
        Ok(Some(front_matter_to_item(front, body, vector)))
    }

    /// Substring search across file bodies, optionally scoped to
    /// categories, with an early-exit limit.
    pub fn search(&self, needle: &str, categories: Option<&BTreeSet<String>>, limit: usize) -> CResult<Vec<Item>> {
        let mut results = Vec::new();
        for entry in self.index.values() {
            if let Some(cats) = categories {
                if !cats.contains(&entry.category) {
                    continue;
                }
            }
            if let Some(item) = self.read_item(entry)? {
                let matches = match &item.value {
                    Value::String(s) => s.contains(needle),
                    other => serde_json::to_string(other).map(|s| s.contains(needle)).unwrap_or(false),
                };
                if matches {
                    results.push(item);
                    if results.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(results)
    }
}

impl Backend for TreeBackend {
    fn initialize(&mut self) -> CResult<()> {
        std::fs::create_dir_all(&self.root)?;
        if !self.load_index()? {
            self.rebuild_index()?;
        }
        Ok(())
    }

    fn store(&mut self, item: &Item) -> CResult<()> {
        let path = item_path(&self.root, item.namespace(), &item.category, &item.key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = render_file(item, self.pretty_print)?;
        let mut file = std::fs::File::create(&path)?;
        file.write_all(rendered.as_bytes())?;

        let entry_key = Self::index_key(item.namespace(), &item.category, &item.key);
        self.index.insert(
            entry_key,
            IndexEntry {
                category: item.category.clone(),
                key: item.key.clone(),
                namespace: item.namespace().to_string(),
                path: path.to_string_lossy().to_string(),
                metadata: item.metadata.clone(),
            },
        );
        self.persist_index()?;
        self.run_vcs_hook(&path, "add");
        Ok(())
    }

    fn get(&mut self, namespace: &str, category: &str, key: &str) -> CResult<Option<Item>> {
        let entry_key = Self::index_key(namespace, category, key);
        match self.index.get(&entry_key).cloned() {
            Some(entry) => self.read_item(&entry),
            None => Ok(None),
        }
    }

    fn query(&mut self, query: &Query) -> CResult<Vec<Item>> {
        let candidates: Vec<IndexEntry> = self
            .index
            .values()
            .filter(|e| {
                if let Some(cats) = &query.categories {
                    if !cats.contains(&e.category) {
                        return false;
                    }
                }
                if let Some(keys) = &query.keys {
                    if !keys.contains(&e.key) {
                        return false;
                    }
                }
                if let Some(ns) = &query.namespace {
                    if &e.namespace != ns {
                        return false;
                    }
                }
                if let Some(tags) = &query.tags {
                    if !tags.iter().any(|t| e.metadata.tags.contains(t)) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        let mut items = Vec::with_capacity(candidates.len());
        for entry in &candidates {
            if let Some(item) = self.read_item(entry)? {
                if query.matches_filters(&item) {
                    items.push(item);
                }
            }
        }

        match query.sort_field {
            Some(SortField::Timestamp) => items.sort_by_key(|i| i.metadata.timestamp),
            Some(SortField::Key) => items.sort_by(|a, b| a.key.cmp(&b.key)),
            Some(SortField::Category) => items.sort_by(|a, b| a.category.cmp(&b.category)),
            None => {}
        }
        if query.sort_direction == SortDirection::Descending {
            items.reverse();
        }

        let offset = query.offset.unwrap_or(0);
        let iter = items.into_iter().skip(offset);
        Ok(match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn delete(&mut self, namespace: &str, category: &str, key: &str) -> CResult<bool> {
        let entry_key = Self::index_key(namespace, category, key);
        match self.index.remove(&entry_key) {
            Some(entry) => {
                let path = PathBuf::from(&entry.path);
                let existed = path.exists();
                if existed {
                    std::fs::remove_file(&path)?;
                }
                self.persist_index()?;
                self.run_vcs_hook(&path, "remove");
                Ok(existed)
            }
            None => Ok(false),
        }
    }

    fn update(
        &mut self,
        namespace: &str,
        category: &str,
        key: &str,
        now_ms: i64,
        mutate: &dyn Fn(&mut Item),
    ) -> CResult<bool> {
        let Some(mut item) = self.get(namespace, category, key)? else {
            return Ok(false);
        };
        mutate(&mut item);
        item.metadata
            .extra
            .insert("updated_at".to_string(), Value::Number(now_ms as f64));
        self.store(&item)?;
        Ok(true)
    }

    fn get_stats(&mut self) -> CResult<BackendStats> {
        let mut categories = BTreeSet::new();
        let mut oldest = None;
        let mut newest = None;
        let mut total_bytes = 0u64;
        for entry in self.index.values() {
            categories.insert(entry.category.clone());
            let ts = entry.metadata.timestamp;
            oldest = Some(oldest.map_or(ts, |o: i64| o.min(ts)));
            newest = Some(newest.map_or(ts, |n: i64| n.max(ts)));
            if let Ok(meta) = std::fs::metadata(&entry.path) {
                total_bytes += meta.len();
            }
        }
        Ok(BackendStats {
            item_count: self.index.len() as u64,
            category_count: categories.len() as u64,
            total_bytes,
            oldest_timestamp: oldest,
            newest_timestamp: newest,
        })
    }

    fn close(&mut self) -> CResult<()> {
        self.persist_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Metadata, Version};

    fn make_item(category: &str, key: &str, ns: &str, ts: i64, value: Value) -> Item {
        Item {
            id: format!("{ns}-{category}-{key}"),
            category: category.to_string(),
            key: key.to_string(),
            value,
            metadata: Metadata {
                namespace: ns.to_string(),
                ..Metadata::new(ts, "node-a", Version::new(ts, 0, "node-a"))
            },
            vector: None,
            ttl_ms: None,
        }
    }

    #[test]
    fn category_dir_maps_known_categories_flat_and_others_under_shared_knowledge() {
        assert_eq!(category_dir("coordination"), "coordination");
        assert_eq!(category_dir("code-patterns"), "shared-knowledge/code-patterns");
        assert_eq!(category_dir("anything-else"), "shared-knowledge/anything-else");
    }

    #[test]
    fn sanitize_filename_replaces_reserved_characters_and_lowercases() {
        assert_eq!(sanitize_filename("Hello World"), "hello-world");
        assert_eq!(sanitize_filename("a/b:c*d"), "a-b-c-d");
    }

    #[test]
    fn store_then_get_roundtrips_string_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = TreeBackend::new(dir.path().to_path_buf(), false);
        backend.initialize().unwrap();

        let item = make_item("note", "hello", "default", 1000, Value::String("world".into()));
        backend.store(&item).unwrap();

        let fetched = backend.get("default", "note", "hello").unwrap().unwrap();
        assert_eq!(fetched.value, Value::String("world".into()));
        assert_eq!(fetched.key, "hello");
    }

    #[test]
    fn store_then_get_roundtrips_mapping_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = TreeBackend::new(dir.path().to_path_buf(), true);
        backend.initialize().unwrap();

        let mut mapping = std::collections::BTreeMap::new();
        mapping.insert("port".to_string(), Value::Number(80.0));
        let item = make_item("cfg", "srv", "default", 1000, Value::Mapping(mapping));
        backend.store(&item).unwrap();

        let fetched = backend.get("default", "cfg", "srv").unwrap().unwrap();
        let m = fetched.value.as_mapping().unwrap();
        assert_eq!(m.get("port"), Some(&Value::Number(80.0)));
    }

    #[test]
    fn store_then_get_roundtrips_vector_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = TreeBackend::new(dir.path().to_path_buf(), false);
        backend.initialize().unwrap();

        let mut item = make_item("note", "v", "default", 1000, Value::String("x".into()));
        item.vector = Some(vec![1.0, 0.0, 0.0]);
        backend.store(&item).unwrap();

        let fetched = backend.get("default", "note", "v").unwrap().unwrap();
        assert_eq!(fetched.vector, Some(vec![1.0, 0.0, 0.0]));
    }

    #[test]
    fn sidecar_index_rebuilds_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut backend = TreeBackend::new(dir.path().to_path_buf(), false);
            backend.initialize().unwrap();
            backend
                .store(&make_item("note", "a", "default", 1000, Value::String("v".into())))
                .unwrap();
        }
        std::fs::remove_file(dir.path().join(SIDECAR_INDEX_NAME)).unwrap();

        let mut reopened = TreeBackend::new(dir.path().to_path_buf(), false);
        reopened.initialize().unwrap();
        let fetched = reopened.get("default", "note", "a").unwrap().unwrap();
        assert_eq!(fetched.value, Value::String("v".into()));
    }

    #[test]
    fn delete_removes_file_and_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = TreeBackend::new(dir.path().to_path_buf(), false);
        backend.initialize().unwrap();
        backend
            .store(&make_item("note", "k", "default", 1000, Value::String("v".into())))
            .unwrap();

        assert!(backend.delete("default", "note", "k").unwrap());
        assert!(!backend.delete("default", "note", "k").unwrap());
        assert!(backend.get("default", "note", "k").unwrap().is_none());
    }

    #[test]
    fn search_matches_substring_in_string_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = TreeBackend::new(dir.path().to_path_buf(), false);
        backend.initialize().unwrap();
        backend
            .store(&make_item("note", "a", "default", 1000, Value::String("hello world".into())))
            .unwrap();
        backend
            .store(&make_item("note", "b", "default", 1000, Value::String("goodbye".into())))
            .unwrap();

        let results = backend.search("hello", None, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "a");
    }

    #[test]
    fn keys_with_reserved_filename_characters_round_trip_original_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = TreeBackend::new(dir.path().to_path_buf(), false);
        backend.initialize().unwrap();
        let item = make_item("note", "a/b:c", "default", 1000, Value::String("v".into()));
        backend.store(&item).unwrap();

        let fetched = backend.get("default", "note", "a/b:c").unwrap().unwrap();
        assert_eq!(fetched.key, "a/b:c");
    }
}
