//! The tabular backend: an embedded ordered key-value store (the teacher's
//! byte-oriented [`Engine`]) with an `Item`/namespace/category/key contract
//! layered on top. Composite keys are encoded so the engine's lexicographic
//! order groups by namespace, then category, then key, which makes
//! namespace- and category-scoped scans cheap prefix scans.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::log_cask::LogCask;
use crate::storage::memory::Memory;
use crate::storage::{Backend, BackendStats};
use crate::value::{Item, Query, SortDirection, SortField};

const SEQ_COUNTER_KEY: &[u8] = b"\x00__membank_seq_counter__";
const SEP: u8 = 0;

fn composite_engine_key(namespace: &str, category: &str, key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(namespace.len() + category.len() + key.len() + 2);
    buf.extend_from_slice(namespace.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(category.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(key.as_bytes());
    buf
}

fn namespace_prefix(namespace: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(namespace.len() + 1);
    buf.extend_from_slice(namespace.as_bytes());
    buf.push(SEP);
    buf
}

/// Generic over the byte engine so both `LogCask` (durable) and `Memory`
/// (ephemeral, test-friendly) back the same contract.
pub struct TabularBackend<E: Engine> {
    engine: E,
}

pub type DurableTabularBackend = TabularBackend<LogCask>;
pub type MemoryTabularBackend = TabularBackend<Memory>;

impl DurableTabularBackend {
    pub fn open(path: PathBuf) -> CResult<Self> {
        Ok(Self {
            engine: LogCask::new(path)?,
        })
    }
}

impl MemoryTabularBackend {
    pub fn new_in_memory() -> Self {
        Self { engine: Memory::new() }
    }
}

impl<E: Engine> TabularBackend<E> {
    fn encode(seq: u64, item: &Item) -> CResult<Vec<u8>> {
        let json = serde_json::to_vec(item)?;
        let mut buf = Vec::with_capacity(8 + json.len());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> CResult<(u64, Item)> {
        if bytes.len() < 8 {
            return Err(Error::Parse("tabular record shorter than sequence header".into()));
        }
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&bytes[..8]);
        let seq = u64::from_be_bytes(seq_bytes);
        let item: Item = serde_json::from_slice(&bytes[8..])?;
        Ok((seq, item))
    }

    fn next_seq(&mut self) -> CResult<u64> {
        let current = match self.engine.get(SEQ_COUNTER_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes);
                u64::from_be_bytes(b)
            }
            _ => 0,
        };
        self.engine.set(SEQ_COUNTER_KEY, (current + 1).to_be_bytes().to_vec())?;
        Ok(current)
    }

    /// Scans all stored items, skipping the reserved sequence counter key
    /// and any record that fails to decode (logged, not fatal, per §4.2).
    fn scan_all(&mut self) -> CResult<Vec<(u64, Item)>> {
        let mut out = Vec::new();
        for entry in self.engine.scan(..) {
            let (key, value) = entry?;
            if key == SEQ_COUNTER_KEY {
                continue;
            }
            match Self::decode(&value) {
                Ok(pair) => out.push(pair),
                Err(err) => log::warn!("skipping malformed tabular record: {err}"),
            }
        }
        Ok(out)
    }

    fn scan_namespace(&mut self, namespace: &str) -> CResult<Vec<(u64, Item)>> {
        let prefix = namespace_prefix(namespace);
        let mut out = Vec::new();
        for entry in self.engine.scan_prefix(&prefix) {
            let (_, value) = entry?;
            match Self::decode(&value) {
                Ok(pair) => out.push(pair),
                Err(err) => log::warn!("skipping malformed tabular record: {err}"),
            }
        }
        Ok(out)
    }
}

impl<E: Engine> Backend for TabularBackend<E> {
    fn initialize(&mut self) -> CResult<()> {
        Ok(())
    }

    fn store(&mut self, item: &Item) -> CResult<()> {
        let ck = composite_engine_key(item.namespace(), &item.category, &item.key);
        let seq = match self.engine.get(&ck)? {
            Some(existing) => Self::decode(&existing).map(|(seq, _)| seq).unwrap_or(0),
            None => self.next_seq()?,
        };
        let payload = Self::encode(seq, item)?;
        self.engine.set(&ck, payload)?;
        Ok(())
    }

    fn get(&mut self, namespace: &str, category: &str, key: &str) -> CResult<Option<Item>> {
        let ck = composite_engine_key(namespace, category, key);
        match self.engine.get(&ck)? {
            None => Ok(None),
            Some(bytes) => {
                let (_, item) = Self::decode(&bytes)?;
                Ok(Some(item))
            }
        }
    }

    fn query(&mut self, query: &Query) -> CResult<Vec<Item>> {
        let mut rows = match &query.namespace {
            Some(ns) => self.scan_namespace(ns)?,
            None => self.scan_all()?,
        };

        rows.retain(|(_, item)| query.matches_filters(item));

        match query.sort_field {
            Some(SortField::Timestamp) => {
                rows.sort_by(|(sa, a), (sb, b)| a.metadata.timestamp.cmp(&b.metadata.timestamp).then(sa.cmp(sb)))
            }
            Some(SortField::Key) => {
                rows.sort_by(|(sa, a), (sb, b)| a.key.cmp(&b.key).then(sa.cmp(sb)))
            }
            Some(SortField::Category) => {
                rows.sort_by(|(sa, a), (sb, b)| a.category.cmp(&b.category).then(sa.cmp(sb)))
            }
            None => rows.sort_by(|(sa, _), (sb, _)| sa.cmp(sb)),
        }

        if query.sort_direction == SortDirection::Descending {
            rows.reverse();
        }

        let items: Vec<Item> = rows.into_iter().map(|(_, item)| item).collect();
        let offset = query.offset.unwrap_or(0);
        let iter = items.into_iter().skip(offset);
        Ok(match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn delete(&mut self, namespace: &str, category: &str, key: &str) -> CResult<bool> {
        let ck = composite_engine_key(namespace, category, key);
        let existed = self.engine.get(&ck)?.is_some();
        self.engine.delete(&ck)?;
        Ok(existed)
    }

    fn update(
        &mut self,
        namespace: &str,
        category: &str,
        key: &str,
        now_ms: i64,
        mutate: &dyn Fn(&mut Item),
    ) -> CResult<bool> {
        let ck = composite_engine_key(namespace, category, key);
        let Some(bytes) = self.engine.get(&ck)? else {
            return Ok(false);
        };
        let (seq, mut item) = Self::decode(&bytes)?;
        mutate(&mut item);
        item.metadata.extra.insert(
            "updated_at".to_string(),
            crate::value::Value::Number(now_ms as f64),
        );
        let payload = Self::encode(seq, &item)?;
        self.engine.set(&ck, payload)?;
        Ok(true)
    }

    fn get_stats(&mut self) -> CResult<BackendStats> {
        let rows = self.scan_all()?;
        let mut categories = BTreeSet::new();
        let mut total_bytes = 0u64;
        let mut oldest = None;
        let mut newest = None;
        for (_, item) in &rows {
            categories.insert(item.category.clone());
            total_bytes += serde_json::to_vec(item).map(|v| v.len() as u64).unwrap_or(0);
            let ts = item.metadata.timestamp;
            oldest = Some(oldest.map_or(ts, |o: i64| o.min(ts)));
            newest = Some(newest.map_or(ts, |n: i64| n.max(ts)));
        }
        Ok(BackendStats {
            item_count: rows.len() as u64,
            category_count: categories.len() as u64,
            total_bytes,
            oldest_timestamp: oldest,
            newest_timestamp: newest,
        })
    }

    fn close(&mut self) -> CResult<()> {
        self.engine.flush()
    }
}
