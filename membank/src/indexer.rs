//! Secondary indices the backends can't answer cheaply: category→keys,
//! tag→keys, a denormalized composite (namespace,category,key)→item handle,
//! and a brute-force vector store with cosine-similarity nearest-neighbor
//! search.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::CResult;
use crate::storage::Backend;
use crate::value::{composite_key, Item, VectorQuery};

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub item: Item,
    pub score: f32,
    pub distance: f32,
}

struct VectorEntry {
    item_id: String,
    embedding: Vec<f32>,
}

pub struct Indexer {
    dimensions: Option<usize>,
    by_category: BTreeMap<String, BTreeSet<String>>,
    by_tag: BTreeMap<String, BTreeSet<String>>,
    composite: BTreeMap<String, Item>,
    vectors: BTreeMap<String, VectorEntry>,
}

impl Indexer {
    pub fn new(dimensions: Option<usize>) -> Self {
        Indexer {
            dimensions,
            by_category: BTreeMap::new(),
            by_tag: BTreeMap::new(),
            composite: BTreeMap::new(),
            vectors: BTreeMap::new(),
        }
    }

    pub fn supports_vector_search(&self) -> bool {
        self.dimensions.is_some()
    }

    /// Rebuilds all indices from the backend's full contents. Called when
    /// index corruption is detected, or at startup.
    pub fn initialize(&mut self, backend: &mut dyn Backend) -> CResult<()> {
        self.by_category.clear();
        self.by_tag.clear();
        self.composite.clear();
        self.vectors.clear();

        let all = backend.query(&crate::value::Query::default())?;
        for item in all {
            self.index(&item);
        }
        Ok(())
    }

    pub fn index(&mut self, item: &Item) {
        let ck = composite_key(item.namespace(), &item.category, &item.key);

        self.by_category
            .entry(item.category.clone())
            .or_default()
            .insert(ck.clone());

        for tag in &item.metadata.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(ck.clone());
        }

        if let Some(embedding) = &item.vector {
            self.vectors.insert(
                item.id.clone(),
                VectorEntry {
                    item_id: item.id.clone(),
                    embedding: embedding.clone(),
                },
            );
        }

        self.composite.insert(ck, item.clone());
    }

    pub fn remove(&mut self, namespace: &str, category: &str, key: &str) {
        let ck = composite_key(namespace, category, key);
        if let Some(item) = self.composite.remove(&ck) {
            if let Some(set) = self.by_category.get_mut(category) {
                set.remove(&ck);
            }
            for tag in &item.metadata.tags {
                if let Some(set) = self.by_tag.get_mut(tag) {
                    set.remove(&ck);
                }
            }
            self.vectors.remove(&item.id);
        }
    }

    pub fn get(&self, namespace: &str, category: &str, key: &str) -> Option<&Item> {
        self.composite.get(&composite_key(namespace, category, key))
    }

    pub fn keys_for_category(&self, category: &str) -> BTreeSet<String> {
        self.by_category.get(category).cloned().unwrap_or_default()
    }

    pub fn keys_for_tag(&self, tag: &str) -> BTreeSet<String> {
        self.by_tag.get(tag).cloned().unwrap_or_default()
    }

    pub fn vector_search(&self, query: &VectorQuery) -> Vec<ScoredItem> {
        let mut scored: Vec<ScoredItem> = self
            .vectors
            .values()
            .filter_map(|entry| {
                let score = cosine_similarity(&query.embedding, &entry.embedding);
                let distance = 1.0 - score;
                if let Some(threshold) = query.distance_threshold {
                    if distance > threshold {
                        return None;
                    }
                }
                self.composite
                    .values()
                    .find(|item| item.id == entry.item_id)
                    .map(|item| ScoredItem {
                        item: item.clone(),
                        score,
                        distance,
                    })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(query.top_k.max(1));
        scored
    }

    pub fn close(&mut self) -> CResult<()> {
        Ok(())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
