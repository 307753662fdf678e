//! In-memory store implementing both [`RecordStore`] and [`EdgeStore`].
//!
//! This module provides [`InMemoryStore`], a store backed by `HashMap`s
//! protected by `tokio::sync::RwLock`s. Text indexes score with BM25 over
//! character trigrams. It is suitable for development, testing, and
//! datasets that fit in memory.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{LinkageError, Result};
use crate::record::{Cluster, Record, SimilarityEdge};
use crate::similarity::{char_ngrams, cosine_similarity};
use crate::store::{
    EdgeFilter, EdgeStore, FilterSet, Group, KeyField, RecordStore, ScoredId, composite_key,
};

const BACKEND: &str = "InMemory";
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
const GRAM_SIZE: usize = 3;

/// BM25 index over character trigrams of one field.
#[derive(Debug, Default)]
struct TextIndex {
    postings: HashMap<String, HashMap<String, u32>>,
    doc_len: HashMap<String, usize>,
    total_len: usize,
}

impl TextIndex {
    fn add(&mut self, id: &str, text: &str) {
        self.remove(id);
        let grams = char_ngrams(text, GRAM_SIZE);
        if grams.is_empty() {
            return;
        }
        for gram in &grams {
            *self.postings.entry(gram.clone()).or_default().entry(id.to_string()).or_default() += 1;
        }
        self.doc_len.insert(id.to_string(), grams.len());
        self.total_len += grams.len();
    }

    fn remove(&mut self, id: &str) {
        let Some(len) = self.doc_len.remove(id) else {
            return;
        };
        self.total_len -= len;
        self.postings.retain(|_, docs| {
            docs.remove(id);
            !docs.is_empty()
        });
    }

    fn search(&self, query: &str, limit: usize) -> Vec<ScoredId> {
        let n = self.doc_len.len() as f64;
        if n == 0.0 {
            return Vec::new();
        }
        let avg_len = self.total_len as f64 / n;

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for gram in char_ngrams(query, GRAM_SIZE) {
            let Some(docs) = self.postings.get(&gram) else {
                continue;
            };
            let df = docs.len() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for (id, tf) in docs {
                let tf = *tf as f64;
                let dl = self.doc_len.get(id).copied().unwrap_or(0) as f64;
                let norm = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg_len);
                *scores.entry(id.as_str()).or_default() += idf * tf * (BM25_K1 + 1.0) / norm;
            }
        }

        let mut ranked: Vec<ScoredId> =
            scores.into_iter().map(|(id, score)| ScoredId { id: id.to_string(), score }).collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.truncate(limit);
        ranked
    }
}

#[derive(Debug, Default)]
struct Collection {
    records: BTreeMap<String, Record>,
    text_indexes: HashMap<String, TextIndex>,
}

/// An in-memory document and graph store.
///
/// Collections map record id → record; relations map intermediate entity →
/// linked record ids; edge relations map edge key → edge, which makes
/// insert-or-ignore a key lookup.
///
/// # Example
///
/// ```rust,ignore
/// use linkage::{InMemoryStore, Record};
///
/// let store = InMemoryStore::new();
/// store.create_collection("people").await;
/// store.insert_records("people", vec![Record::new("1").with_field("name", "Jon")]).await?;
/// store.create_text_index("people", "name").await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    relations: RwLock<HashMap<String, BTreeMap<String, BTreeSet<String>>>>,
    edges: RwLock<HashMap<String, BTreeMap<String, SimilarityEdge>>>,
    clusters: RwLock<HashMap<String, Vec<Cluster>>>,
}

fn missing_collection(name: &str) -> LinkageError {
    LinkageError::not_found("collection", name)
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a named collection. No-op if it already exists.
    pub async fn create_collection(&self, name: &str) {
        self.collections.write().await.entry(name.to_string()).or_default();
    }

    /// Insert or replace records, keeping every text index current.
    pub async fn insert_records(&self, collection: &str, records: Vec<Record>) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections.get_mut(collection).ok_or_else(|| missing_collection(collection))?;
        for record in records {
            for (field, index) in coll.text_indexes.iter_mut() {
                match record.text(field) {
                    Some(text) => index.add(&record.id, &text),
                    None => index.remove(&record.id),
                }
            }
            coll.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    /// Build a ranked text index over `field`. Rebuilds if one exists.
    pub async fn create_text_index(&self, collection: &str, field: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections.get_mut(collection).ok_or_else(|| missing_collection(collection))?;
        let mut index = TextIndex::default();
        for record in coll.records.values() {
            if let Some(text) = record.text(field) {
                index.add(&record.id, &text);
            }
        }
        coll.text_indexes.insert(field.to_string(), index);
        Ok(())
    }

    /// Link a record to an intermediate entity (e.g. a shared phone node).
    pub async fn link(&self, relation: &str, record_id: &str, intermediate: &str) {
        self.relations
            .write()
            .await
            .entry(relation.to_string())
            .or_default()
            .entry(intermediate.to_string())
            .or_default()
            .insert(record_id.to_string());
    }

    /// Clusters persisted into `collection`, in write order.
    pub async fn clusters(&self, collection: &str) -> Vec<Cluster> {
        self.clusters.read().await.get(collection).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn grouped_scan(
        &self,
        collection: &str,
        keys: &[KeyField],
        filters: &FilterSet,
    ) -> Result<Vec<Group>> {
        let collections = self.collections.read().await;
        let coll = collections.get(collection).ok_or_else(|| missing_collection(collection))?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in coll.records.values().filter(|r| filters.matches(r)) {
            if let Some(key) = composite_key(record, keys) {
                groups.entry(key).or_default().push(record.id.clone());
            }
        }
        Ok(groups.into_iter().map(|(key, ids)| Group { key, ids }).collect())
    }

    async fn scan(&self, collection: &str, filters: &FilterSet) -> Result<Vec<Record>> {
        let collections = self.collections.read().await;
        let coll = collections.get(collection).ok_or_else(|| missing_collection(collection))?;
        Ok(coll.records.values().filter(|r| filters.matches(r)).cloned().collect())
    }

    async fn text_search(
        &self,
        collection: &str,
        field: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredId>> {
        let collections = self.collections.read().await;
        let coll = collections.get(collection).ok_or_else(|| missing_collection(collection))?;
        let index = coll
            .text_indexes
            .get(field)
            .ok_or_else(|| LinkageError::not_found("text index", format!("{collection}.{field}")))?;
        Ok(index.search(query, limit))
    }

    async fn vector_search(
        &self,
        collection: &str,
        field: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredId>> {
        let collections = self.collections.read().await;
        let coll = collections.get(collection).ok_or_else(|| missing_collection(collection))?;

        let mut scored: Vec<ScoredId> = coll
            .records
            .values()
            .filter_map(|record| {
                let vector = record.get(field)?.as_vector()?;
                if vector.len() != query.len() {
                    return None;
                }
                Some(ScoredId {
                    id: record.id.clone(),
                    score: cosine_similarity(vector, query) as f64,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn fetch_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Record>> {
        let collections = self.collections.read().await;
        let coll = collections.get(collection).ok_or_else(|| missing_collection(collection))?;
        Ok(ids.iter().filter_map(|id| coll.records.get(id).cloned()).collect())
    }

    async fn relation_groups(&self, relation: &str) -> Result<Vec<Group>> {
        let relations = self.relations.read().await;
        let rel = relations
            .get(relation)
            .ok_or_else(|| LinkageError::not_found("relation", relation))?;
        Ok(rel
            .iter()
            .map(|(key, ids)| Group { key: key.clone(), ids: ids.iter().cloned().collect() })
            .collect())
    }
}

#[async_trait]
impl EdgeStore for InMemoryStore {
    async fn ensure_relation(&self, relation: &str) -> Result<()> {
        self.edges.write().await.entry(relation.to_string()).or_default();
        Ok(())
    }

    async fn upsert_edges(&self, relation: &str, edges: &[SimilarityEdge]) -> Result<usize> {
        let mut all = self.edges.write().await;
        let rel = all.get_mut(relation).ok_or_else(|| LinkageError::Store {
            backend: BACKEND.to_string(),
            message: format!("edge relation '{relation}' does not exist"),
            transient: false,
        })?;
        let mut inserted = 0;
        for edge in edges {
            if !rel.contains_key(&edge.key) {
                rel.insert(edge.key.clone(), edge.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn scan_edges(&self, relation: &str) -> Result<Vec<SimilarityEdge>> {
        let all = self.edges.read().await;
        let rel = all
            .get(relation)
            .ok_or_else(|| LinkageError::not_found("edge relation", relation))?;
        Ok(rel.values().cloned().collect())
    }

    async fn delete_edges(&self, relation: &str, filter: &EdgeFilter) -> Result<usize> {
        let mut all = self.edges.write().await;
        let rel = all
            .get_mut(relation)
            .ok_or_else(|| LinkageError::not_found("edge relation", relation))?;
        let before = rel.len();
        rel.retain(|_, edge| !filter.matches(edge));
        Ok(before - rel.len())
    }

    async fn edge_counts(&self, relation: &str) -> Result<BTreeMap<String, usize>> {
        let all = self.edges.read().await;
        let rel = all
            .get(relation)
            .ok_or_else(|| LinkageError::not_found("edge relation", relation))?;
        let mut counts = BTreeMap::new();
        for edge in rel.values() {
            *counts.entry(edge.method.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn replace_clusters(
        &self,
        collection: &str,
        clusters: &[Cluster],
        truncate: bool,
    ) -> Result<()> {
        let mut all = self.clusters.write().await;
        let stored = all.entry(collection.to_string()).or_default();
        if truncate {
            stored.clear();
        }
        stored.extend_from_slice(clusters);
        Ok(())
    }
}
