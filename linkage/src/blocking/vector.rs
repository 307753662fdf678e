use std::collections::HashMap;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    BlockingOutput, BlockingStats, BlockingStrategy, CANCEL_CHECK_INTERVAL,
    DEFAULT_LIMIT_PER_ENTITY,
};
use crate::error::{LinkageError, Result, ensure_active};
use crate::record::{BlockingMethod, CandidatePair, CandidateSet, Record};
use crate::similarity::cosine_similarity;
use crate::store::{FieldFilter, FilterSet, RecordStore};

/// Default minimum cosine similarity for a neighbour.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

/// Parameters for [`VectorBlocking`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorBlockingConfig {
    /// Collection to scan.
    pub collection: String,
    /// Embedding field.
    pub field: String,
    /// Minimum cosine similarity, in `[-1, 1]`.
    pub similarity_threshold: f64,
    /// Neighbours kept per record.
    pub limit_per_entity: usize,
    /// When set, a neighbour must share this field's normalized value.
    #[serde(default)]
    pub same_field: Option<String>,
    /// Record predicates.
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
}

impl VectorBlockingConfig {
    /// A config over the embedding field `collection.field`.
    pub fn new(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            limit_per_entity: DEFAULT_LIMIT_PER_ENTITY,
            same_field: None,
            filters: Vec::new(),
        }
    }

    /// Minimum cosine similarity.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Neighbours kept per record.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit_per_entity = limit;
        self
    }

    /// Require neighbours to agree on `field`.
    pub fn with_same_field(mut self, field: impl Into<String>) -> Self {
        self.same_field = Some(field.into());
        self
    }

    /// Add a record filter.
    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Summary of cosine similarities over randomly sampled record pairs.
///
/// Used to pick a `similarity_threshold` for a new dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityDistribution {
    /// Pairs actually sampled.
    pub sample_size: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    /// Suggested threshold at the 10th percentile of sampled similarity.
    pub p10: f64,
    /// Suggested threshold at the 25th percentile.
    pub p25: f64,
    /// Suggested threshold at the 50th percentile.
    pub p50: f64,
}

impl SimilarityDistribution {
    fn from_samples(mut samples: Vec<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        let n = samples.len();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        let percentile = |p: f64| {
            let rank = ((p / 100.0) * (n - 1) as f64).round() as usize;
            samples[rank.min(n - 1)]
        };
        Some(Self {
            sample_size: n,
            min: samples[0],
            max: samples[n - 1],
            mean,
            median: percentile(50.0),
            std_dev: variance.sqrt(),
            p10: percentile(10.0),
            p25: percentile(25.0),
            p50: percentile(50.0),
        })
    }
}

/// Proposes each record's nearest embedding neighbours as candidates.
///
/// Records without a vector in the field are skipped. Neighbours with a
/// different dimension are never returned by the store.
#[derive(Debug, Clone)]
pub struct VectorBlocking {
    config: VectorBlockingConfig,
    filters: FilterSet,
}

impl VectorBlocking {
    /// Validate the config and build the strategy.
    pub fn new(config: VectorBlockingConfig) -> Result<Self> {
        if !(-1.0..=1.0).contains(&config.similarity_threshold) {
            return Err(LinkageError::Configuration(format!(
                "similarity_threshold must be within [-1, 1], got {}",
                config.similarity_threshold
            )));
        }
        if config.limit_per_entity == 0 {
            return Err(LinkageError::Configuration(
                "limit_per_entity must be positive".to_string(),
            ));
        }
        let filters = FilterSet::new(config.filters.clone())?;
        Ok(Self { config, filters })
    }

    /// The validated config.
    pub fn config(&self) -> &VectorBlockingConfig {
        &self.config
    }

    fn gate(&self, record: &Record) -> Option<String> {
        let field = self.config.same_field.as_deref()?;
        record.text(field).map(|v| v.to_lowercase())
    }

    /// Sample up to `sample_size` random record pairs and summarize their
    /// cosine similarities.
    ///
    /// The sampler is seeded from `sample_size`, so repeated calls over the
    /// same data agree. Returns `None` when fewer than two records carry a
    /// vector.
    pub async fn similarity_distribution(
        &self,
        store: &dyn RecordStore,
        sample_size: usize,
    ) -> Result<Option<SimilarityDistribution>> {
        let records = store.scan(&self.config.collection, &self.filters).await?;
        let vectors: Vec<&[f32]> =
            records.iter().filter_map(|r| r.get(&self.config.field)?.as_vector()).collect();
        if vectors.len() < 2 || sample_size == 0 {
            return Ok(None);
        }

        let mut rng = StdRng::seed_from_u64(sample_size as u64);
        let mut samples = Vec::with_capacity(sample_size);
        for _ in 0..sample_size {
            let i = rng.gen_range(0..vectors.len());
            let mut j = rng.gen_range(0..vectors.len() - 1);
            if j >= i {
                j += 1;
            }
            if vectors[i].len() == vectors[j].len() {
                samples.push(cosine_similarity(vectors[i], vectors[j]) as f64);
            }
        }

        let distribution = SimilarityDistribution::from_samples(samples);
        if let Some(d) = &distribution {
            info!(
                field = %self.config.field,
                samples = d.sample_size,
                mean = d.mean,
                median = d.median,
                "sampled similarity distribution"
            );
        }
        Ok(distribution)
    }
}

#[async_trait]
impl BlockingStrategy for VectorBlocking {
    fn method(&self) -> BlockingMethod {
        BlockingMethod::Vector
    }

    fn describe(&self) -> String {
        format!("vector[{}>={}]", self.config.field, self.config.similarity_threshold)
    }

    async fn generate_candidates(
        &self,
        store: &dyn RecordStore,
        cancel: &CancellationToken,
    ) -> Result<BlockingOutput> {
        let collection = &self.config.collection;
        let records = store.scan(collection, &self.filters).await?;
        let gates: HashMap<&str, Option<String>> =
            records.iter().map(|r| (r.id.as_str(), self.gate(r))).collect();

        let mut stats = BlockingStats::default();
        let mut pairs = CandidateSet::new();
        for (i, record) in records.iter().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 {
                ensure_active(cancel, "vector blocking")?;
            }
            stats.records_scanned += 1;
            let Some(query) = record.get(&self.config.field).and_then(|v| v.as_vector()) else {
                continue;
            };

            let limit = self.config.limit_per_entity + 1;
            let hits = store.vector_search(collection, &self.config.field, query, limit).await?;
            let own_gate = gates.get(record.id.as_str()).cloned().flatten();
            let mut kept = 0;
            for hit in hits {
                if kept == self.config.limit_per_entity {
                    break;
                }
                if hit.id == record.id || hit.score < self.config.similarity_threshold {
                    continue;
                }
                let Some(other_gate) = gates.get(hit.id.as_str()) else {
                    continue;
                };
                let gated_out = own_gate.is_none() || *other_gate != own_gate;
                if self.config.same_field.is_some() && gated_out {
                    continue;
                }
                let pair = CandidatePair::new(record.id.as_str(), hit.id.as_str(), self.method());
                if let Some(pair) = pair {
                    pairs.insert(pair.with_metadata("similarity", hit.score));
                    kept += 1;
                }
            }
            if kept > 0 {
                stats.blocks_formed += 1;
            }
        }

        stats.pairs_emitted = pairs.len();
        debug!(strategy = %self.describe(), pairs = pairs.len(), "vector neighbours collected");
        Ok(BlockingOutput { method: self.method(), pairs: pairs.into_vec(), stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemoryStore;

    fn doc(id: &str, embedding: [f32; 3], lang: &str) -> Record {
        Record::new(id).with_field("embedding", embedding.to_vec()).with_field("lang", lang)
    }

    async fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_collection("docs").await;
        store
            .insert_records(
                "docs",
                vec![
                    doc("a", [1.0, 0.0, 0.0], "en"),
                    doc("b", [0.9, 0.1, 0.0], "en"),
                    doc("c", [0.95, 0.0, 0.05], "de"),
                    doc("d", [0.0, 1.0, 0.0], "en"),
                    Record::new("e").with_field("lang", "en"),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn neighbours_above_threshold() {
        let store = store().await;
        let config = VectorBlockingConfig::new("docs", "embedding").with_threshold(0.9);
        let strategy = VectorBlocking::new(config).unwrap();
        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();
        let keys: Vec<_> = output.pairs.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec![("a", "b"), ("a", "c"), ("b", "c")]);
        assert_eq!(output.stats.records_scanned, 5);
    }

    #[tokio::test]
    async fn same_field_gate() {
        let store = store().await;
        let config = VectorBlockingConfig::new("docs", "embedding")
            .with_threshold(0.9)
            .with_same_field("lang");
        let strategy = VectorBlocking::new(config).unwrap();
        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();
        let keys: Vec<_> = output.pairs.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec![("a", "b")]);
    }

    #[tokio::test]
    async fn distribution_is_deterministic() {
        let store = store().await;
        let strategy = VectorBlocking::new(VectorBlockingConfig::new("docs", "embedding")).unwrap();
        let first = strategy.similarity_distribution(&store, 50).await.unwrap().unwrap();
        let second = strategy.similarity_distribution(&store, 50).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.sample_size, 50);
        assert!(first.min <= first.median && first.median <= first.max);
        assert!(first.p10 <= first.p25 && first.p25 <= first.p50);
        assert_eq!(first.p50, first.median);
    }

    #[tokio::test]
    async fn distribution_needs_two_vectors() {
        let store = InMemoryStore::new();
        store.create_collection("docs").await;
        let lone = Record::new("a").with_field("embedding", vec![1.0_f32]);
        store.insert_records("docs", vec![lone]).await.unwrap();
        let strategy = VectorBlocking::new(VectorBlockingConfig::new("docs", "embedding")).unwrap();
        assert!(strategy.similarity_distribution(&store, 10).await.unwrap().is_none());
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let samples: Vec<f64> = (0..=10).rev().map(|i| i as f64 / 10.0).collect();
        let d = SimilarityDistribution::from_samples(samples).unwrap();
        assert_eq!(d.sample_size, 11);
        assert_eq!((d.min, d.max), (0.0, 1.0));
        assert_eq!(d.p10, 1.0 / 10.0);
        assert_eq!(d.p25, 3.0 / 10.0);
        assert_eq!(d.p50, 5.0 / 10.0);
        assert_eq!(d.median, d.p50);
        assert!((d.mean - 0.5).abs() < 1e-12);
        assert!(SimilarityDistribution::from_samples(Vec::new()).is_none());
    }

    #[test]
    fn threshold_must_be_a_cosine() {
        let config = || VectorBlockingConfig::new("d", "e");
        assert!(VectorBlocking::new(config().with_threshold(1.5)).is_err());
        assert!(VectorBlocking::new(config().with_threshold(-1.0)).is_ok());
        assert!(VectorBlocking::new(config().with_limit(0)).is_err());
    }
}
