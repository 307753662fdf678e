//! Idempotent persistence of similarity edges.
//!
//! Edge keys are derived from the unordered endpoint pair, so writing the
//! same scored pair twice (or the pair in either orientation) leaves exactly
//! one edge behind. Uniqueness is the only coordination between concurrent
//! writers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::config::EdgeWriterConfig;
use crate::error::{LinkageError, Result};
use crate::record::{Metadata, ScoredPair, SimilarityEdge};
use crate::store::{EdgeFilter, EdgeStore};

/// Method label for edges whose pair carries no blocking provenance.
pub const DEFAULT_EDGE_METHOD: &str = "fellegi_sunter";

const KEY_SEPARATOR: &[u8] = b"\x1f";
const REVERSE_SUFFIX: &str = ":r";

/// Deterministic key of the unordered pair `{a, b}`.
///
/// `edge_key(a, b) == edge_key(b, a)` for all inputs.
pub fn edge_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(KEY_SEPARATOR);
    hasher.update(hi.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

/// Counts from one [`EdgeWriter::create_edges`] call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeWriteSummary {
    /// Edges newly inserted.
    pub created: usize,
    /// Edges whose key already existed.
    pub ignored: usize,
    /// Pairs not written because they scored below `min_score`.
    pub below_threshold: usize,
}

/// Edge totals of a relation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeStatistics {
    /// Number of edges.
    pub total: usize,
    /// Edge count per method label.
    pub by_method: BTreeMap<String, usize>,
}

/// Writes scored pairs as similarity edges.
pub struct EdgeWriter {
    store: Arc<dyn EdgeStore>,
    config: EdgeWriterConfig,
}

impl EdgeWriter {
    /// Create a writer over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Configuration`] if the config is invalid.
    pub fn new(store: Arc<dyn EdgeStore>, config: EdgeWriterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// The writer configuration.
    pub fn config(&self) -> &EdgeWriterConfig {
        &self.config
    }

    fn method_label(pair: &ScoredPair) -> String {
        if pair.methods.is_empty() {
            return DEFAULT_EDGE_METHOD.to_string();
        }
        pair.methods.iter().map(|m| m.as_str()).collect::<Vec<_>>().join("+")
    }

    fn edges_for(
        &self,
        pair: &ScoredPair,
        metadata: &Metadata,
        now: DateTime<Utc>,
    ) -> Vec<SimilarityEdge> {
        let key = edge_key(&pair.id_a, &pair.id_b);
        let forward = SimilarityEdge {
            key: key.clone(),
            from: pair.id_a.clone(),
            to: pair.id_b.clone(),
            score: pair.total_score,
            method: Self::method_label(pair),
            metadata: metadata.clone(),
            created_at: now,
        };
        if !self.config.bidirectional {
            return vec![forward];
        }
        let reverse = SimilarityEdge {
            key: format!("{key}{REVERSE_SUFFIX}"),
            from: pair.id_b.clone(),
            to: pair.id_a.clone(),
            ..forward.clone()
        };
        vec![forward, reverse]
    }

    /// Write every pair scoring at least `min_score` as an edge.
    ///
    /// Pairs are written in batches of `batch_size`. Existing keys are left
    /// untouched, so repeating a call only increases `ignored`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the relation cannot be created or a batch
    /// fails. Batches written before the failure stay written.
    pub async fn create_edges(
        &self,
        pairs: &[ScoredPair],
        metadata: Option<Metadata>,
    ) -> Result<EdgeWriteSummary> {
        let relation = self.config.relation.as_str();
        self.store.ensure_relation(relation).await.map_err(|e| {
            error!(relation, error = %e, "failed to ensure edge relation");
            e
        })?;

        let metadata = metadata.unwrap_or_default();
        let now = Utc::now();
        let mut summary = EdgeWriteSummary::default();

        let eligible: Vec<&ScoredPair> = pairs
            .iter()
            .filter(|p| {
                let keep = self.config.min_score.is_none_or(|min| p.total_score >= min);
                if !keep {
                    summary.below_threshold += 1;
                }
                keep
            })
            .collect();

        for batch in eligible.chunks(self.config.batch_size) {
            let edges: Vec<SimilarityEdge> =
                batch.iter().flat_map(|p| self.edges_for(p, &metadata, now)).collect();
            let created = self.store.upsert_edges(relation, &edges).await.map_err(|e| {
                error!(relation, batch = edges.len(), error = %e, "edge batch write failed");
                e
            })?;
            summary.created += created;
            summary.ignored += edges.len() - created;
        }

        info!(
            relation,
            created = summary.created,
            ignored = summary.ignored,
            below_threshold = summary.below_threshold,
            "edges written"
        );
        Ok(summary)
    }

    /// Remove edges by method and/or age. Returns the number removed.
    pub async fn clear_edges(
        &self,
        method: Option<&str>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let filter = EdgeFilter { method: method.map(str::to_string), older_than };
        let removed = self.store.delete_edges(&self.config.relation, &filter).await?;
        info!(relation = %self.config.relation, removed, "edges cleared");
        Ok(removed)
    }

    /// Edge totals of the configured relation.
    pub async fn statistics(&self) -> Result<EdgeStatistics> {
        let by_method = match self.store.edge_counts(&self.config.relation).await {
            Ok(counts) => counts,
            Err(LinkageError::ResourceNotFound { .. }) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(EdgeStatistics { total: by_method.values().sum(), by_method })
    }
}
