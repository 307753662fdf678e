//! Configuration for scoring, edge writing and clustering.
//!
//! Every component receives an immutable config at construction. Builders
//! validate ranges so that bad parameters fail before any I/O.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LinkageError, Result};
use crate::retry::RetryPolicy;
use crate::similarity::Comparator;

/// Default upper decision threshold (strictly above → match).
pub const DEFAULT_UPPER_THRESHOLD: f64 = 2.0;
/// Default lower decision threshold (at or below → non-match).
pub const DEFAULT_LOWER_THRESHOLD: f64 = -1.0;

/// Fellegi-Sunter parameters for one compared field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldRule {
    /// Field name in both records.
    pub field: String,
    /// Similarity function.
    pub comparator: Comparator,
    /// P(field agrees | true match).
    pub m_prob: f64,
    /// P(field agrees | non-match).
    pub u_prob: f64,
    /// Similarity at or above which the field counts as agreeing.
    pub agreement_threshold: f64,
    /// Relative influence multiplier.
    pub importance: f64,
}

impl FieldRule {
    /// A rule with agreement threshold 0.85 (1.0 for exact and Soundex) and importance 1.0.
    pub fn new(field: impl Into<String>, comparator: Comparator, m_prob: f64, u_prob: f64) -> Self {
        let agreement_threshold = match comparator {
            Comparator::Exact | Comparator::Soundex => 1.0,
            _ => 0.85,
        };
        Self {
            field: field.into(),
            comparator,
            m_prob,
            u_prob,
            agreement_threshold,
            importance: 1.0,
        }
    }

    /// Override the agreement threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.agreement_threshold = threshold;
        self
    }

    /// Override the importance multiplier.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    /// `ln(m/u)`.
    pub fn agreement_weight(&self) -> f64 {
        (self.m_prob / self.u_prob).ln()
    }

    /// `ln((1-m)/(1-u))`.
    pub fn disagreement_weight(&self) -> f64 {
        ((1.0 - self.m_prob) / (1.0 - self.u_prob)).ln()
    }

    fn validate(&self) -> Result<()> {
        let field = &self.field;
        if field.trim().is_empty() {
            return Err(LinkageError::Configuration("field rule with empty field name".to_string()));
        }
        for (name, p) in [("m_prob", self.m_prob), ("u_prob", self.u_prob)] {
            if !(p > 0.0 && p < 1.0) {
                return Err(LinkageError::Configuration(format!(
                    "field '{field}': {name} must lie strictly between 0 and 1, got {p}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.agreement_threshold) {
            return Err(LinkageError::Configuration(format!(
                "field '{field}': agreement threshold must lie in [0, 1], got {}",
                self.agreement_threshold
            )));
        }
        if !(self.importance.is_finite() && self.importance >= 0.0) {
            return Err(LinkageError::Configuration(format!(
                "field '{field}': importance must be finite and non-negative, got {}",
                self.importance
            )));
        }
        if let Comparator::NgramJaccard { n: 0 } = self.comparator {
            return Err(LinkageError::Configuration(format!(
                "field '{field}': n-gram size must be at least 1"
            )));
        }
        if self.m_prob <= self.u_prob {
            warn!(
                field = %field,
                m = self.m_prob,
                u = self.u_prob,
                "m_prob <= u_prob; agreement will lower the score"
            );
        }
        Ok(())
    }
}

/// Configuration of the Fellegi-Sunter scorer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScorerConfig {
    /// Collection holding the records referenced by candidate pairs.
    pub collection: String,
    /// Compared fields.
    pub rules: Vec<FieldRule>,
    /// Strictly above → match.
    pub upper_threshold: f64,
    /// At or below → non-match.
    pub lower_threshold: f64,
    /// Rescale importances to sum to 1.0.
    pub normalize_importance: bool,
    /// Ids per `fetch_by_ids` round trip.
    pub fetch_batch_size: usize,
    /// Largest accepted batch of candidate pairs.
    pub max_batch_pairs: usize,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            collection: "records".to_string(),
            rules: Vec::new(),
            upper_threshold: DEFAULT_UPPER_THRESHOLD,
            lower_threshold: DEFAULT_LOWER_THRESHOLD,
            normalize_importance: true,
            fetch_batch_size: 1000,
            max_batch_pairs: 100_000,
        }
    }
}

impl ScorerConfig {
    /// Create a new builder for constructing a [`ScorerConfig`].
    pub fn builder() -> ScorerConfigBuilder {
        ScorerConfigBuilder::default()
    }

    /// Check that the parameters are consistent.
    ///
    /// Called by the builder and by
    /// [`FellegiSunterScorer::new`](crate::scoring::FellegiSunterScorer::new).
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Configuration`] if:
    /// - no rules are configured, or a field appears twice
    /// - any probability is outside `(0, 1)` or a threshold outside `[0, 1]`
    /// - every importance is zero
    /// - a decision threshold is not finite, or `lower_threshold > upper_threshold`
    /// - a batch size is zero
    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(LinkageError::Configuration(
                "at least one field rule is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert(rule.field.as_str()) {
                return Err(LinkageError::Configuration(format!(
                    "field '{}' is configured twice",
                    rule.field
                )));
            }
        }
        if self.rules.iter().all(|r| r.importance == 0.0) {
            return Err(LinkageError::Configuration(
                "all field importances are zero".to_string(),
            ));
        }
        if !(self.upper_threshold.is_finite() && self.lower_threshold.is_finite()) {
            return Err(LinkageError::Configuration(
                "decision thresholds must be finite".to_string(),
            ));
        }
        if self.lower_threshold > self.upper_threshold {
            return Err(LinkageError::Configuration(format!(
                "lower threshold ({}) must not exceed upper threshold ({})",
                self.lower_threshold, self.upper_threshold
            )));
        }
        if self.fetch_batch_size == 0 || self.max_batch_pairs == 0 {
            return Err(LinkageError::Configuration(
                "batch sizes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Importance actually applied per rule, after optional normalization.
    ///
    /// Without normalization the raw importance is the multiplier, and raising
    /// it moves the total in the direction of the field's outcome. With
    /// normalization the multipliers sum to 1, the total is a weighted mean
    /// of the field weights, and raising one importance moves the total
    /// toward that field's weight.
    pub fn effective_importance(&self) -> Vec<f64> {
        let total: f64 = self.rules.iter().map(|r| r.importance).sum();
        self.rules
            .iter()
            .map(|r| {
                if self.normalize_importance && total > 0.0 {
                    r.importance / total
                } else {
                    r.importance
                }
            })
            .collect()
    }
}

/// Builder for constructing a validated [`ScorerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ScorerConfigBuilder {
    config: ScorerConfig,
}

impl ScorerConfigBuilder {
    /// Set the record collection.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.config.collection = collection.into();
        self
    }

    /// Add a compared field.
    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.config.rules.push(rule);
        self
    }

    /// Replace all compared fields.
    pub fn rules(mut self, rules: Vec<FieldRule>) -> Self {
        self.config.rules = rules;
        self
    }

    /// Set both decision thresholds.
    pub fn thresholds(mut self, upper: f64, lower: f64) -> Self {
        self.config.upper_threshold = upper;
        self.config.lower_threshold = lower;
        self
    }

    /// Enable or disable importance normalization.
    pub fn normalize_importance(mut self, normalize: bool) -> Self {
        self.config.normalize_importance = normalize;
        self
    }

    /// Set the number of ids fetched per round trip.
    pub fn fetch_batch_size(mut self, size: usize) -> Self {
        self.config.fetch_batch_size = size;
        self
    }

    /// Set the largest accepted candidate batch.
    pub fn max_batch_pairs(mut self, cap: usize) -> Self {
        self.config.max_batch_pairs = cap;
        self
    }

    /// Build the [`ScorerConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// See [`ScorerConfig::validate`].
    pub fn build(self) -> Result<ScorerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration of the [`EdgeWriter`](crate::edges::EdgeWriter).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeWriterConfig {
    /// Edge relation to write into.
    pub relation: String,
    /// Edges per `upsert_edges` call.
    pub batch_size: usize,
    /// Only pairs scoring at or above this are written. `None` writes all.
    pub min_score: Option<f64>,
    /// Also write the reverse edge.
    pub bidirectional: bool,
}

impl Default for EdgeWriterConfig {
    fn default() -> Self {
        Self {
            relation: "similar_to".to_string(),
            batch_size: 1000,
            min_score: None,
            bidirectional: false,
        }
    }
}

impl EdgeWriterConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LinkageError::Configuration(
                "edge batch_size must be greater than zero".to_string(),
            ));
        }
        if self.relation.trim().is_empty() {
            return Err(LinkageError::Configuration("edge relation name is empty".to_string()));
        }
        if self.min_score.is_some_and(|s| !s.is_finite()) {
            return Err(LinkageError::Configuration("edge min_score must be finite".to_string()));
        }
        Ok(())
    }
}

/// Configuration of the [`ClusteringEngine`](crate::clustering::ClusteringEngine).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusteringConfig {
    /// Edge relation to read.
    pub edge_relation: String,
    /// Collection clusters are persisted into.
    pub cluster_collection: String,
    /// Smallest emitted cluster.
    pub min_cluster_size: usize,
    /// Ignore edges scoring below this. `None` uses every edge.
    pub min_edge_score: Option<f64>,
    /// Deadline for the bulk edge fetch, retries included.
    pub fetch_timeout: Duration,
    /// Retry policy for the bulk edge fetch.
    pub retry: RetryPolicy,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            edge_relation: "similar_to".to_string(),
            cluster_collection: "entity_clusters".to_string(),
            min_cluster_size: 2,
            min_edge_score: None,
            fetch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClusteringConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.min_cluster_size < 2 {
            return Err(LinkageError::Configuration(format!(
                "min_cluster_size must be at least 2, got {}",
                self.min_cluster_size
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(LinkageError::Configuration("fetch_timeout must be non-zero".to_string()));
        }
        self.retry.validate()
    }
}
