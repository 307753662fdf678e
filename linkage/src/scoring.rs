//! Fellegi-Sunter pair scoring.
//!
//! Each configured field contributes `ln(m/u)` when the two values agree and
//! `ln((1-m)/(1-u))` when they disagree, scaled by the field's importance.
//! Missing values contribute nothing. The summed score is classified against
//! the upper and lower thresholds into a [`Decision`].
//!
//! # Example
//!
//! ```rust,ignore
//! use linkage::config::{FieldRule, ScorerConfig};
//! use linkage::scoring::{FellegiSunterScorer, ScoringOptions};
//! use linkage::similarity::Comparator;
//!
//! let scorer = FellegiSunterScorer::new(
//!     ScorerConfig::builder()
//!         .collection("customers")
//!         .rule(FieldRule::new("phone", Comparator::Exact, 0.9, 0.01))
//!         .rule(FieldRule::new("name", Comparator::JaroWinkler, 0.9, 0.1))
//!         .build()?,
//! )?;
//! let report = scorer
//!     .compute_similarities(store.as_ref(), &pairs, &ScoringOptions::default(), &cancel)
//!     .await?;
//! ```

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{FieldRule, ScorerConfig};
use crate::error::{LinkageError, Result, ensure_active};
use crate::record::{CandidatePair, Decision, FieldOutcome, FieldScore, Record, ScoredPair};
use crate::store::RecordStore;

/// Per-call scoring switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoringOptions {
    /// Drop pairs with `total_score < threshold` (unless `return_all`).
    pub threshold: Option<f64>,
    /// Keep every scored pair regardless of `threshold`.
    pub return_all: bool,
    /// Keep the per-field breakdown on each pair.
    pub detailed: bool,
}

impl ScoringOptions {
    /// Options that keep pairs scoring at least `threshold`.
    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold: Some(threshold), ..Self::default() }
    }

    /// Keep per-field breakdowns.
    pub fn detailed(mut self) -> Self {
        self.detailed = true;
        self
    }

    /// Ignore the threshold.
    pub fn return_all(mut self) -> Self {
        self.return_all = true;
        self
    }
}

/// The outcome for one candidate pair.
#[derive(Debug)]
pub enum PairResult {
    /// The pair was scored.
    Scored(ScoredPair),
    /// The pair could not be scored; the rest of the batch is unaffected.
    Failed {
        /// The smaller identifier.
        id_a: String,
        /// The larger identifier.
        id_b: String,
        /// Why scoring failed.
        error: LinkageError,
    },
}

impl PairResult {
    /// The scored pair, if scoring succeeded.
    pub fn scored(&self) -> Option<&ScoredPair> {
        match self {
            PairResult::Scored(pair) => Some(pair),
            PairResult::Failed { .. } => None,
        }
    }
}

/// Results of a batch scoring call, in input order.
#[derive(Debug, Default)]
pub struct ScoringReport {
    /// Kept results; filtered pairs are omitted.
    pub results: Vec<PairResult>,
    /// Pairs dropped by the score threshold.
    pub filtered: usize,
}

impl ScoringReport {
    /// Iterate successfully scored pairs.
    pub fn scored(&self) -> impl Iterator<Item = &ScoredPair> {
        self.results.iter().filter_map(PairResult::scored)
    }

    /// Consume the report into its scored pairs.
    pub fn into_scored(self) -> Vec<ScoredPair> {
        self.results
            .into_iter()
            .filter_map(|r| match r {
                PairResult::Scored(pair) => Some(pair),
                PairResult::Failed { .. } => None,
            })
            .collect()
    }

    /// Number of pairs that failed to score.
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| matches!(r, PairResult::Failed { .. })).count()
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: FieldRule,
    importance: f64,
    agree: f64,
    disagree: f64,
}

/// Scores record pairs with the Fellegi-Sunter model.
///
/// Weights and effective importances are computed once at construction.
#[derive(Debug, Clone)]
pub struct FellegiSunterScorer {
    config: ScorerConfig,
    rules: Vec<CompiledRule>,
}

impl FellegiSunterScorer {
    /// Validate `config` and build a scorer.
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Configuration`] if the config is invalid.
    pub fn new(config: ScorerConfig) -> Result<Self> {
        config.validate()?;
        let rules = config
            .rules
            .iter()
            .zip(config.effective_importance())
            .map(|(rule, importance)| CompiledRule {
                rule: rule.clone(),
                importance,
                agree: rule.agreement_weight(),
                disagree: rule.disagreement_weight(),
            })
            .collect();
        Ok(Self { config, rules })
    }

    /// The scorer configuration.
    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score two records.
    ///
    /// The returned pair is canonically ordered and always carries the
    /// per-field breakdown.
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Computation`] when a comparator cannot handle
    /// the field values or when both records share an id.
    pub fn score_records(&self, a: &Record, b: &Record) -> Result<ScoredPair> {
        let (a, b) = if a.id <= b.id { (a, b) } else { (b, a) };
        let pair = || (a.id.clone(), b.id.clone());
        if a.id == b.id {
            return Err(LinkageError::Computation {
                pair: pair(),
                message: "self-pair".to_string(),
            });
        }

        let mut total = 0.0;
        let mut field_scores = Vec::with_capacity(self.rules.len());
        for compiled in &self.rules {
            let field = &compiled.rule.field;
            let (Some(left), Some(right)) = (a.get(field), b.get(field)) else {
                field_scores.push(FieldScore {
                    field: field.clone(),
                    similarity: None,
                    outcome: FieldOutcome::Missing,
                    weight: 0.0,
                });
                continue;
            };

            let similarity = compiled
                .rule
                .comparator
                .compare(left, right)
                .map_err(|e| LinkageError::Computation {
                    pair: pair(),
                    message: format!("field '{field}': {e}"),
                })?;
            if similarity.is_nan() {
                return Err(LinkageError::Computation {
                    pair: pair(),
                    message: format!("field '{field}': similarity is NaN"),
                });
            }

            let (outcome, weight) = if similarity >= compiled.rule.agreement_threshold {
                (FieldOutcome::Agree, compiled.agree * compiled.importance)
            } else {
                (FieldOutcome::Disagree, compiled.disagree * compiled.importance)
            };
            total += weight;
            field_scores.push(FieldScore {
                field: field.clone(),
                similarity: Some(similarity),
                outcome,
                weight,
            });
        }

        let decision =
            Decision::classify(total, self.config.upper_threshold, self.config.lower_threshold);
        Ok(ScoredPair {
            id_a: a.id.clone(),
            id_b: b.id.clone(),
            total_score: total,
            field_scores,
            decision,
            methods: Vec::new(),
        })
    }

    /// Score a batch of candidate pairs against the store.
    ///
    /// Every referenced record is fetched once, in chunks of
    /// `fetch_batch_size`, into a read-only cache. Per-pair failures land in
    /// that pair's [`PairResult::Failed`] slot.
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::BatchSizeExceeded`] if `pairs` is larger than
    /// `max_batch_pairs`, a store error if a fetch fails, or
    /// [`LinkageError::Cancelled`] between fetch batches.
    pub async fn compute_similarities(
        &self,
        store: &dyn RecordStore,
        pairs: &[CandidatePair],
        options: &ScoringOptions,
        cancel: &CancellationToken,
    ) -> Result<ScoringReport> {
        if pairs.len() > self.config.max_batch_pairs {
            return Err(LinkageError::BatchSizeExceeded {
                size: pairs.len(),
                cap: self.config.max_batch_pairs,
            });
        }

        let ids: Vec<String> = pairs
            .iter()
            .flat_map(|p| [p.id_a(), p.id_b()])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut cache: HashMap<String, Record> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.fetch_batch_size) {
            ensure_active(cancel, "scoring")?;
            let records = store.fetch_by_ids(&self.config.collection, chunk).await?;
            cache.extend(records.into_iter().map(|r| (r.id.clone(), r)));
        }
        debug!(requested = ids.len(), fetched = cache.len(), "scoring cache built");

        let mut report = ScoringReport::default();
        for pair in pairs {
            let (Some(a), Some(b)) = (cache.get(pair.id_a()), cache.get(pair.id_b())) else {
                let missing =
                    if cache.contains_key(pair.id_a()) { pair.id_b() } else { pair.id_a() };
                report.results.push(PairResult::Failed {
                    id_a: pair.id_a().to_string(),
                    id_b: pair.id_b().to_string(),
                    error: LinkageError::Computation {
                        pair: (pair.id_a().to_string(), pair.id_b().to_string()),
                        message: format!("record '{missing}' not found"),
                    },
                });
                continue;
            };

            match self.score_records(a, b) {
                Ok(mut scored) => {
                    let below = options.threshold.is_some_and(|t| scored.total_score < t);
                    if below && !options.return_all {
                        report.filtered += 1;
                        continue;
                    }
                    if !options.detailed {
                        scored.field_scores.clear();
                    }
                    scored.methods = pair.methods().to_vec();
                    report.results.push(PairResult::Scored(scored));
                }
                Err(error) => report.results.push(PairResult::Failed {
                    id_a: pair.id_a().to_string(),
                    id_b: pair.id_b().to_string(),
                    error,
                }),
            }
        }

        info!(
            pairs = pairs.len(),
            scored = report.results.len() - report.failed(),
            failed = report.failed(),
            filtered = report.filtered,
            "scoring finished"
        );
        Ok(report)
    }
}
