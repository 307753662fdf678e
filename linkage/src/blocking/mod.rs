//! Candidate generation.
//!
//! This module provides the [`BlockingStrategy`] trait and five implementations:
//!
//! - [`ExactBlocking`]: groups records by a normalized composite key
//! - [`PhoneticBlocking`]: groups records by the Soundex code of a name field
//! - [`FuzzyBlocking`]: ranked text search per record over one field
//! - [`VectorBlocking`]: cosine nearest neighbours over an embedding field
//! - [`RelationshipBlocking`]: records sharing a low-degree intermediate entity
//!
//! [`BlockingEngine`] runs any number of strategies concurrently and merges
//! their outputs into one deduplicated [`CandidateSet`].

mod exact;
mod fuzzy;
mod phonetic;
mod relationship;
mod vector;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{LinkageError, Result, ensure_active};
use crate::record::{BlockingMethod, CandidatePair, CandidateSet};
use crate::store::{Group, RecordStore};

pub use exact::{ExactBlocking, ExactBlockingConfig};
pub use fuzzy::{FuzzyBlocking, FuzzyBlockingConfig};
pub use phonetic::{PhoneticBlocking, PhoneticBlockingConfig};
pub use relationship::{DEFAULT_MAX_DEGREE, RelationshipBlocking, RelationshipBlockingConfig};
pub use vector::{
    DEFAULT_SIMILARITY_THRESHOLD, SimilarityDistribution, VectorBlocking, VectorBlockingConfig,
};

/// Default cap above which a block is skipped.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 100;
/// Default minimum block size; singletons never produce pairs.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 2;
/// Default neighbours retrieved per record by rank-based strategies.
pub const DEFAULT_LIMIT_PER_ENTITY: usize = 10;

/// Records processed between cancellation checks in per-record strategies.
pub(crate) const CANCEL_CHECK_INTERVAL: usize = 256;

/// Counters reported by a single strategy run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockingStats {
    /// Records (or relation links) examined.
    pub records_scanned: usize,
    /// Blocks that produced pairs.
    pub blocks_formed: usize,
    /// Blocks skipped for exceeding the size cap.
    pub blocks_skipped_oversized: usize,
    /// Blocks skipped for falling below the minimum size.
    pub blocks_skipped_undersized: usize,
    /// Distinct pairs emitted.
    pub pairs_emitted: usize,
}

/// The result of one strategy run.
#[derive(Debug, Clone)]
pub struct BlockingOutput {
    /// The strategy that produced the pairs.
    pub method: BlockingMethod,
    /// Canonically ordered, strategy-local deduplicated pairs.
    pub pairs: Vec<CandidatePair>,
    /// Run counters.
    pub stats: BlockingStats,
}

/// A strategy for proposing candidate pairs.
///
/// Implementations validate their parameters at construction; generation only
/// fails on store errors, missing resources or cancellation.
#[async_trait]
pub trait BlockingStrategy: Send + Sync {
    /// The method recorded on every emitted pair.
    fn method(&self) -> BlockingMethod;

    /// A human-readable label for logs and reports.
    fn describe(&self) -> String {
        self.method().to_string()
    }

    /// Scan the store and emit candidate pairs.
    async fn generate_candidates(
        &self,
        store: &dyn RecordStore,
        cancel: &CancellationToken,
    ) -> Result<BlockingOutput>;
}

/// Size bounds shared by the grouping strategies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockBounds {
    pub min: usize,
    pub max: usize,
}

impl BlockBounds {
    pub fn new(min: usize, max: usize) -> Result<Self> {
        if min < 2 {
            return Err(LinkageError::Configuration(format!(
                "min_block_size must be at least 2, got {min}"
            )));
        }
        if max < min {
            return Err(LinkageError::Configuration(format!(
                "max_block_size ({max}) must be at least min_block_size ({min})"
            )));
        }
        Ok(Self { min, max })
    }
}

/// Expand groups into all within-group pairs, honouring the size bounds.
pub(crate) fn pairs_from_groups(
    groups: Vec<Group>,
    method: BlockingMethod,
    bounds: BlockBounds,
    stats: &mut BlockingStats,
) -> Vec<CandidatePair> {
    let mut pairs = CandidateSet::new();
    for group in groups {
        stats.records_scanned += group.size();
        if group.size() < bounds.min {
            stats.blocks_skipped_undersized += 1;
            continue;
        }
        if group.size() > bounds.max {
            stats.blocks_skipped_oversized += 1;
            warn!(
                %method,
                key = %group.key,
                size = group.size(),
                cap = bounds.max,
                "skipping oversized block"
            );
            continue;
        }
        stats.blocks_formed += 1;
        let size = group.size();
        for (i, a) in group.ids.iter().enumerate() {
            for b in &group.ids[i + 1..] {
                if let Some(pair) = CandidatePair::new(a.as_str(), b.as_str(), method) {
                    pairs.insert(
                        pair.with_metadata("block_key", group.key.clone())
                            .with_metadata("block_size", size),
                    );
                }
            }
        }
    }
    stats.pairs_emitted = pairs.len();
    pairs.into_vec()
}

/// Per-strategy outcome of a [`BlockingEngine`] run.
#[derive(Debug)]
pub struct StrategyOutcome {
    /// Strategy label.
    pub strategy: String,
    /// Strategy method.
    pub method: BlockingMethod,
    /// Counters, or the error that stopped this strategy.
    pub result: Result<BlockingStats>,
}

/// The merged output of a [`BlockingEngine`] run.
#[derive(Debug, Default)]
pub struct BlockingReport {
    /// Union of all strategies' pairs.
    pub candidates: CandidateSet,
    /// One entry per strategy, in registration order.
    pub outcomes: Vec<StrategyOutcome>,
}

impl BlockingReport {
    /// Whether any strategy failed.
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| o.result.is_err())
    }
}

/// Runs blocking strategies concurrently and merges their pairs.
///
/// # Example
///
/// ```rust,ignore
/// use linkage::blocking::{BlockingEngine, ExactBlocking, ExactBlockingConfig};
///
/// let engine = BlockingEngine::new()
///     .with_strategy(Arc::new(ExactBlocking::new(exact_config)?))
///     .with_strategy(Arc::new(PhoneticBlocking::new(phonetic_config)?));
/// let report = engine.run(store.as_ref(), &CancellationToken::new()).await;
/// ```
#[derive(Default, Clone)]
pub struct BlockingEngine {
    strategies: Vec<Arc<dyn BlockingStrategy>>,
}

impl BlockingEngine {
    /// Create an engine with no strategies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn BlockingStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Number of registered strategies.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Whether no strategy is registered.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Run every strategy concurrently, each into its own buffer, then merge once.
    ///
    /// A failing strategy is recorded in its [`StrategyOutcome`] and does not
    /// affect its siblings.
    pub async fn run(&self, store: &dyn RecordStore, cancel: &CancellationToken) -> BlockingReport {
        let runs = self.strategies.iter().map(|strategy| async move {
            ensure_active(cancel, "blocking")?;
            strategy.generate_candidates(store, cancel).await
        });
        let results = join_all(runs).await;

        let mut report = BlockingReport::default();
        for (strategy, result) in self.strategies.iter().zip(results) {
            let label = strategy.describe();
            let result = match result {
                Ok(output) => {
                    info!(
                        strategy = %label,
                        pairs = output.pairs.len(),
                        "blocking strategy finished"
                    );
                    report.candidates.extend(output.pairs);
                    Ok(output.stats)
                }
                Err(e) => {
                    warn!(strategy = %label, error = %e, "blocking strategy failed");
                    Err(e)
                }
            };
            report.outcomes.push(StrategyOutcome {
                strategy: label,
                method: strategy.method(),
                result,
            });
        }

        info!(
            strategies = self.strategies.len(),
            candidates = report.candidates.len(),
            "blocking finished"
        );
        report
    }
}
