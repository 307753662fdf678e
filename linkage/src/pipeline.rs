//! End-to-end resolution pipeline.
//!
//! The [`ResolutionPipeline`] runs blocking → scoring → edge writing →
//! clustering against a [`RecordStore`] and an [`EdgeStore`]. Each stage runs
//! inside a `linkage.stage` tracing span so that a subscriber can time it.
//!
//! # Example
//!
//! ```rust,ignore
//! use linkage::{InMemoryStore, ResolutionPipeline};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let pipeline = ResolutionPipeline::builder()
//!     .stores(store.clone())
//!     .strategy(Arc::new(ExactBlocking::new(exact_config)?))
//!     .scorer_config(scorer_config)
//!     .build()?;
//!
//! let report = pipeline.run(&CancellationToken::new()).await?;
//! println!("{} clusters", report.clusters.len());
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use crate::blocking::{BlockingEngine, BlockingStats, BlockingStrategy};
use crate::clustering::{ClusterOptions, ClusteringEngine, ComponentFinder};
use crate::config::{ClusteringConfig, EdgeWriterConfig, ScorerConfig};
use crate::edges::{EdgeWriteSummary, EdgeWriter};
use crate::error::{LinkageError, Result, ensure_active};
use crate::record::{BlockingMethod, CandidatePair, Cluster, Decision, Metadata, ScoredPair};
use crate::scoring::{FellegiSunterScorer, ScoringOptions};
use crate::store::{EdgeStore, RecordStore};

/// Span name shared by every pipeline stage.
pub const STAGE_SPAN: &str = "linkage.stage";

/// Outcome of one blocking strategy within a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategySummary {
    /// Strategy label.
    pub strategy: String,
    /// Strategy method.
    pub method: BlockingMethod,
    /// Counters, when the strategy succeeded.
    pub stats: Option<BlockingStats>,
    /// The error message, when it failed.
    pub error: Option<String>,
}

/// Decision counts over all scored pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionCounts {
    pub matches: usize,
    pub possible_matches: usize,
    pub non_matches: usize,
}

impl DecisionCounts {
    fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Match => self.matches += 1,
            Decision::PossibleMatch => self.possible_matches += 1,
            Decision::NonMatch => self.non_matches += 1,
        }
    }
}

/// Summary of a [`ResolutionPipeline::run`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineReport {
    /// One entry per blocking strategy.
    pub blocking: Vec<StrategySummary>,
    /// Distinct candidate pairs after the merge.
    pub candidates: usize,
    /// Pairs scored successfully.
    pub scored: usize,
    /// Pairs that failed to score.
    pub failed_pairs: usize,
    /// Pairs dropped by the scoring threshold.
    pub filtered: usize,
    /// Decision counts.
    pub decisions: DecisionCounts,
    /// Pairs left for manual review.
    pub possible_matches: Vec<ScoredPair>,
    /// Edge write counts.
    pub edges: EdgeWriteSummary,
    /// Resolved clusters.
    pub clusters: Vec<Cluster>,
}

/// Orchestrates blocking, scoring, edge writing and clustering.
///
/// Construct one via [`ResolutionPipeline::builder()`].
pub struct ResolutionPipeline {
    record_store: Arc<dyn RecordStore>,
    blocking: BlockingEngine,
    scorer: FellegiSunterScorer,
    edge_writer: EdgeWriter,
    clustering: ClusteringEngine,
    scoring_options: ScoringOptions,
    cluster_options: ClusterOptions,
    edge_metadata: Option<Metadata>,
    write_possible_matches: bool,
}

fn stage_error(stage: &'static str, err: LinkageError) -> LinkageError {
    match err {
        LinkageError::Cancelled { .. } => err,
        other => {
            error!(stage, error = %other, "pipeline stage failed");
            LinkageError::Pipeline(format!("{stage} failed: {other}"))
        }
    }
}

impl ResolutionPipeline {
    /// Create a new [`ResolutionPipelineBuilder`].
    pub fn builder() -> ResolutionPipelineBuilder {
        ResolutionPipelineBuilder::default()
    }

    /// The scorer.
    pub fn scorer(&self) -> &FellegiSunterScorer {
        &self.scorer
    }

    /// The edge writer, for cleanup and statistics.
    pub fn edge_writer(&self) -> &EdgeWriter {
        &self.edge_writer
    }

    /// The clustering engine, for lookups and validation after a run.
    pub fn clustering(&self) -> &ClusteringEngine {
        &self.clustering
    }

    /// Run every blocking strategy and merge their pairs.
    pub async fn block(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Vec<CandidatePair>, Vec<StrategySummary>)> {
        ensure_active(cancel, "blocking")?;
        let report = self
            .blocking
            .run(self.record_store.as_ref(), cancel)
            .instrument(info_span!(STAGE_SPAN, stage = "blocking"))
            .await;
        ensure_active(cancel, "blocking")?;

        let summaries = report
            .outcomes
            .into_iter()
            .map(|o| {
                let (stats, error) = match o.result {
                    Ok(stats) => (Some(stats), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                StrategySummary { strategy: o.strategy, method: o.method, stats, error }
            })
            .collect();
        Ok((report.candidates.into_vec(), summaries))
    }

    /// Score candidates in chunks of the scorer's `max_batch_pairs`.
    async fn score(
        &self,
        candidates: &[CandidatePair],
        report: &mut PipelineReport,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredPair>> {
        let mut scored = Vec::new();
        let store = self.record_store.as_ref();
        for chunk in candidates.chunks(self.scorer.config().max_batch_pairs) {
            let batch = self
                .scorer
                .compute_similarities(store, chunk, &self.scoring_options, cancel)
                .await?;
            report.failed_pairs += batch.failed();
            report.filtered += batch.filtered;
            scored.extend(batch.into_scored());
        }
        Ok(scored)
    }

    /// Run the full pipeline.
    ///
    /// A failing blocking strategy is reported and the run continues with
    /// the others. Pairs that fail to score are counted and skipped. Only
    /// [`Decision::Match`] pairs become edges unless possible matches are
    /// enabled on the builder.
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Cancelled`] if `cancel` fires, or
    /// [`LinkageError::Pipeline`] wrapping the first stage failure.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        let (candidates, summaries) = self.block(cancel).await?;
        report.candidates = candidates.len();
        report.blocking = summaries;

        let scored = self
            .score(&candidates, &mut report, cancel)
            .instrument(info_span!(STAGE_SPAN, stage = "scoring"))
            .await
            .map_err(|e| stage_error("scoring", e))?;
        report.scored = scored.len();

        let mut to_write = Vec::with_capacity(scored.len());
        for pair in scored {
            report.decisions.record(pair.decision);
            match pair.decision {
                Decision::Match => to_write.push(pair),
                Decision::PossibleMatch => {
                    if self.write_possible_matches {
                        to_write.push(pair.clone());
                    }
                    report.possible_matches.push(pair);
                }
                Decision::NonMatch => {}
            }
        }

        ensure_active(cancel, "edge writing")?;
        report.edges = self
            .edge_writer
            .create_edges(&to_write, self.edge_metadata.clone())
            .instrument(info_span!(STAGE_SPAN, stage = "edges"))
            .await
            .map_err(|e| stage_error("edge writing", e))?;

        report.clusters = self
            .clustering
            .cluster(self.cluster_options, cancel)
            .instrument(info_span!(STAGE_SPAN, stage = "clustering"))
            .await
            .map_err(|e| stage_error("clustering", e))?;

        info!(
            candidates = report.candidates,
            scored = report.scored,
            matches = report.decisions.matches,
            edges_created = report.edges.created,
            clusters = report.clusters.len(),
            "resolution pipeline finished"
        );
        Ok(report)
    }
}

/// Builder for constructing a [`ResolutionPipeline`].
///
/// The stores, at least one strategy and the scorer config are required.
#[derive(Default)]
pub struct ResolutionPipelineBuilder {
    record_store: Option<Arc<dyn RecordStore>>,
    edge_store: Option<Arc<dyn EdgeStore>>,
    strategies: Vec<Arc<dyn BlockingStrategy>>,
    scorer_config: Option<ScorerConfig>,
    edge_writer_config: EdgeWriterConfig,
    clustering_config: ClusteringConfig,
    finder: Option<Arc<dyn ComponentFinder>>,
    scoring_options: ScoringOptions,
    cluster_options: ClusterOptions,
    edge_metadata: Option<Metadata>,
    write_possible_matches: bool,
}

impl ResolutionPipelineBuilder {
    /// Set the record store.
    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    /// Set the edge store.
    pub fn edge_store(mut self, store: Arc<dyn EdgeStore>) -> Self {
        self.edge_store = Some(store);
        self
    }

    /// Use one backend as both record and edge store.
    pub fn stores<S>(self, store: Arc<S>) -> Self
    where
        S: RecordStore + EdgeStore + 'static,
    {
        self.record_store(store.clone()).edge_store(store)
    }

    /// Add a blocking strategy.
    pub fn strategy(mut self, strategy: Arc<dyn BlockingStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Set the scorer configuration.
    pub fn scorer_config(mut self, config: ScorerConfig) -> Self {
        self.scorer_config = Some(config);
        self
    }

    /// Set the edge writer configuration.
    pub fn edge_writer_config(mut self, config: EdgeWriterConfig) -> Self {
        self.edge_writer_config = config;
        self
    }

    /// Set the clustering configuration.
    pub fn clustering_config(mut self, config: ClusteringConfig) -> Self {
        self.clustering_config = config;
        self
    }

    /// Use a different component finder.
    pub fn component_finder(mut self, finder: Arc<dyn ComponentFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    /// Set per-batch scoring options.
    pub fn scoring_options(mut self, options: ScoringOptions) -> Self {
        self.scoring_options = options;
        self
    }

    /// Set clustering options.
    pub fn cluster_options(mut self, options: ClusterOptions) -> Self {
        self.cluster_options = options;
        self
    }

    /// Attach metadata to every written edge.
    pub fn edge_metadata(mut self, metadata: Metadata) -> Self {
        self.edge_metadata = Some(metadata);
        self
    }

    /// Also write edges for possible matches.
    pub fn write_possible_matches(mut self, enabled: bool) -> Self {
        self.write_possible_matches = enabled;
        self
    }

    /// Build the [`ResolutionPipeline`].
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Configuration`] if a required part is missing
    /// or a component config is invalid.
    pub fn build(self) -> Result<ResolutionPipeline> {
        let record_store = self
            .record_store
            .ok_or_else(|| LinkageError::Configuration("record_store is required".to_string()))?;
        let edge_store = self
            .edge_store
            .ok_or_else(|| LinkageError::Configuration("edge_store is required".to_string()))?;
        if self.strategies.is_empty() {
            return Err(LinkageError::Configuration(
                "at least one blocking strategy is required".to_string(),
            ));
        }
        let scorer_config = self
            .scorer_config
            .ok_or_else(|| LinkageError::Configuration("scorer_config is required".to_string()))?;

        let blocking = self
            .strategies
            .into_iter()
            .fold(BlockingEngine::new(), BlockingEngine::with_strategy);
        let edge_writer = EdgeWriter::new(edge_store.clone(), self.edge_writer_config.clone())?;
        if self.clustering_config.edge_relation != self.edge_writer_config.relation {
            return Err(LinkageError::Configuration(format!(
                "clustering reads '{}' but edges are written to '{}'",
                self.clustering_config.edge_relation, self.edge_writer_config.relation
            )));
        }
        let mut clustering = ClusteringEngine::new(edge_store, self.clustering_config)?;
        if let Some(finder) = self.finder {
            clustering = clustering.with_finder(finder);
        }

        Ok(ResolutionPipeline {
            record_store,
            blocking,
            scorer: FellegiSunterScorer::new(scorer_config)?,
            edge_writer,
            clustering,
            scoring_options: self.scoring_options,
            cluster_options: self.cluster_options,
            edge_metadata: self.edge_metadata,
            write_possible_matches: self.write_possible_matches,
        })
    }
}
