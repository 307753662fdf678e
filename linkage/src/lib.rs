//! Entity resolution for record collections.
//!
//! This crate provides:
//! - Blocking strategies that turn a collection into candidate pairs
//!   (exact key, phonetic, fuzzy text, vector, shared relationship)
//! - Fellegi-Sunter scoring with per-field comparators and m/u weights
//! - Idempotent similarity edges keyed by the unordered record pair
//! - Weakly-connected-component clustering over those edges
//! - A [`ResolutionPipeline`] that runs all four stages in order
//!
//! Storage is abstracted behind [`RecordStore`] and [`EdgeStore`];
//! [`InMemoryStore`] implements both for tests and small workloads.

pub mod blocking;
pub mod clustering;
pub mod config;
pub mod edges;
pub mod error;
pub mod inmemory;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod scoring;
pub mod similarity;
pub mod store;

pub use blocking::{
    BlockingEngine, BlockingOutput, BlockingReport, BlockingStats, BlockingStrategy,
    ExactBlocking, ExactBlockingConfig, FuzzyBlocking, FuzzyBlockingConfig, PhoneticBlocking,
    PhoneticBlockingConfig, RelationshipBlocking, RelationshipBlockingConfig,
    SimilarityDistribution, VectorBlocking, VectorBlockingConfig,
};
pub use clustering::{
    BreadthFirst, ClusterOptions, ClusterStatistics, ClusteringEngine, ClusteringState,
    ComponentFinder, UnionFind, ValidationReport,
};
pub use config::{ClusteringConfig, EdgeWriterConfig, FieldRule, ScorerConfig};
pub use edges::{EdgeStatistics, EdgeWriteSummary, EdgeWriter, edge_key};
pub use error::{LinkageError, Result};
pub use inmemory::InMemoryStore;
pub use pipeline::{
    DecisionCounts, PipelineReport, ResolutionPipeline, ResolutionPipelineBuilder, STAGE_SPAN,
    StrategySummary,
};
pub use record::{
    BlockingMethod, CandidatePair, CandidateSet, Cluster, Decision, FieldOutcome, FieldScore,
    FieldValue, Metadata, Record, ScoredPair, SimilarityEdge,
};
pub use retry::RetryPolicy;
pub use scoring::{FellegiSunterScorer, PairResult, ScoringOptions, ScoringReport};
pub use similarity::Comparator;
pub use store::{EdgeFilter, EdgeStore, FieldFilter, FilterSet, KeyField, Normalizer, RecordStore};

/// Re-export of the cancellation token accepted by every long-running operation.
pub use tokio_util::sync::CancellationToken;
