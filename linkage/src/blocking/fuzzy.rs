use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    BlockingOutput, BlockingStats, BlockingStrategy, CANCEL_CHECK_INTERVAL,
    DEFAULT_LIMIT_PER_ENTITY,
};
use crate::error::{LinkageError, Result, ensure_active};
use crate::record::{BlockingMethod, CandidatePair, CandidateSet};
use crate::store::{FieldFilter, FilterSet, RecordStore};

/// Parameters for [`FuzzyBlocking`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FuzzyBlockingConfig {
    /// Collection to scan.
    pub collection: String,
    /// Text-indexed field to search.
    pub field: String,
    /// Neighbours kept per record.
    pub limit_per_entity: usize,
    /// Minimum relevance score for a neighbour to count.
    #[serde(default)]
    pub min_score: f64,
    /// When set, a neighbour must share this field's normalized value.
    #[serde(default)]
    pub same_field: Option<String>,
    /// Record predicates.
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
}

impl FuzzyBlockingConfig {
    /// A config over an indexed `collection.field`.
    pub fn new(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            limit_per_entity: DEFAULT_LIMIT_PER_ENTITY,
            min_score: 0.0,
            same_field: None,
            filters: Vec::new(),
        }
    }

    /// Neighbours kept per record.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit_per_entity = limit;
        self
    }

    /// Minimum relevance score.
    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    /// Require neighbours to agree on `field`, e.g. `"state"`.
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

/// Proposes each record's top text-search neighbours as candidates.
///
/// Needs a text index on the field; a missing index fails the run before
/// any record is processed. One search per record, so this is the most
/// expensive strategy.
#[derive(Debug, Clone)]
pub struct FuzzyBlocking {
    config: FuzzyBlockingConfig,
    filters: FilterSet,
}

impl FuzzyBlocking {
    /// Validate the config and build the strategy.
    pub fn new(config: FuzzyBlockingConfig) -> Result<Self> {
        if config.limit_per_entity == 0 {
            return Err(LinkageError::Configuration(
                "limit_per_entity must be positive".to_string(),
            ));
        }
        if !config.min_score.is_finite() || config.min_score < 0.0 {
            return Err(LinkageError::Configuration(format!(
                "min_score must be a non-negative number, got {}",
                config.min_score
            )));
        }
        let filters = FilterSet::new(config.filters.clone())?;
        Ok(Self { config, filters })
    }

    /// The validated config.
    pub fn config(&self) -> &FuzzyBlockingConfig {
        &self.config
    }
}

#[async_trait]
impl BlockingStrategy for FuzzyBlocking {
    fn method(&self) -> BlockingMethod {
        BlockingMethod::Fuzzy
    }

    fn describe(&self) -> String {
        format!("fuzzy[{}]", self.config.field)
    }

    async fn generate_candidates(
        &self,
        store: &dyn RecordStore,
        cancel: &CancellationToken,
    ) -> Result<BlockingOutput> {
        let collection = &self.config.collection;
        let field = &self.config.field;

        // A missing index fails here, before the scan.
        store.text_search(collection, field, "", 0).await?;

        let records = store.scan(collection, &self.filters).await?;
        let gate_values: HashMap<&str, Option<String>> = records
            .iter()
            .map(|r| {
                let gate = self
                    .config
                    .same_field
                    .as_deref()
                    .and_then(|f| r.text(f))
                    .map(|v| v.to_lowercase());
                (r.id.as_str(), gate)
            })
            .collect();

        let mut stats = BlockingStats::default();
        let mut pairs = CandidateSet::new();
        for (i, record) in records.iter().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 {
                ensure_active(cancel, "fuzzy blocking")?;
            }
            stats.records_scanned += 1;
            let Some(query) = record.text(field) else {
                continue;
            };

            // One extra hit, since the record usually finds itself.
            let hits = store
                .text_search(collection, field, &query, self.config.limit_per_entity + 1)
                .await?;
            let own_gate = gate_values.get(record.id.as_str()).cloned().flatten();
            let mut kept = 0;
            for hit in hits {
                if kept == self.config.limit_per_entity {
                    break;
                }
                if hit.id == record.id || hit.score < self.config.min_score {
                    continue;
                }
                let Some(other_gate) = gate_values.get(hit.id.as_str()) else {
                    // Filtered out of the scan.
                    continue;
                };
                let gated_out = own_gate.is_none() || *other_gate != own_gate;
                if self.config.same_field.is_some() && gated_out {
                    continue;
                }
                let pair = CandidatePair::new(record.id.as_str(), hit.id.as_str(), self.method());
                if let Some(pair) = pair {
                    pairs.insert(pair.with_metadata("score", hit.score));
                    kept += 1;
                }
            }
            if kept > 0 {
                stats.blocks_formed += 1;
            }
        }

        stats.pairs_emitted = pairs.len();
        debug!(
            strategy = %self.describe(),
            pairs = pairs.len(),
            "text search neighbours collected"
        );
        Ok(BlockingOutput { method: self.method(), pairs: pairs.into_vec(), stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemoryStore;
    use crate::record::Record;

    fn company(id: &str, name: &str, state: &str) -> Record {
        Record::new(id).with_field("name", name).with_field("state", state)
    }

    async fn store(indexed: bool) -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_collection("companies").await;
        store
            .insert_records(
                "companies",
                vec![
                    company("1", "Acme Corporation", "CA"),
                    company("2", "Acme Corp", "CA"),
                    company("3", "ACME Corporation", "NY"),
                    company("4", "Zenith Holdings", "CA"),
                ],
            )
            .await
            .unwrap();
        if indexed {
            store.create_text_index("companies", "name").await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn missing_index_fails_before_scanning() {
        let store = store(false).await;
        let strategy = FuzzyBlocking::new(FuzzyBlockingConfig::new("companies", "name")).unwrap();
        let err =
            strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LinkageError::ResourceNotFound { kind: "text index", .. }));
    }

    #[tokio::test]
    async fn neighbours_become_deduplicated_pairs() {
        let store = store(true).await;
        let config =
            FuzzyBlockingConfig::new("companies", "name").with_limit(2).with_min_score(0.5);
        let strategy = FuzzyBlocking::new(config).unwrap();
        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();

        assert!(output.pairs.iter().any(|p| p.key() == ("1", "2")));
        assert!(output.pairs.iter().any(|p| p.key() == ("1", "3")));
        assert!(output.pairs.iter().all(|p| p.id_a() < p.id_b()));
        assert!(output.pairs.iter().all(|p| p.metadata().contains_key("score")));
        assert!(!output.pairs.iter().any(|p| p.id_b() == "4" && p.id_a() == "1"));
        assert_eq!(output.stats.records_scanned, 4);
    }

    #[tokio::test]
    async fn same_field_gate_restricts_neighbours() {
        let store = store(true).await;
        let config = FuzzyBlockingConfig::new("companies", "name")
            .with_min_score(0.5)
            .with_same_field("state");
        let strategy = FuzzyBlocking::new(config).unwrap();
        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();
        assert!(output.pairs.iter().any(|p| p.key() == ("1", "2")));
        assert!(!output.pairs.iter().any(|p| p.key() == ("1", "3")));
    }

    #[tokio::test]
    async fn cancellation_is_observed() {
        let store = store(true).await;
        let strategy = FuzzyBlocking::new(FuzzyBlockingConfig::new("companies", "name")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = strategy.generate_candidates(&store, &cancel).await.unwrap_err();
        assert!(matches!(err, LinkageError::Cancelled { .. }));
    }

    #[test]
    fn rejects_zero_limit() {
        assert!(FuzzyBlocking::new(FuzzyBlockingConfig::new("c", "f").with_limit(0)).is_err());
        let nan = FuzzyBlockingConfig::new("c", "f").with_min_score(f64::NAN);
        assert!(FuzzyBlocking::new(nan).is_err());
    }
}
