use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    BlockBounds, BlockingOutput, BlockingStats, BlockingStrategy, DEFAULT_MAX_BLOCK_SIZE,
    DEFAULT_MIN_BLOCK_SIZE, pairs_from_groups,
};
use crate::error::{LinkageError, Result, ensure_active};
use crate::record::BlockingMethod;
use crate::store::{FieldFilter, FilterSet, KeyField, RecordStore};

/// Parameters for [`ExactBlocking`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExactBlockingConfig {
    /// Collection to scan.
    pub collection: String,
    /// Composite key components.
    pub blocking_fields: Vec<KeyField>,
    /// Predicates a record must satisfy to be blocked at all.
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    /// Blocks larger than this are skipped and counted.
    pub max_block_size: usize,
    /// Blocks smaller than this are ignored.
    pub min_block_size: usize,
}

impl ExactBlockingConfig {
    /// A config over `collection` keyed on `blocking_fields` with default bounds.
    pub fn new(collection: impl Into<String>, blocking_fields: Vec<KeyField>) -> Self {
        Self {
            collection: collection.into(),
            blocking_fields,
            filters: Vec::new(),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
        }
    }

    /// Add a record filter.
    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Override the block size bounds.
    pub fn with_block_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_block_size = min;
        self.max_block_size = max;
        self
    }
}

/// Groups records by a normalized composite key; every pair inside a block
/// becomes a candidate.
///
/// One grouped scan, then O(k²) pairs per block of size k. Oversized blocks
/// (placeholder values like `"0000000000"`) are skipped.
///
/// # Example
///
/// ```rust,ignore
/// use linkage::blocking::{ExactBlocking, ExactBlockingConfig};
/// use linkage::store::{KeyField, Normalizer};
///
/// let strategy = ExactBlocking::new(ExactBlockingConfig::new(
///     "customers",
///     vec![KeyField::with_normalizer("phone", Normalizer::Digits), KeyField::new("state")],
/// ))?;
/// ```
#[derive(Debug, Clone)]
pub struct ExactBlocking {
    config: ExactBlockingConfig,
    filters: FilterSet,
    bounds: BlockBounds,
}

impl ExactBlocking {
    /// Validate the config and build the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Configuration`] for an empty key, invalid
    /// bounds, or an invalid filter.
    pub fn new(config: ExactBlockingConfig) -> Result<Self> {
        if config.blocking_fields.is_empty() {
            return Err(LinkageError::Configuration(
                "exact blocking needs at least one blocking field".to_string(),
            ));
        }
        let bounds = BlockBounds::new(config.min_block_size, config.max_block_size)?;
        let filters = FilterSet::new(config.filters.clone())?;
        Ok(Self { config, filters, bounds })
    }

    /// The validated config.
    pub fn config(&self) -> &ExactBlockingConfig {
        &self.config
    }
}

#[async_trait]
impl BlockingStrategy for ExactBlocking {
    fn method(&self) -> BlockingMethod {
        BlockingMethod::Exact
    }

    fn describe(&self) -> String {
        let fields: Vec<&str> =
            self.config.blocking_fields.iter().map(|k| k.field.as_str()).collect();
        format!("exact[{}]", fields.join("+"))
    }

    async fn generate_candidates(
        &self,
        store: &dyn RecordStore,
        cancel: &CancellationToken,
    ) -> Result<BlockingOutput> {
        let groups = store
            .grouped_scan(&self.config.collection, &self.config.blocking_fields, &self.filters)
            .await?;
        ensure_active(cancel, "exact blocking")?;
        debug!(strategy = %self.describe(), groups = groups.len(), "grouped scan finished");

        let mut stats = BlockingStats::default();
        let pairs = pairs_from_groups(groups, self.method(), self.bounds, &mut stats);
        Ok(BlockingOutput { method: self.method(), pairs, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemoryStore;
    use crate::record::Record;
    use crate::store::Normalizer;

    async fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_collection("customers").await;
        let mut records = vec![
            Record::new("1").with_field("phone", "555-0100").with_field("state", "CA"),
            Record::new("2").with_field("phone", "(555) 0100").with_field("state", "ca"),
            Record::new("3").with_field("phone", "555-9999").with_field("state", "CA"),
            Record::new("4").with_field("phone", "555-0100").with_field("state", "NY"),
        ];
        for i in 0..5 {
            records.push(
                Record::new(format!("p{i}"))
                    .with_field("phone", "0000000000")
                    .with_field("state", "CA"),
            );
        }
        store.insert_records("customers", records).await.unwrap();
        store
    }

    #[tokio::test]
    async fn composite_key_blocks_and_skips_placeholders() {
        let store = store().await;
        let keys = vec![
            KeyField::with_normalizer("phone", Normalizer::Digits),
            KeyField::new("state"),
        ];
        let strategy =
            ExactBlocking::new(ExactBlockingConfig::new("customers", keys).with_block_bounds(2, 4))
                .unwrap();

        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.pairs.len(), 1);
        assert_eq!(output.pairs[0].key(), ("1", "2"));
        assert_eq!(output.stats.blocks_skipped_oversized, 1);
        assert_eq!(output.stats.pairs_emitted, 1);
    }

    #[tokio::test]
    async fn filters_exclude_records_before_grouping() {
        let store = store().await;
        let keys = vec![KeyField::with_normalizer("phone", Normalizer::Digits)];
        let filter = FieldFilter::Matches { field: "phone".into(), pattern: "^[^0]".into() };
        let strategy =
            ExactBlocking::new(ExactBlockingConfig::new("customers", keys).with_filter(filter))
                .unwrap();
        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();
        let keys: Vec<_> = output.pairs.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec![("1", "2"), ("1", "4"), ("2", "4")]);
    }

    #[tokio::test]
    async fn missing_collection_fails_fast() {
        let strategy =
            ExactBlocking::new(ExactBlockingConfig::new("absent", vec![KeyField::new("phone")]))
                .unwrap();
        let err = strategy
            .generate_candidates(&InMemoryStore::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkageError::ResourceNotFound { .. }));
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        assert!(ExactBlocking::new(ExactBlockingConfig::new("c", vec![])).is_err());
        let inverted =
            ExactBlockingConfig::new("c", vec![KeyField::new("x")]).with_block_bounds(3, 2);
        assert!(ExactBlocking::new(inverted).is_err());
    }
}
