use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    BlockBounds, BlockingOutput, BlockingStats, BlockingStrategy, DEFAULT_MAX_BLOCK_SIZE,
    DEFAULT_MIN_BLOCK_SIZE, pairs_from_groups,
};
use crate::error::{Result, ensure_active};
use crate::record::BlockingMethod;
use crate::store::{FieldFilter, FilterSet, KeyField, Normalizer, RecordStore};

/// Parameters for [`PhoneticBlocking`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoneticBlockingConfig {
    /// Collection to scan.
    pub collection: String,
    /// Name field to encode.
    pub field: String,
    /// Encode only the first word of the field (`"Jon Smith"` → `J500`).
    #[serde(default = "default_first_token_only")]
    pub first_token_only: bool,
    /// Optional extra key component, e.g. `state`, to tighten blocks.
    #[serde(default)]
    pub secondary: Option<KeyField>,
    /// Record predicates.
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    /// Blocks larger than this are skipped and counted.
    pub max_block_size: usize,
    /// Blocks smaller than this are ignored.
    pub min_block_size: usize,
}

fn default_first_token_only() -> bool {
    true
}

impl PhoneticBlockingConfig {
    /// A first-token Soundex config over `collection.field`.
    pub fn new(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            first_token_only: true,
            secondary: None,
            filters: Vec::new(),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
        }
    }

    /// Encode the whole field instead of the first word.
    pub fn whole_value(mut self) -> Self {
        self.first_token_only = false;
        self
    }

    /// Add a secondary key component.
    pub fn with_secondary(mut self, key: KeyField) -> Self {
        self.secondary = Some(key);
        self
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

/// Groups records whose name field shares a Soundex code.
///
/// Catches spelling variants that sound alike (`Smith`/`Smyth`,
/// `Jon`/`John`). Records whose field has no letters produce no code and
/// are left out.
#[derive(Debug, Clone)]
pub struct PhoneticBlocking {
    config: PhoneticBlockingConfig,
    keys: Vec<KeyField>,
    filters: FilterSet,
    bounds: BlockBounds,
}

impl PhoneticBlocking {
    /// Validate the config and build the strategy.
    pub fn new(config: PhoneticBlockingConfig) -> Result<Self> {
        let bounds = BlockBounds::new(config.min_block_size, config.max_block_size)?;
        let filters = FilterSet::new(config.filters.clone())?;

        let normalizer = if config.first_token_only {
            Normalizer::FirstTokenSoundex
        } else {
            Normalizer::Soundex
        };
        let mut keys = vec![KeyField::with_normalizer(config.field.clone(), normalizer)];
        keys.extend(config.secondary.clone());

        Ok(Self { config, keys, filters, bounds })
    }

    /// The validated config.
    pub fn config(&self) -> &PhoneticBlockingConfig {
        &self.config
    }
}

#[async_trait]
impl BlockingStrategy for PhoneticBlocking {
    fn method(&self) -> BlockingMethod {
        BlockingMethod::Phonetic
    }

    fn describe(&self) -> String {
        format!("phonetic[{}]", self.config.field)
    }

    async fn generate_candidates(
        &self,
        store: &dyn RecordStore,
        cancel: &CancellationToken,
    ) -> Result<BlockingOutput> {
        let groups = store.grouped_scan(&self.config.collection, &self.keys, &self.filters).await?;
        ensure_active(cancel, "phonetic blocking")?;
        debug!(strategy = %self.describe(), groups = groups.len(), "soundex groups formed");

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

    async fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_collection("people").await;
        store
            .insert_records(
                "people",
                vec![
                    Record::new("1").with_field("name", "Jon Smith").with_field("state", "CA"),
                    Record::new("2").with_field("name", "John Smyth").with_field("state", "CA"),
                    Record::new("3").with_field("name", "Joan Smith").with_field("state", "NY"),
                    Record::new("4").with_field("name", "Alice Jones").with_field("state", "CA"),
                    Record::new("5").with_field("name", "1234").with_field("state", "CA"),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn first_token_codes_group_spelling_variants() {
        let store = store().await;
        let strategy =
            PhoneticBlocking::new(PhoneticBlockingConfig::new("people", "name")).unwrap();
        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();

        let keys: Vec<_> = output.pairs.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec![("1", "2"), ("1", "3"), ("2", "3")]);
        assert_eq!(output.pairs[0].metadata()["block_key"], "J500");
        assert!(output.pairs.iter().all(|p| p.methods() == [BlockingMethod::Phonetic]));
    }

    #[tokio::test]
    async fn secondary_key_tightens_blocks() {
        let store = store().await;
        let strategy = PhoneticBlocking::new(
            PhoneticBlockingConfig::new("people", "name").with_secondary(KeyField::new("state")),
        )
        .unwrap();
        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();
        let keys: Vec<_> = output.pairs.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec![("1", "2")]);
        assert_eq!(output.pairs[0].metadata()["block_key"], "J500\u{1f}ca");
    }

    #[tokio::test]
    async fn whole_value_encoding() {
        let store = store().await;
        let strategy =
            PhoneticBlocking::new(PhoneticBlockingConfig::new("people", "name").whole_value())
                .unwrap();
        let output = strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap();
        // "Jon Smith" and "Joan Smith" share J525; "John Smyth" encodes as J525 too.
        assert_eq!(output.pairs.len(), 3);
    }
}
