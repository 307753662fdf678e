use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BlockBounds, BlockingOutput, BlockingStats, BlockingStrategy, pairs_from_groups};
use crate::error::{LinkageError, Result, ensure_active};
use crate::record::BlockingMethod;
use crate::store::RecordStore;

/// Default cap on the number of records linked to one intermediate.
pub const DEFAULT_MAX_DEGREE: usize = 10;

/// Parameters for [`RelationshipBlocking`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipBlockingConfig {
    /// Relation linking records to intermediate entities
    /// (shared address, shared device, shared account).
    pub relation: String,
    /// Intermediates linked to more records than this are skipped.
    pub max_degree: usize,
}

impl RelationshipBlockingConfig {
    /// A config over `relation` with the default degree cap.
    pub fn new(relation: impl Into<String>) -> Self {
        Self { relation: relation.into(), max_degree: DEFAULT_MAX_DEGREE }
    }

    /// Override the degree cap.
    pub fn with_max_degree(mut self, max_degree: usize) -> Self {
        self.max_degree = max_degree;
        self
    }
}

/// Pairs records that share an intermediate entity.
///
/// High-degree intermediates (a shared office address, a default device id)
/// connect unrelated records and are skipped. Each pair carries the
/// intermediate as `block_key` and its degree as `block_size`.
#[derive(Debug, Clone)]
pub struct RelationshipBlocking {
    config: RelationshipBlockingConfig,
    bounds: BlockBounds,
}

impl RelationshipBlocking {
    /// Validate the config and build the strategy.
    pub fn new(config: RelationshipBlockingConfig) -> Result<Self> {
        if config.max_degree < 2 {
            return Err(LinkageError::Configuration(format!(
                "max_degree must be at least 2, got {}",
                config.max_degree
            )));
        }
        let bounds = BlockBounds::new(2, config.max_degree)?;
        Ok(Self { config, bounds })
    }

    /// The validated config.
    pub fn config(&self) -> &RelationshipBlockingConfig {
        &self.config
    }
}

#[async_trait]
impl BlockingStrategy for RelationshipBlocking {
    fn method(&self) -> BlockingMethod {
        BlockingMethod::Relationship
    }

    fn describe(&self) -> String {
        format!("relationship[{}]", self.config.relation)
    }

    async fn generate_candidates(
        &self,
        store: &dyn RecordStore,
        cancel: &CancellationToken,
    ) -> Result<BlockingOutput> {
        let groups = store.relation_groups(&self.config.relation).await?;
        ensure_active(cancel, "relationship blocking")?;

        let mut stats = BlockingStats::default();
        let pairs = pairs_from_groups(groups, self.method(), self.bounds, &mut stats);
        debug!(strategy = %self.describe(), pairs = pairs.len(), "shared intermediates expanded");
        Ok(BlockingOutput { method: self.method(), pairs, stats })
    }
}
