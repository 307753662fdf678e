//! Store traits: the boundary between the resolution core and the document/graph engine.
//!
//! [`RecordStore`] covers the read side (filtered and grouped scans, ranked text
//! search, vector search, bulk fetch, relation groups). [`EdgeStore`] covers
//! similarity-edge persistence and cluster output. Both are async and object
//! safe so pipelines can hold them as `Arc<dyn ...>`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LinkageError, Result};
use crate::record::{Cluster, FieldValue, Record, SimilarityEdge};
use crate::similarity::{digits_only, normalize, soundex};

/// A predicate over a single record field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldFilter {
    /// The field is present and not blank.
    NotNull {
        /// Field name.
        field: String,
    },
    /// The textual value has at least `len` characters.
    MinLength {
        /// Field name.
        field: String,
        /// Minimum character count.
        len: usize,
    },
    /// The textual value has at most `len` characters.
    MaxLength {
        /// Field name.
        field: String,
        /// Maximum character count.
        len: usize,
    },
    /// The normalized textual value equals `value`.
    Equals {
        /// Field name.
        field: String,
        /// Expected value.
        value: String,
    },
    /// The textual value matches a regular expression.
    Matches {
        /// Field name.
        field: String,
        /// Regex source.
        pattern: String,
    },
}

impl FieldFilter {
    /// The field this predicate reads.
    pub fn field(&self) -> &str {
        match self {
            FieldFilter::NotNull { field }
            | FieldFilter::MinLength { field, .. }
            | FieldFilter::MaxLength { field, .. }
            | FieldFilter::Equals { field, .. }
            | FieldFilter::Matches { field, .. } => field,
        }
    }
}

/// A validated conjunction of [`FieldFilter`]s.
///
/// Regex patterns are compiled once at construction so that an invalid
/// pattern is a configuration error rather than a scan-time failure.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<FieldFilter>,
    compiled: Vec<Option<Regex>>,
}

impl FilterSet {
    /// Validate and compile a list of filters.
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Configuration`] for an invalid regex or a
    /// `MinLength` bound above the matching `MaxLength`.
    pub fn new(filters: Vec<FieldFilter>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(filters.len());
        for filter in &filters {
            match filter {
                FieldFilter::Matches { field, pattern } => {
                    let regex = Regex::new(pattern).map_err(|e| {
                        LinkageError::Configuration(format!(
                            "invalid pattern for field '{field}': {e}"
                        ))
                    })?;
                    compiled.push(Some(regex));
                }
                _ => compiled.push(None),
            }
        }

        for filter in &filters {
            if let FieldFilter::MinLength { field, len: min } = filter {
                let max = filters.iter().find_map(|f| match f {
                    FieldFilter::MaxLength { field: other, len } if other == field => Some(*len),
                    _ => None,
                });
                if let Some(max) = max.filter(|max| max < min) {
                    return Err(LinkageError::Configuration(format!(
                        "field '{field}': min length {min} exceeds max length {max}"
                    )));
                }
            }
        }

        Ok(Self { filters, compiled })
    }

    /// An empty set that accepts every record.
    pub fn none() -> Self {
        Self::default()
    }

    /// The underlying predicates, for stores that translate them into queries.
    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    /// Evaluate all predicates against a record.
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().zip(&self.compiled).all(|(filter, regex)| {
            let value = record.text(filter.field());
            match filter {
                FieldFilter::NotNull { .. } => record.get(filter.field()).is_some(),
                FieldFilter::MinLength { len, .. } => {
                    value.is_some_and(|v| v.chars().count() >= *len)
                }
                FieldFilter::MaxLength { len, .. } => {
                    value.is_some_and(|v| v.chars().count() <= *len)
                }
                FieldFilter::Equals { value: expected, .. } => {
                    value.is_some_and(|v| normalize(&v) == normalize(expected))
                }
                FieldFilter::Matches { .. } => match (value, regex) {
                    (Some(v), Some(regex)) => regex.is_match(&v),
                    _ => false,
                },
            }
        })
    }
}

/// How a field value is turned into a grouping key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Normalizer {
    /// Casefold and collapse whitespace.
    #[default]
    Lowercase,
    /// ASCII digits only (phone numbers, postal codes).
    Digits,
    /// Soundex of the whole value.
    Soundex,
    /// Soundex of the first word only.
    FirstTokenSoundex,
}

impl Normalizer {
    /// Apply the normalizer. Returns `None` when nothing usable remains.
    pub fn apply(&self, value: &FieldValue) -> Option<String> {
        let text = value.as_text()?;
        let key = match self {
            Normalizer::Lowercase => normalize(&text),
            Normalizer::Digits => digits_only(&text),
            Normalizer::Soundex => soundex(&text),
            Normalizer::FirstTokenSoundex => soundex(text.split_whitespace().next()?),
        };
        if key.is_empty() { None } else { Some(key) }
    }
}

/// One component of a composite blocking key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyField {
    /// Field name.
    pub field: String,
    /// Key normalization.
    #[serde(default)]
    pub normalizer: Normalizer,
}

impl KeyField {
    /// A key component with the default normalizer.
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into(), normalizer: Normalizer::default() }
    }

    /// A key component with an explicit normalizer.
    pub fn with_normalizer(field: impl Into<String>, normalizer: Normalizer) -> Self {
        Self { field: field.into(), normalizer }
    }
}

/// Separator between composite key components (ASCII unit separator).
pub const KEY_SEPARATOR: &str = "\u{1f}";

/// Build the composite key of a record, or `None` if any component is missing.
pub fn composite_key(record: &Record, keys: &[KeyField]) -> Option<String> {
    let parts = keys
        .iter()
        .map(|k| record.get(&k.field).and_then(|v| k.normalizer.apply(v)))
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join(KEY_SEPARATOR))
}

/// Records sharing a grouping key (or an intermediate entity).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    /// The shared key.
    pub key: String,
    /// Member record ids, sorted.
    pub ids: Vec<String>,
}

impl Group {
    /// Number of members.
    pub fn size(&self) -> usize {
        self.ids.len()
    }
}

/// A record id with a relevance or similarity score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredId {
    /// Record id.
    pub id: String,
    /// Score (higher is more relevant).
    pub score: f64,
}

/// Read-side store operations used by blocking and scoring.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Group records matching `filters` by a composite key.
    ///
    /// Records missing any key component are excluded. Returns every group,
    /// including singletons, so callers can report group sizes.
    async fn grouped_scan(
        &self,
        collection: &str,
        keys: &[KeyField],
        filters: &FilterSet,
    ) -> Result<Vec<Group>>;

    /// Return every record matching `filters`.
    async fn scan(&self, collection: &str, filters: &FilterSet) -> Result<Vec<Record>>;

    /// Ranked text search over an indexed field.
    ///
    /// Returns at most `limit` ids ordered by descending score.
    /// Fails with [`LinkageError::ResourceNotFound`] if no index exists.
    async fn text_search(
        &self,
        collection: &str,
        field: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredId>>;

    /// Nearest neighbours by cosine similarity over a vector field.
    async fn vector_search(
        &self,
        collection: &str,
        field: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredId>>;

    /// Fetch records by id in one round trip. Unknown ids are omitted.
    async fn fetch_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Record>>;

    /// Groups of records linked to the same intermediate entity through `relation`.
    async fn relation_groups(&self, relation: &str) -> Result<Vec<Group>>;
}

/// Which edges a cleanup removes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeFilter {
    /// Only edges written with this method.
    pub method: Option<String>,
    /// Only edges created strictly before this instant.
    pub older_than: Option<DateTime<Utc>>,
}

impl EdgeFilter {
    /// Whether `edge` is selected.
    pub fn matches(&self, edge: &SimilarityEdge) -> bool {
        self.method.as_ref().is_none_or(|m| &edge.method == m)
            && self.older_than.is_none_or(|t| edge.created_at < t)
    }
}

/// Write-side store operations for similarity edges and clusters.
#[async_trait]
pub trait EdgeStore: Send + Sync {
    /// Create an edge relation. No-op if it already exists.
    async fn ensure_relation(&self, relation: &str) -> Result<()>;

    /// Insert edges whose key is not yet present; ignore the rest.
    ///
    /// Returns the number of edges actually inserted.
    async fn upsert_edges(&self, relation: &str, edges: &[SimilarityEdge]) -> Result<usize>;

    /// Return every edge of a relation in one call.
    async fn scan_edges(&self, relation: &str) -> Result<Vec<SimilarityEdge>>;

    /// Delete the edges selected by `filter`. Returns the number removed.
    async fn delete_edges(&self, relation: &str, filter: &EdgeFilter) -> Result<usize>;

    /// Edge counts grouped by method.
    async fn edge_counts(&self, relation: &str) -> Result<BTreeMap<String, usize>>;

    /// Persist clusters, optionally truncating the collection first.
    async fn replace_clusters(
        &self,
        collection: &str,
        clusters: &[Cluster],
        truncate: bool,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        Record::new("1")
            .with_field("phone", "(555) 010-0100")
            .with_field("name", "Jon Smith")
            .with_field("state", "CA")
    }

    #[test]
    fn filters_are_conjunctive() {
        let filters = FilterSet::new(vec![
            FieldFilter::NotNull { field: "phone".into() },
            FieldFilter::MinLength { field: "name".into(), len: 3 },
            FieldFilter::Equals { field: "state".into(), value: "ca".into() },
            FieldFilter::Matches { field: "phone".into(), pattern: r"^\(\d{3}\)".into() },
        ])
        .unwrap();
        assert!(filters.matches(&record()));

        let strict = FilterSet::new(vec![FieldFilter::MaxLength { field: "name".into(), len: 4 }])
            .unwrap();
        assert!(!strict.matches(&record()));
        assert!(FilterSet::none().matches(&record()));
    }

    #[test]
    fn invalid_filters_fail_at_construction() {
        assert!(matches!(
            FilterSet::new(vec![FieldFilter::Matches { field: "x".into(), pattern: "(".into() }]),
            Err(LinkageError::Configuration(_))
        ));
        assert!(
            FilterSet::new(vec![
                FieldFilter::MinLength { field: "x".into(), len: 5 },
                FieldFilter::MaxLength { field: "x".into(), len: 2 },
            ])
            .is_err()
        );
    }

    #[test]
    fn composite_keys_normalize_each_component() {
        let keys = [
            KeyField::with_normalizer("phone", Normalizer::Digits),
            KeyField::new("state"),
        ];
        assert_eq!(composite_key(&record(), &keys).as_deref(), Some("5550100100\u{1f}ca"));

        let missing = [KeyField::new("email")];
        assert_eq!(composite_key(&record(), &missing), None);

        let phonetic = [KeyField::with_normalizer("name", Normalizer::FirstTokenSoundex)];
        assert_eq!(composite_key(&record(), &phonetic).as_deref(), Some("J500"));
    }

    #[test]
    fn composite_key_components_do_not_run_together() {
        let keys = [KeyField::new("a"), KeyField::new("b")];
        let left = Record::new("1").with_field("a", "x|y").with_field("b", "z");
        let right = Record::new("2").with_field("a", "x").with_field("b", "y|z");
        assert_ne!(composite_key(&left, &keys), composite_key(&right, &keys));
    }
}
