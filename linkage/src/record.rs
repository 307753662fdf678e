//! Data types for records, candidate pairs, scored pairs, edges and clusters.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Free-form, strategy-specific metadata attached to pairs and edges.
pub type Metadata = BTreeMap<String, Value>;

/// A single field value of a [`Record`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent or explicitly null.
    Null,
    /// A numeric value.
    Number(f64),
    /// A string value.
    Text(String),
    /// A fixed-length embedding.
    Vector(Vec<f32>),
}

impl FieldValue {
    /// Whether the value carries no information (null, or blank text).
    pub fn is_missing(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Vector(v) => v.is_empty(),
            FieldValue::Number(n) => n.is_nan(),
        }
    }

    /// Textual view of scalar values. Vectors have none.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            FieldValue::Text(s) => Some(Cow::Borrowed(s.as_str())),
            FieldValue::Number(n) if *n == 0.0 => Some(Cow::Borrowed("0")),
            FieldValue::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                Some(Cow::Owned(format!("{n:.0}")))
            }
            FieldValue::Number(n) => Some(Cow::Owned(n.to_string())),
            FieldValue::Null | FieldValue::Vector(_) => None,
        }
    }

    /// The embedding, if this is a vector value.
    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            FieldValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Number(_) => "number",
            FieldValue::Text(_) => "text",
            FieldValue::Vector(_) => "vector",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<Vec<f32>> for FieldValue {
    fn from(value: Vec<f32>) -> Self {
        FieldValue::Vector(value)
    }
}

/// A keyed document owned by the external store. The core never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Stable unique identifier.
    pub id: String,
    /// Named field values.
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
}

impl Record {
    /// Create an empty record with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), fields: HashMap::new() }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Look up a field, treating missing values as absent.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).filter(|v| !v.is_missing())
    }

    /// Textual value of a field, if present and scalar.
    pub fn text(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).and_then(FieldValue::as_text)
    }
}

/// The blocking strategy that proposed a pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMethod {
    /// Exact composite-key blocking.
    Exact,
    /// Soundex-code blocking.
    Phonetic,
    /// Ranked text-search blocking.
    Fuzzy,
    /// Embedding nearest-neighbour blocking.
    Vector,
    /// Shared-intermediate graph blocking.
    Relationship,
}

impl BlockingMethod {
    /// Stable snake_case name, also used as the edge `method`.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingMethod::Exact => "exact",
            BlockingMethod::Phonetic => "phonetic",
            BlockingMethod::Fuzzy => "fuzzy",
            BlockingMethod::Vector => "vector",
            BlockingMethod::Relationship => "relationship",
        }
    }
}

impl fmt::Display for BlockingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two record identifiers proposed for detailed comparison.
///
/// The fields are private so that every instance upholds `id_a < id_b`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidatePair {
    id_a: String,
    id_b: String,
    methods: Vec<BlockingMethod>,
    #[serde(default)]
    metadata: Metadata,
}

impl CandidatePair {
    /// Build a canonically ordered pair. Returns `None` for a self-pair.
    pub fn new(a: impl Into<String>, b: impl Into<String>, method: BlockingMethod) -> Option<Self> {
        let (a, b) = (a.into(), b.into());
        if a == b {
            return None;
        }
        let (id_a, id_b) = if a < b { (a, b) } else { (b, a) };
        Some(Self { id_a, id_b, methods: vec![method], metadata: Metadata::new() })
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The smaller identifier.
    pub fn id_a(&self) -> &str {
        &self.id_a
    }

    /// The larger identifier.
    pub fn id_b(&self) -> &str {
        &self.id_b
    }

    /// The canonical dedup key.
    pub fn key(&self) -> (&str, &str) {
        (&self.id_a, &self.id_b)
    }

    /// Every strategy that proposed this pair, in first-seen order.
    pub fn methods(&self) -> &[BlockingMethod] {
        &self.methods
    }

    /// Strategy-specific metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Fold another proposal of the same pair into this one.
    ///
    /// Methods are appended once each; existing metadata keys win.
    pub fn absorb(&mut self, other: CandidatePair) {
        debug_assert_eq!(self.key(), other.key());
        for method in other.methods {
            if !self.methods.contains(&method) {
                self.methods.push(method);
            }
        }
        for (k, v) in other.metadata {
            self.metadata.entry(k).or_insert(v);
        }
    }
}

/// A deduplicated union of candidate pairs from any number of strategies.
///
/// Keyed on the canonical `(id_a, id_b)` tuple, so insertion order and
/// duplicate proposals never change the resulting set.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pairs: BTreeMap<(String, String), CandidatePair>,
}

impl CandidateSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair. Returns `true` if the pair was not present before.
    pub fn insert(&mut self, pair: CandidatePair) -> bool {
        let key = (pair.id_a.clone(), pair.id_b.clone());
        match self.pairs.get_mut(&key) {
            Some(existing) => {
                existing.absorb(pair);
                false
            }
            None => {
                self.pairs.insert(key, pair);
                true
            }
        }
    }

    /// Whether the unordered pair `{a, b}` is present.
    pub fn contains(&self, a: &str, b: &str) -> bool {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let key = (lo.to_string(), hi.to_string());
        self.pairs.contains_key(&key)
    }

    /// Number of distinct pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.values()
    }

    /// Consume the set into a vector in canonical order.
    pub fn into_vec(self) -> Vec<CandidatePair> {
        self.pairs.into_values().collect()
    }
}

impl Extend<CandidatePair> for CandidateSet {
    fn extend<T: IntoIterator<Item = CandidatePair>>(&mut self, iter: T) {
        for pair in iter {
            self.insert(pair);
        }
    }
}

impl FromIterator<CandidatePair> for CandidateSet {
    fn from_iter<T: IntoIterator<Item = CandidatePair>>(iter: T) -> Self {
        let mut set = CandidateSet::new();
        set.extend(iter);
        set
    }
}

/// Three-way Fellegi-Sunter decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// `total_score > upper`.
    Match,
    /// Between the thresholds; left for manual review.
    PossibleMatch,
    /// `total_score <= lower`.
    NonMatch,
}

impl Decision {
    /// Apply the decision rule: strict above `upper`, inclusive at `lower`.
    pub fn classify(total_score: f64, upper: f64, lower: f64) -> Self {
        if total_score > upper {
            Decision::Match
        } else if total_score <= lower {
            Decision::NonMatch
        } else {
            Decision::PossibleMatch
        }
    }
}

/// How a single field contributed to a pair's score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldOutcome {
    /// Similarity reached the field's agreement threshold.
    Agree,
    /// Similarity fell below the threshold.
    Disagree,
    /// One side had no value; the field did not contribute.
    Missing,
}

/// Per-field breakdown of a [`ScoredPair`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldScore {
    /// Field name.
    pub field: String,
    /// Raw similarity in `[0, 1]` (cosine may be negative), if computed.
    pub similarity: Option<f64>,
    /// Agreement outcome.
    pub outcome: FieldOutcome,
    /// Contribution to the total, after importance.
    pub weight: f64,
}

/// A candidate pair with its Fellegi-Sunter score and decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredPair {
    /// The smaller identifier.
    pub id_a: String,
    /// The larger identifier.
    pub id_b: String,
    /// Sum of weighted log-likelihood ratios.
    pub total_score: f64,
    /// Field-level breakdown; empty unless detailed scoring was requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_scores: Vec<FieldScore>,
    /// Match decision.
    pub decision: Decision,
    /// Strategies that proposed the pair.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<BlockingMethod>,
}

/// A persisted similarity edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityEdge {
    /// Deterministic key derived from the unordered endpoint pair.
    pub key: String,
    /// Source vertex.
    pub from: String,
    /// Target vertex.
    pub to: String,
    /// Score of the pair that produced the edge.
    pub score: f64,
    /// Method label, e.g. `"exact+phonetic"` or `"fellegi_sunter"`.
    pub method: String,
    /// Caller-provided metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation time of the first write.
    pub created_at: DateTime<Utc>,
}

/// A group of record ids believed to represent one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cluster {
    /// Deterministic id derived from the smallest member.
    pub cluster_id: String,
    /// Member record ids.
    pub members: BTreeSet<String>,
    /// Number of members.
    pub size: usize,
}

impl Cluster {
    /// Build a cluster from its members. Returns `None` for an empty set.
    pub fn from_members(members: BTreeSet<String>) -> Option<Self> {
        let anchor = members.iter().next()?;
        let digest = Sha256::digest(anchor.as_bytes());
        let hex = format!("{digest:x}");
        Some(Self { cluster_id: format!("cluster-{}", &hex[..16]), size: members.len(), members })
    }

    /// Whether `id` belongs to this cluster.
    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_pair_is_canonical() {
        let pair = CandidatePair::new("b", "a", BlockingMethod::Exact).unwrap();
        assert_eq!(pair.key(), ("a", "b"));
        assert!(CandidatePair::new("a", "a", BlockingMethod::Exact).is_none());
    }

    #[test]
    fn set_merges_provenance_and_keeps_first_metadata() {
        let mut set = CandidateSet::new();
        assert!(set.insert(
            CandidatePair::new("1", "2", BlockingMethod::Exact).unwrap().with_metadata("key", "555")
        ));
        assert!(!set.insert(
            CandidatePair::new("2", "1", BlockingMethod::Phonetic)
                .unwrap()
                .with_metadata("key", "J525")
                .with_metadata("code", "J525")
        ));
        assert_eq!(set.len(), 1);
        let pair = set.iter().next().unwrap();
        assert_eq!(pair.methods(), &[BlockingMethod::Exact, BlockingMethod::Phonetic]);
        assert_eq!(pair.metadata()["key"], "555");
        assert_eq!(pair.metadata()["code"], "J525");
        assert!(set.contains("2", "1"));
    }

    #[test]
    fn decision_boundaries() {
        assert_eq!(Decision::classify(2.0, 2.0, -1.0), Decision::PossibleMatch);
        assert_eq!(Decision::classify(2.0001, 2.0, -1.0), Decision::Match);
        assert_eq!(Decision::classify(-1.0, 2.0, -1.0), Decision::NonMatch);
        assert_eq!(Decision::classify(0.0, 2.0, -1.0), Decision::PossibleMatch);
    }

    #[test]
    fn missing_values() {
        let record = Record::new("1").with_field("name", "  ").with_field("age", 42.0);
        assert!(record.get("name").is_none());
        assert_eq!(record.text("age").as_deref(), Some("42"));
        assert!(record.text("phone").is_none());
    }

    #[test]
    fn whole_numbers_render_without_truncation() {
        let text = |n: f64| FieldValue::Number(n).as_text().map(Cow::into_owned);
        assert_eq!(text(1e19).as_deref(), Some("10000000000000000000"));
        assert_eq!(text(-2e19).as_deref(), Some("-20000000000000000000"));
        assert_eq!(text(-0.0).as_deref(), Some("0"));
        assert_eq!(text(2.5).as_deref(), Some("2.5"));
    }

    #[test]
    fn cluster_id_is_stable() {
        let a = Cluster::from_members(["b".to_string(), "a".to_string()].into()).unwrap();
        let b = Cluster::from_members(["a".to_string(), "c".to_string()].into()).unwrap();
        assert_eq!(a.cluster_id, b.cluster_id);
        assert_eq!(a.size, 2);
        assert!(Cluster::from_members(BTreeSet::new()).is_none());
    }
}
