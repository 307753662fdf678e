//! Weakly connected components over the similarity-edge relation.
//!
//! All edges are read in one bulk call, turned into an undirected adjacency
//! map, and traversed in memory. Nothing touches the store between the fetch
//! and the optional write of the resulting clusters.
//!
//! # Example
//!
//! ```rust,ignore
//! use linkage::clustering::{ClusterOptions, ClusteringEngine};
//! use linkage::config::ClusteringConfig;
//!
//! let engine = ClusteringEngine::new(store.clone(), ClusteringConfig::default())?;
//! let clusters = engine.cluster(ClusterOptions::default(), &cancel).await?;
//! let report = engine.validate_clusters().await;
//! assert!(report.is_valid());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClusteringConfig;
use crate::error::{LinkageError, Result, ensure_active};
use crate::record::{Cluster, SimilarityEdge};
use crate::store::EdgeStore;

/// Undirected adjacency: vertex → neighbours.
pub type Adjacency = HashMap<String, HashSet<String>>;

/// Lifecycle of a [`ClusteringEngine`] run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringState {
    /// No run started yet.
    #[default]
    Idle,
    /// Waiting on the bulk edge fetch.
    FetchingEdges,
    /// Edges loaded into the adjacency map.
    GraphBuilt,
    /// Components being computed.
    Traversing,
    /// Clusters available.
    Done,
    /// The fetch or the cluster write failed; no partial result is kept.
    Failed,
}

impl fmt::Display for ClusteringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusteringState::Idle => "idle",
            ClusteringState::FetchingEdges => "fetching_edges",
            ClusteringState::GraphBuilt => "graph_built",
            ClusteringState::Traversing => "traversing",
            ClusteringState::Done => "done",
            ClusteringState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Computes connected components of an in-memory graph.
///
/// Implement this to plug in a different traversal, e.g. one that spills to
/// disk for graphs that do not fit in memory.
pub trait ComponentFinder: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Partition every vertex of `graph` into components.
    fn components(&self, graph: &Adjacency) -> Vec<BTreeSet<String>>;
}

/// Iterative breadth-first traversal.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreadthFirst;

impl ComponentFinder for BreadthFirst {
    fn name(&self) -> &'static str {
        "breadth_first"
    }

    fn components(&self, graph: &Adjacency) -> Vec<BTreeSet<String>> {
        let mut vertices: Vec<&str> = graph.keys().map(String::as_str).collect();
        vertices.sort_unstable();

        let mut visited: HashSet<&str> = HashSet::with_capacity(vertices.len());
        let mut components = Vec::new();
        for start in vertices {
            if !visited.insert(start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([start]);
            while let Some(vertex) = queue.pop_front() {
                component.insert(vertex.to_string());
                for neighbour in graph.get(vertex).into_iter().flatten() {
                    if visited.insert(neighbour.as_str()) {
                        queue.push_back(neighbour.as_str());
                    }
                }
            }
            components.push(component);
        }
        components
    }
}

/// Disjoint-set union with path compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnionFind;

impl UnionFind {
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        let mut root = i;
        while parent[root] != root {
            root = parent[root];
        }
        while parent[i] != root {
            let next = parent[i];
            parent[i] = root;
            i = next;
        }
        root
    }

    fn union(parent: &mut [usize], i: usize, j: usize) {
        let root_i = Self::find(parent, i);
        let root_j = Self::find(parent, j);
        if root_i != root_j {
            parent[root_i.max(root_j)] = root_i.min(root_j);
        }
    }
}

impl ComponentFinder for UnionFind {
    fn name(&self) -> &'static str {
        "union_find"
    }

    fn components(&self, graph: &Adjacency) -> Vec<BTreeSet<String>> {
        let mut vertices: Vec<&str> = graph.keys().map(String::as_str).collect();
        vertices.sort_unstable();
        let index: HashMap<&str, usize> =
            vertices.iter().enumerate().map(|(i, v)| (*v, i)).collect();

        let mut parent: Vec<usize> = (0..vertices.len()).collect();
        for (vertex, neighbours) in graph {
            let i = index[vertex.as_str()];
            for neighbour in neighbours {
                if let Some(&j) = index.get(neighbour.as_str()) {
                    Self::union(&mut parent, i, j);
                }
            }
        }

        let mut groups: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for (i, vertex) in vertices.iter().enumerate() {
            let root = Self::find(&mut parent, i);
            groups.entry(root).or_default().insert((*vertex).to_string());
        }
        groups.into_values().collect()
    }
}

/// Build the undirected adjacency map of `edges`.
///
/// Self-loops register the vertex without a neighbour.
pub fn build_adjacency<'a>(edges: impl IntoIterator<Item = &'a SimilarityEdge>) -> Adjacency {
    let mut graph = Adjacency::new();
    for edge in edges {
        if edge.from == edge.to {
            graph.entry(edge.from.clone()).or_default();
            continue;
        }
        graph.entry(edge.from.clone()).or_default().insert(edge.to.clone());
        graph.entry(edge.to.clone()).or_default().insert(edge.from.clone());
    }
    graph
}

/// Options for [`ClusteringEngine::cluster`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterOptions {
    /// Persist clusters through [`EdgeStore::replace_clusters`].
    pub store_results: bool,
    /// Clear the cluster collection before writing.
    pub truncate_existing: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self { store_results: true, truncate_existing: true }
    }
}

/// Result of [`ClusteringEngine::validate_clusters`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    /// Number of clusters checked.
    pub clusters_checked: usize,
    /// Number of edges checked.
    pub edges_checked: usize,
    /// Members that appear in more than one cluster.
    pub overlapping_members: Vec<String>,
    /// Edges whose endpoints sit in different clusters.
    pub split_edges: Vec<(String, String)>,
    /// Clusters smaller than `min_cluster_size`.
    pub undersized_clusters: Vec<String>,
}

impl ValidationReport {
    /// Whether no check failed.
    pub fn is_valid(&self) -> bool {
        self.overlapping_members.is_empty()
            && self.split_edges.is_empty()
            && self.undersized_clusters.is_empty()
    }
}

/// Size summary of the current clusters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterStatistics {
    /// Number of clusters.
    pub count: usize,
    /// Sum of cluster sizes.
    pub total_members: usize,
    /// Smallest cluster size, 0 when there are none.
    pub min_size: usize,
    /// Largest cluster size.
    pub max_size: usize,
    /// Mean cluster size.
    pub average_size: f64,
    /// Cluster size → number of clusters with that size.
    pub size_distribution: BTreeMap<usize, usize>,
}

#[derive(Debug, Default)]
struct Snapshot {
    state: ClusteringState,
    clusters: Vec<Cluster>,
    membership: HashMap<String, usize>,
    edges: Vec<(String, String)>,
}

/// Clusters the similarity graph into resolved entities.
pub struct ClusteringEngine {
    store: Arc<dyn EdgeStore>,
    config: ClusteringConfig,
    finder: Arc<dyn ComponentFinder>,
    snapshot: RwLock<Snapshot>,
}

impl ClusteringEngine {
    /// Create an engine using [`BreadthFirst`] traversal.
    ///
    /// # Errors
    ///
    /// Returns [`LinkageError::Configuration`] if the config is invalid.
    pub fn new(store: Arc<dyn EdgeStore>, config: ClusteringConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            finder: Arc::new(BreadthFirst),
            snapshot: RwLock::new(Snapshot::default()),
        })
    }

    /// Swap the traversal.
    pub fn with_finder(mut self, finder: Arc<dyn ComponentFinder>) -> Self {
        self.finder = finder;
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ClusteringState {
        self.snapshot.read().await.state
    }

    async fn set_state(&self, state: ClusteringState) {
        self.snapshot.write().await.state = state;
        debug!(%state, "clustering state changed");
    }

    async fn fail(&self, err: LinkageError) -> LinkageError {
        let mut snapshot = self.snapshot.write().await;
        *snapshot = Snapshot { state: ClusteringState::Failed, ..Snapshot::default() };
        error!(relation = %self.config.edge_relation, error = %err, "clustering failed");
        err
    }

    async fn fetch_edges(&self, cancel: &CancellationToken) -> Result<Vec<SimilarityEdge>> {
        let relation = self.config.edge_relation.as_str();
        let timeout = self.config.fetch_timeout;
        let fetch = self.config.retry.run("edge scan", || self.store.scan_edges(relation));
        tokio::select! {
            _ = cancel.cancelled() => Err(LinkageError::Cancelled { stage: "clustering" }),
            result = tokio::time::timeout(timeout, fetch) => match result {
                Ok(edges) => edges,
                Err(_) => Err(LinkageError::Timeout { operation: "edge scan", after: timeout }),
            },
        }
    }

    /// Partition the edge relation into clusters.
    ///
    /// The edge fetch is all-or-nothing: on timeout, cancellation or store
    /// failure the engine moves to [`ClusteringState::Failed`] and drops any
    /// previous result.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, [`LinkageError::Timeout`],
    /// [`LinkageError::Cancelled`], or the error of the cluster write.
    pub async fn cluster(
        &self,
        options: ClusterOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Cluster>> {
        ensure_active(cancel, "clustering")?;
        self.set_state(ClusteringState::FetchingEdges).await;

        let edges = match self.fetch_edges(cancel).await {
            Ok(edges) => edges,
            Err(e) => return Err(self.fail(e).await),
        };
        let fetched = edges.len();
        let kept: Vec<&SimilarityEdge> = edges
            .iter()
            .filter(|e| self.config.min_edge_score.is_none_or(|min| e.score >= min))
            .collect();
        let graph = build_adjacency(kept.iter().copied());
        self.set_state(ClusteringState::GraphBuilt).await;
        info!(edges = fetched, used = kept.len(), vertices = graph.len(), "similarity graph built");

        if let Err(e) = ensure_active(cancel, "clustering") {
            return Err(self.fail(e).await);
        }
        self.set_state(ClusteringState::Traversing).await;

        let mut dropped = 0;
        let mut clusters: Vec<Cluster> = self
            .finder
            .components(&graph)
            .into_iter()
            .filter(|c| {
                let keep = c.len() >= self.config.min_cluster_size;
                dropped += usize::from(!keep);
                keep
            })
            .filter_map(Cluster::from_members)
            .collect();
        clusters.sort_by(|a, b| a.members.first().cmp(&b.members.first()));

        if options.store_results {
            let collection = &self.config.cluster_collection;
            if let Err(e) = self
                .store
                .replace_clusters(collection, &clusters, options.truncate_existing)
                .await
            {
                return Err(self.fail(e).await);
            }
        }

        let membership = clusters
            .iter()
            .enumerate()
            .flat_map(|(i, c)| c.members.iter().map(move |m| (m.clone(), i)))
            .collect();
        let edge_list = kept.iter().map(|e| (e.from.clone(), e.to.clone())).collect();
        *self.snapshot.write().await = Snapshot {
            state: ClusteringState::Done,
            clusters: clusters.clone(),
            membership,
            edges: edge_list,
        };

        if dropped > 0 {
            debug!(
                dropped,
                min = self.config.min_cluster_size,
                "components below min_cluster_size dropped"
            );
        }
        info!(
            finder = self.finder.name(),
            clusters = clusters.len(),
            stored = options.store_results,
            "clustering finished"
        );
        Ok(clusters)
    }

    /// The cluster containing `id`, from the last successful run.
    pub async fn get_cluster_by_member(&self, id: &str) -> Option<Cluster> {
        let snapshot = self.snapshot.read().await;
        snapshot.membership.get(id).map(|&i| snapshot.clusters[i].clone())
    }

    /// Check the last run's clusters against its edges.
    ///
    /// Problems are reported, never raised.
    pub async fn validate_clusters(&self) -> ValidationReport {
        let snapshot = self.snapshot.read().await;
        let mut report = ValidationReport {
            clusters_checked: snapshot.clusters.len(),
            edges_checked: snapshot.edges.len(),
            ..ValidationReport::default()
        };

        let mut owner: HashMap<&str, usize> = HashMap::new();
        let mut overlapping = BTreeSet::new();
        for (i, cluster) in snapshot.clusters.iter().enumerate() {
            if cluster.members.len() < self.config.min_cluster_size {
                report.undersized_clusters.push(cluster.cluster_id.clone());
            }
            for member in &cluster.members {
                if owner.insert(member.as_str(), i).is_some_and(|prev| prev != i) {
                    overlapping.insert(member.clone());
                }
            }
        }
        report.overlapping_members = overlapping.into_iter().collect();

        for (from, to) in &snapshot.edges {
            let (a, b) = (owner.get(from.as_str()), owner.get(to.as_str()));
            if a != b {
                report.split_edges.push((from.clone(), to.clone()));
            }
        }

        if !report.is_valid() {
            warn!(
                overlapping = report.overlapping_members.len(),
                split_edges = report.split_edges.len(),
                undersized = report.undersized_clusters.len(),
                "cluster validation found problems"
            );
        }
        report
    }

    /// Size statistics of the last run's clusters.
    pub async fn get_statistics(&self) -> ClusterStatistics {
        let snapshot = self.snapshot.read().await;
        let sizes: Vec<usize> = snapshot.clusters.iter().map(|c| c.size).collect();
        let mut stats = ClusterStatistics {
            count: sizes.len(),
            total_members: sizes.iter().sum(),
            min_size: sizes.iter().copied().min().unwrap_or(0),
            max_size: sizes.iter().copied().max().unwrap_or(0),
            ..ClusterStatistics::default()
        };
        if stats.count > 0 {
            stats.average_size = stats.total_members as f64 / stats.count as f64;
        }
        for size in sizes {
            *stats.size_distribution.entry(size).or_default() += 1;
        }
        stats
    }
}
