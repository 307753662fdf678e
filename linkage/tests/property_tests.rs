//! Property tests for blocking, scoring, edge writing and clustering.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use linkage::clustering::build_adjacency;
use linkage::{
    BlockingMethod, BlockingStrategy, BreadthFirst, CancellationToken, CandidatePair,
    CandidateSet, ClusterOptions, ClusteringConfig, ClusteringEngine, ComponentFinder, Comparator,
    Decision, EdgeWriter, EdgeWriterConfig, ExactBlocking, ExactBlockingConfig,
    FellegiSunterScorer, FieldRule, InMemoryStore, KeyField, Record, ScoredPair, ScorerConfig,
    SimilarityEdge, UnionFind, edge_key,
};
use proptest::prelude::*;

/// Records with ids `r0..rn` and a block key drawn from a tiny alphabet so
/// that blocks collide often.
fn arb_records() -> impl Strategy<Value = Vec<Record>> {
    proptest::collection::vec(proptest::option::of("[a-c]"), 0..25).prop_map(|keys| {
        keys.into_iter()
            .enumerate()
            .map(|(i, key)| {
                let record = Record::new(format!("r{i}"));
                match key {
                    Some(key) => record.with_field("zip", key),
                    None => record,
                }
            })
            .collect()
    })
}

/// Undirected edges over a small vertex set, self-loops included.
fn arb_edge_list() -> impl Strategy<Value = Vec<(u8, u8)>> {
    proptest::collection::vec((0u8..12, 0u8..12), 0..30)
}

fn scored(a: &str, b: &str, score: f64) -> ScoredPair {
    ScoredPair {
        id_a: a.min(b).to_string(),
        id_b: a.max(b).to_string(),
        total_score: score,
        field_scores: Vec::new(),
        decision: Decision::Match,
        methods: vec![BlockingMethod::Exact],
    }
}

/// **Property 1: Blocking emits canonical, distinct, non-self pairs**
/// *For any* collection, exact blocking SHALL emit only pairs with
/// `id_a < id_b`, never the same unordered pair twice, and exactly the pairs
/// of records sharing a key.
mod prop_blocking_pairs {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn pairs_are_canonical_and_complete(records in arb_records()) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let output = rt.block_on(async {
                let store = InMemoryStore::new();
                store.create_collection("people").await;
                store.insert_records("people", records.clone()).await.unwrap();
                let config = ExactBlockingConfig::new("people", vec![KeyField::new("zip")]);
                let strategy = ExactBlocking::new(config).unwrap();
                strategy.generate_candidates(&store, &CancellationToken::new()).await.unwrap()
            });

            let mut seen = BTreeSet::new();
            for pair in &output.pairs {
                prop_assert!(pair.id_a() < pair.id_b());
                prop_assert!(seen.insert((pair.id_a().to_string(), pair.id_b().to_string())));
            }

            let zip: HashMap<&str, String> = records
                .iter()
                .filter_map(|r| r.text("zip").map(|z| (r.id.as_str(), z.into_owned())))
                .collect();
            let mut expected = 0;
            for (i, a) in records.iter().enumerate() {
                for b in &records[i + 1..] {
                    if let (Some(x), Some(y)) = (zip.get(a.id.as_str()), zip.get(b.id.as_str())) {
                        if x == y {
                            expected += 1;
                        }
                    }
                }
            }
            prop_assert_eq!(output.pairs.len(), expected);
        }
    }
}

/// **Property 2: Merging candidates is idempotent and order-insensitive**
/// *For any* list of proposals, collecting it into a [`CandidateSet`] in
/// either order, or twice over, SHALL yield the same pairs.
mod prop_candidate_merge {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn merge_is_idempotent(edges in arb_edge_list()) {
            let proposals: Vec<CandidatePair> = edges
                .iter()
                .filter_map(|(a, b)| {
                    CandidatePair::new(format!("n{a}"), format!("n{b}"), BlockingMethod::Fuzzy)
                })
                .collect();

            let once: CandidateSet = proposals.iter().cloned().collect();
            let reversed: CandidateSet = proposals.iter().rev().cloned().collect();
            let twice: CandidateSet = proposals.iter().chain(proposals.iter()).cloned().collect();

            let keys = |set: &CandidateSet| {
                set.iter()
                    .map(|p| (p.id_a().to_string(), p.id_b().to_string()))
                    .collect::<Vec<_>>()
            };
            prop_assert_eq!(keys(&once), keys(&reversed));
            prop_assert_eq!(keys(&once), keys(&twice));
            prop_assert!(once.iter().all(|p| p.methods() == [BlockingMethod::Fuzzy]));
        }
    }
}

/// **Property 3: Edge keys ignore orientation**
mod prop_edge_key {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn key_is_symmetric(a in "[a-z0-9-]{1,12}", b in "[a-z0-9-]{1,12}") {
            prop_assert_eq!(edge_key(&a, &b), edge_key(&b, &a));
        }
    }
}

/// **Property 4: Edge writes are idempotent**
/// *For any* batch of scored pairs, writing it a second time SHALL create no
/// edge and leave the edge count unchanged.
mod prop_edge_write_idempotence {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn second_write_creates_nothing(edges in arb_edge_list(), batch_size in 1usize..8) {
            let pairs: Vec<ScoredPair> = edges
                .iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| scored(&format!("n{a}"), &format!("n{b}"), 3.0))
                .collect();

            let rt = tokio::runtime::Runtime::new().unwrap();
            let (first, second, stored) = rt.block_on(async {
                let store = Arc::new(InMemoryStore::new());
                let config = EdgeWriterConfig { batch_size, ..Default::default() };
                let writer = EdgeWriter::new(store.clone(), config).unwrap();
                let first = writer.create_edges(&pairs, None).await.unwrap();
                let second = writer.create_edges(&pairs, None).await.unwrap();
                let stored = writer.statistics().await.unwrap().total;
                (first, second, stored)
            });

            let distinct: BTreeSet<String> =
                pairs.iter().map(|p| edge_key(&p.id_a, &p.id_b)).collect();
            prop_assert_eq!(first.created, distinct.len());
            prop_assert_eq!(second.created, 0);
            prop_assert_eq!(second.ignored, pairs.len());
            prop_assert_eq!(stored, distinct.len());
        }
    }
}

/// **Property 5: Importance moves the score in the direction of agreement**
/// *For any* exact-comparator rules with `m > u` and normalization off,
/// raising one field's importance SHALL raise the total if that field agrees
/// and lower it if it disagrees. A pair agreeing on a superset of fields
/// SHALL never score lower. With normalization on, the total is a weighted
/// mean of the field weights, so raising one field's importance SHALL move
/// the total toward that field's weight.
mod prop_score_monotonicity {
    use super::*;

    const FIELDS: usize = 4;

    fn arb_rules() -> impl Strategy<Value = Vec<(f64, f64, f64)>> {
        proptest::collection::vec((0.5f64..0.99, 0.01f64..0.49, 0.1f64..3.0), FIELDS)
    }

    fn pair_with(agree: &[bool]) -> (Record, Record) {
        let mut a = Record::new("a");
        let mut b = Record::new("b");
        for (i, agrees) in agree.iter().enumerate() {
            let field = format!("f{i}");
            a = a.with_field(field.clone(), "same");
            b = b.with_field(field, if *agrees { "same" } else { "other" });
        }
        (a, b)
    }

    fn rules_of(rules: &[(f64, f64, f64)]) -> Vec<FieldRule> {
        rules
            .iter()
            .enumerate()
            .map(|(i, (m, u, importance))| {
                FieldRule::new(format!("f{i}"), Comparator::Exact, *m, *u)
                    .with_importance(*importance)
            })
            .collect()
    }

    fn scorer_for(rules: &[(f64, f64, f64)], normalize: bool) -> FellegiSunterScorer {
        let config = ScorerConfig::builder()
            .rules(rules_of(rules))
            .normalize_importance(normalize)
            .build()
            .unwrap();
        FellegiSunterScorer::new(config).unwrap()
    }

    fn total(rules: &[(f64, f64, f64)], normalize: bool, agree: &[bool]) -> f64 {
        let (a, b) = pair_with(agree);
        scorer_for(rules, normalize).score_records(&a, &b).unwrap().total_score
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn importance_follows_agreement(
            rules in arb_rules(),
            agree in proptest::collection::vec(any::<bool>(), FIELDS),
            field in 0..FIELDS,
            bump in 0.1f64..2.0,
        ) {
            let mut heavier = rules.clone();
            heavier[field].2 += bump;
            let before = total(&rules, false, &agree);
            let after = total(&heavier, false, &agree);
            if agree[field] {
                prop_assert!(after > before, "{after} <= {before}");
            } else {
                prop_assert!(after < before, "{after} >= {before}");
            }
        }

        #[test]
        fn normalized_importance_pulls_toward_field_weight(
            rules in arb_rules(),
            agree in proptest::collection::vec(any::<bool>(), FIELDS),
            field in 0..FIELDS,
            bump in 0.1f64..2.0,
        ) {
            let mut heavier = rules.clone();
            heavier[field].2 += bump;
            let before = total(&rules, true, &agree);
            let after = total(&heavier, true, &agree);

            let rule = &rules_of(&rules)[field];
            let weight = if agree[field] {
                rule.agreement_weight()
            } else {
                rule.disagreement_weight()
            };
            if weight > before + 1e-9 {
                prop_assert!(
                    after > before && after <= weight + 1e-9,
                    "{before} -> {after}, w = {weight}"
                );
            } else if weight < before - 1e-9 {
                prop_assert!(
                    after < before && after >= weight - 1e-9,
                    "{before} -> {after}, w = {weight}"
                );
            }
        }

        #[test]
        fn superset_agreement_scores_higher(
            rules in arb_rules(),
            base in proptest::collection::vec(any::<bool>(), FIELDS),
            extra in proptest::collection::vec(any::<bool>(), FIELDS),
            normalize in any::<bool>(),
        ) {
            let wider: Vec<bool> = base.iter().zip(&extra).map(|(x, y)| *x || *y).collect();
            let low = total(&rules, normalize, &base);
            let high = total(&rules, normalize, &wider);
            prop_assert!(high >= low - 1e-12, "{high} < {low}");
        }
    }
}

/// **Property 6: Clusters are a partition consistent with the edges**
/// *For any* edge set, the resulting clusters SHALL be pairwise disjoint,
/// hold at least two members, place both endpoints of every non-loop edge
/// in the same cluster, and be the same for every component finder.
mod prop_cluster_partition {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn clusters_partition_the_graph(edges in arb_edge_list()) {
            let pairs: Vec<ScoredPair> = edges
                .iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| scored(&format!("n{a:02}"), &format!("n{b:02}"), 3.0))
                .collect();

            let rt = tokio::runtime::Runtime::new().unwrap();
            let (clusters, validation) = rt.block_on(async {
                let store = Arc::new(InMemoryStore::new());
                let writer = EdgeWriter::new(store.clone(), EdgeWriterConfig::default()).unwrap();
                writer.create_edges(&pairs, None).await.unwrap();
                let engine =
                    ClusteringEngine::new(store.clone(), ClusteringConfig::default()).unwrap();
                let clusters = engine
                    .cluster(ClusterOptions::default(), &CancellationToken::new())
                    .await
                    .unwrap();
                (clusters, engine.validate_clusters().await)
            });

            prop_assert!(validation.is_valid());
            let mut owner: HashMap<&str, &str> = HashMap::new();
            for cluster in &clusters {
                prop_assert!(cluster.size >= 2);
                prop_assert_eq!(cluster.size, cluster.members.len());
                for member in &cluster.members {
                    let previous = owner.insert(member.as_str(), cluster.cluster_id.as_str());
                    prop_assert!(previous.is_none());
                }
            }
            for pair in &pairs {
                prop_assert_eq!(owner.get(pair.id_a.as_str()), owner.get(pair.id_b.as_str()));
                prop_assert!(owner.contains_key(pair.id_a.as_str()));
            }

            let now = Utc::now();
            let raw: Vec<SimilarityEdge> = edges
                .iter()
                .map(|(a, b)| SimilarityEdge {
                    key: edge_key(&a.to_string(), &b.to_string()),
                    from: a.to_string(),
                    to: b.to_string(),
                    score: 1.0,
                    method: "exact".to_string(),
                    metadata: Default::default(),
                    created_at: now,
                })
                .collect();
            let graph = build_adjacency(&raw);
            let mut bfs = BreadthFirst.components(&graph);
            let mut uf = UnionFind.components(&graph);
            bfs.sort();
            uf.sort();
            prop_assert_eq!(bfs, uf);
        }
    }
}
