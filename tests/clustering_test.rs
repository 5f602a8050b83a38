mod common;

use std::collections::BTreeSet;

use cluster_batcher::cache::{ArtifactCache, CachePolicy};
use cluster_batcher::clustering::{
    ClusterSettings, ClusteringError, ClusteringStatistics, MultilevelPartitioner, Partitioner,
    WeightedGraph, cluster_graph,
};
use rstest::rstest;

use common::{graph_from, ring_of_cliques};

fn settings(num_clusters: usize, seed: u64) -> ClusterSettings {
    ClusterSettings {
        label: "ring-training".to_string(),
        num_clusters,
        seed,
        policy: CachePolicy::ephemeral(),
    }
}

fn scratch_cache() -> (tempfile::TempDir, ArtifactCache) {
    let dir = tempfile::tempdir().expect("temp dir");
    let cache = ArtifactCache::new(dir.path().join("cache"));
    (dir, cache)
}

#[rstest]
#[case(2)]
#[case(3)]
#[case(8)]
#[case(17)]
#[case(48)]
fn clusters_cover_every_node_exactly_once(#[case] num_clusters: usize) {
    let graph = graph_from(ring_of_cliques(8, 6));
    let visible: Vec<usize> = (0..graph.num_nodes()).collect();
    let (_dir, cache) = scratch_cache();
    let partitioner = MultilevelPartitioner::default();

    let clustering = cluster_graph(&graph, &visible, &settings(num_clusters, 7), &partitioner, &cache)
        .expect("clustering succeeds");

    assert_eq!(clustering.num_clusters(), num_clusters);
    let mut seen = BTreeSet::new();
    for cluster in clustering.clusters() {
        assert!(!cluster.is_empty());
        for &node in cluster {
            assert!(seen.insert(node), "node {node} appears twice");
        }
    }
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), visible);
}

#[test]
fn one_cluster_holds_the_whole_graph() {
    let graph = graph_from(ring_of_cliques(4, 5));
    let visible: Vec<usize> = (0..graph.num_nodes()).collect();
    let (_dir, cache) = scratch_cache();

    let clustering = cluster_graph(
        &graph,
        &visible,
        &settings(1, 0),
        &MultilevelPartitioner::default(),
        &cache,
    )
    .expect("clustering succeeds");

    assert_eq!(clustering.num_clusters(), 1);
    assert_eq!(clustering.cluster(0), visible.as_slice());
}

#[test]
fn cliques_are_recovered_as_clusters() {
    let graph = graph_from(ring_of_cliques(8, 6));
    let visible: Vec<usize> = (0..graph.num_nodes()).collect();
    let (_dir, cache) = scratch_cache();

    let clustering = cluster_graph(
        &graph,
        &visible,
        &settings(8, 3),
        &MultilevelPartitioner::default(),
        &cache,
    )
    .expect("clustering succeeds");
    let statistics = ClusteringStatistics::compute(&graph, &clustering, 1);

    // 8 * 15 clique edges and 8 ring edges
    assert_eq!(statistics.total_edges, 128);
    assert!(statistics.intra_cluster_ratio() > 0.8);
    assert!(statistics.max_cluster_size <= 8);
}

#[test]
fn large_graphs_are_coarsened_and_stay_balanced() {
    // 2000 vertices, well above the coarsening threshold
    let graph = graph_from(ring_of_cliques(200, 10));
    let visible: Vec<usize> = (0..graph.num_nodes()).collect();
    let (_dir, cache) = scratch_cache();
    let partitioner = MultilevelPartitioner::new(0.05);

    let clustering = cluster_graph(&graph, &visible, &settings(16, 5), &partitioner, &cache)
        .expect("clustering succeeds");

    assert_eq!(clustering.num_clusters(), 16);
    clustering.validate_cover(&visible).expect("every node once");
    // target 125 per part, 5% either way
    for cluster in clustering.clusters() {
        assert!((119..=131).contains(&cluster.len()), "size {}", cluster.len());
    }

    let weighted = WeightedGraph::from_adjacency(graph.adjacency());
    let parts = partitioner.partition(&weighted, 16, 5);
    // a ring cut into 16 arcs costs 16 edges when no clique is split
    assert!(weighted.edge_cut(&parts) <= 32, "cut {}", weighted.edge_cut(&parts));
}

#[test]
fn same_seed_gives_the_same_clustering() {
    let graph = graph_from(ring_of_cliques(10, 5));
    let visible: Vec<usize> = (0..graph.num_nodes()).collect();
    let partitioner = MultilevelPartitioner::default();

    let (_first_dir, first_cache) = scratch_cache();
    let (_second_dir, second_cache) = scratch_cache();
    let first = cluster_graph(&graph, &visible, &settings(6, 42), &partitioner, &first_cache)
        .expect("clustering succeeds");
    let second = cluster_graph(&graph, &visible, &settings(6, 42), &partitioner, &second_cache)
        .expect("clustering succeeds");

    assert_eq!(first, second);
}

#[test]
fn visible_subset_is_clustered_alone() {
    let graph = graph_from(ring_of_cliques(6, 4));
    let visible = graph.splits().train.clone();
    let (_dir, cache) = scratch_cache();

    let clustering = cluster_graph(
        &graph,
        &visible,
        &settings(4, 1),
        &MultilevelPartitioner::default(),
        &cache,
    )
    .expect("clustering succeeds");

    assert_eq!(clustering.num_nodes(), visible.len());
    assert!(clustering.validate_cover(&visible).is_ok());
}

#[rstest]
#[case(0, ClusteringError::ZeroClusters)]
#[case(21, ClusteringError::TooManyClusters { num_clusters: 21, num_nodes: 20 })]
fn rejects_impossible_cluster_counts(#[case] num_clusters: usize, #[case] expected: ClusteringError) {
    let graph = graph_from(ring_of_cliques(4, 5));
    let visible: Vec<usize> = (0..graph.num_nodes()).collect();
    let (_dir, cache) = scratch_cache();

    let error = cluster_graph(
        &graph,
        &visible,
        &settings(num_clusters, 0),
        &MultilevelPartitioner::default(),
        &cache,
    )
    .expect_err("cluster count is impossible");

    assert_eq!(error, expected);
}

/// A partitioner that leaves the last part empty.
struct Lopsided;

impl Partitioner for Lopsided {
    fn partition(&self, graph: &WeightedGraph, _num_parts: usize, _seed: u64) -> Vec<usize> {
        vec![0; graph.num_vertices()]
    }

    fn describe(&self) -> String {
        "lopsided".to_string()
    }
}

#[test]
fn empty_cluster_is_fatal() {
    let graph = graph_from(ring_of_cliques(2, 3));
    let visible: Vec<usize> = (0..graph.num_nodes()).collect();
    let (_dir, cache) = scratch_cache();

    let error = cluster_graph(&graph, &visible, &settings(2, 0), &Lopsided, &cache)
        .expect_err("part 1 is empty");

    assert_eq!(error, ClusteringError::EmptyCluster { cluster: 1 });
}

#[test]
fn clustering_is_cached_on_disk() {
    let graph = graph_from(ring_of_cliques(4, 4));
    let visible: Vec<usize> = (0..graph.num_nodes()).collect();
    let dir = tempfile::tempdir().expect("temp dir");
    let persisted = ClusterSettings {
        policy: CachePolicy::default(),
        ..settings(4, 9)
    };

    let first = cluster_graph(
        &graph,
        &visible,
        &persisted,
        &MultilevelPartitioner::default(),
        &ArtifactCache::new(dir.path()),
    )
    .expect("clustering succeeds");
    let second = cluster_graph(
        &graph,
        &visible,
        &persisted,
        &Lopsided,
        &ArtifactCache::new(dir.path()),
    );

    assert!(second.is_err(), "partitioner is part of the cache key");
    let third = cluster_graph(
        &graph,
        &visible,
        &persisted,
        &MultilevelPartitioner::default(),
        &ArtifactCache::new(dir.path()),
    )
    .expect("cached clustering loads");
    assert_eq!(first, third);
}
