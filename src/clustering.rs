//! Partitioning of a split's visible nodes into Cluster-GCN clusters.

pub mod multilevel;
pub mod statistics;

use std::sync::Arc;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cache::{ArtifactCache, CacheKey, CachePolicy};
use crate::graph::Graph;
use crate::util::hash_nodes;

pub use multilevel::{MultilevelPartitioner, WeightedGraph};
pub use statistics::ClusteringStatistics;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusteringError {
    #[error("num_clusters must be greater than zero")]
    ZeroClusters,
    #[error("num_clusters ({num_clusters}) exceeds the {num_nodes} nodes available for clustering")]
    TooManyClusters { num_clusters: usize, num_nodes: usize },
    #[error("cluster {cluster} is empty")]
    EmptyCluster { cluster: usize },
    #[error("node {node} is assigned to more than one cluster")]
    DuplicateNode { node: usize },
    #[error("node {node} is not covered by any cluster")]
    UncoveredNode { node: usize },
    #[error("assignment has {found} entries for {expected} nodes")]
    AssignmentLength { expected: usize, found: usize },
    #[error("part id {part} is outside 0..{num_clusters}")]
    PartOutOfRange { part: usize, num_clusters: usize },
}

/// A partition of node ids into disjoint, non-empty clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clustering {
    clusters: Vec<Vec<usize>>,
}

impl Clustering {
    /// # Errors
    /// Returns [`ClusteringError::EmptyCluster`] or [`ClusteringError::DuplicateNode`].
    pub fn from_clusters(mut clusters: Vec<Vec<usize>>) -> Result<Self, ClusteringError> {
        let mut seen = FxHashSet::default();
        for (cluster, nodes) in clusters.iter_mut().enumerate() {
            if nodes.is_empty() {
                return Err(ClusteringError::EmptyCluster { cluster });
            }
            nodes.sort_unstable();
            for &node in nodes.iter() {
                if !seen.insert(node) {
                    return Err(ClusteringError::DuplicateNode { node });
                }
            }
        }
        Ok(Self { clusters })
    }

    /// Builds clusters from a per-node part id; `nodes[i]` belongs to `parts[i]`.
    ///
    /// # Errors
    /// Fails when the lengths differ, a part id is out of range, or a part ends up empty.
    pub fn from_assignment(
        nodes: &[usize],
        parts: &[usize],
        num_clusters: usize,
    ) -> Result<Self, ClusteringError> {
        if nodes.len() != parts.len() {
            return Err(ClusteringError::AssignmentLength {
                expected: nodes.len(),
                found: parts.len(),
            });
        }
        let mut clusters = vec![Vec::new(); num_clusters];
        for (&node, &part) in nodes.iter().zip(parts) {
            let cluster = clusters
                .get_mut(part)
                .ok_or(ClusteringError::PartOutOfRange { part, num_clusters })?;
            cluster.push(node);
        }
        Self::from_clusters(clusters)
    }

    #[must_use]
    pub fn num_clusters(&self) -> usize {
        self.clusters.len()
    }

    #[must_use]
    pub fn clusters(&self) -> &[Vec<usize>] {
        &self.clusters
    }

    #[must_use]
    pub fn cluster(&self, index: usize) -> &[usize] {
        &self.clusters[index]
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.clusters.iter().map(Vec::len).sum()
    }

    /// Node id to cluster index.
    #[must_use]
    pub fn assignment(&self) -> FxHashMap<usize, usize> {
        self.clusters
            .iter()
            .enumerate()
            .flat_map(|(cluster, nodes)| nodes.iter().map(move |&node| (node, cluster)))
            .collect()
    }

    /// Checks that the clusters cover exactly `nodes`.
    ///
    /// # Errors
    /// Returns [`ClusteringError::UncoveredNode`] for a node missing from every
    /// cluster, or [`ClusteringError::AssignmentLength`] when extra nodes are present.
    pub fn validate_cover(&self, nodes: &[usize]) -> Result<(), ClusteringError> {
        let assignment = self.assignment();
        if let Some(&node) = nodes.iter().find(|node| !assignment.contains_key(node)) {
            return Err(ClusteringError::UncoveredNode { node });
        }
        let expected: FxHashSet<usize> = nodes.iter().copied().collect();
        if assignment.len() != expected.len() {
            return Err(ClusteringError::AssignmentLength {
                expected: expected.len(),
                found: assignment.len(),
            });
        }
        Ok(())
    }
}

/// A graph partitioning heuristic.
pub trait Partitioner: Send + Sync {
    /// Assigns every vertex of `graph` to a part in `0..num_parts`.
    ///
    /// When `num_parts <= graph.num_vertices()` every part must receive at least one vertex.
    fn partition(&self, graph: &WeightedGraph, num_parts: usize, seed: u64) -> Vec<usize>;

    /// Stable description of the heuristic and its tuning, used in cache keys.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    /// Dataset name plus split suffix, e.g. `arxiv-training`.
    pub label: String,
    pub num_clusters: usize,
    pub seed: u64,
    pub policy: CachePolicy,
}

/// Clusters the subgraph induced by `visible`, going through the clustering cache.
///
/// # Errors
/// Fails fast when `num_clusters` is zero or exceeds the number of visible
/// nodes, and when the resulting partition leaves a cluster empty.
pub fn cluster_graph(
    graph: &Graph,
    visible: &[usize],
    settings: &ClusterSettings,
    partitioner: &dyn Partitioner,
    cache: &ArtifactCache,
) -> Result<Arc<Clustering>, ClusteringError> {
    let num_clusters = settings.num_clusters;
    if num_clusters == 0 {
        return Err(ClusteringError::ZeroClusters);
    }
    if num_clusters > visible.len() {
        return Err(ClusteringError::TooManyClusters {
            num_clusters,
            num_nodes: visible.len(),
        });
    }

    let key = CacheKey::new("clustering", &settings.label)
        .param("num_clusters", num_clusters)
        .param("seed", settings.seed)
        .param("partitioner", partitioner.describe())
        .param("visible", format!("{:016x}", hash_nodes(visible)))
        .param("nodes", graph.num_nodes())
        .param("edges", graph.num_edges());

    let started = Instant::now();
    let clustering = cache.get_or_compute(&key, settings.policy, || {
        info!(
            label = %settings.label,
            num_clusters,
            visible_nodes = visible.len(),
            "clustering graph"
        );
        if num_clusters == 1 {
            return Clustering::from_clusters(vec![visible.to_vec()]);
        }
        let weighted = WeightedGraph::from_adjacency(&graph.induced_subgraph(visible));
        let parts = partitioner.partition(&weighted, num_clusters, settings.seed);
        Clustering::from_assignment(visible, &parts, num_clusters)
    })?;
    clustering.validate_cover(visible)?;

    info!(
        label = %settings.label,
        num_clusters = clustering.num_clusters(),
        elapsed_ms = started.elapsed().as_millis(),
        "clustering ready"
    );
    Ok(clustering)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_assignment_groups_and_sorts_nodes() {
        let clustering = Clustering::from_assignment(&[10, 4, 7, 2], &[1, 0, 1, 0], 2)
            .expect("assignment is valid");
        assert_eq!(clustering.clusters(), &[vec![2, 4], vec![7, 10]]);
        assert_eq!(clustering.num_nodes(), 4);
        assert_eq!(clustering.assignment()[&7], 1);
    }

    #[test]
    fn from_assignment_rejects_empty_cluster() {
        let error = Clustering::from_assignment(&[0, 1], &[0, 0], 2).expect_err("part 1 is empty");
        assert_eq!(error, ClusteringError::EmptyCluster { cluster: 1 });
    }

    #[test]
    fn from_assignment_rejects_out_of_range_part() {
        let error = Clustering::from_assignment(&[0, 1], &[0, 3], 2).expect_err("part 3 is invalid");
        assert_eq!(
            error,
            ClusteringError::PartOutOfRange {
                part: 3,
                num_clusters: 2
            }
        );
    }

    #[test]
    fn from_clusters_rejects_overlap() {
        let error = Clustering::from_clusters(vec![vec![0, 1], vec![1, 2]]).expect_err("overlap");
        assert_eq!(error, ClusteringError::DuplicateNode { node: 1 });
    }

    #[test]
    fn validate_cover_detects_missing_and_extra_nodes() {
        let clustering = Clustering::from_clusters(vec![vec![0, 1], vec![2]]).expect("valid");
        assert!(clustering.validate_cover(&[0, 1, 2]).is_ok());
        assert_eq!(
            clustering.validate_cover(&[0, 1, 2, 3]),
            Err(ClusteringError::UncoveredNode { node: 3 })
        );
        assert!(matches!(
            clustering.validate_cover(&[0, 1]),
            Err(ClusteringError::AssignmentLength { .. })
        ));
    }
}
