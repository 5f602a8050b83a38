//! Static batch shapes.
//!
//! Batches can be padded to a fixed node and edge count so that every step has
//! the same shape. The maxima are estimated from the clustering with one of
//! three methods; batches that still exceed them are pruned.

use serde::{Deserialize, Serialize};

use crate::clustering::Clustering;
use crate::clustering::statistics::mean_std;
use crate::graph::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxSizeMethod {
    /// `clusters_per_batch` times the mean cluster size.
    Average,
    /// `clusters_per_batch` times (mean + one standard deviation).
    AveragePlusStd,
    /// Sum of the `clusters_per_batch` largest clusters; never prunes.
    #[default]
    UpperBound,
}

impl MaxSizeMethod {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn estimate(self, mut sizes: Vec<usize>, clusters_per_batch: usize) -> usize {
        match self {
            Self::Average => {
                let (mean, _) = mean_std(&sizes);
                (mean * clusters_per_batch as f64).ceil() as usize
            }
            Self::AveragePlusStd => {
                let (mean, std) = mean_std(&sizes);
                ((mean + std) * clusters_per_batch as f64).ceil() as usize
            }
            Self::UpperBound => {
                sizes.sort_unstable_by(|a, b| b.cmp(a));
                sizes.iter().take(clusters_per_batch).sum()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_nodes: usize,
    /// Non-zero entries of the normalized block (each undirected edge counts
    /// twice, self-connections once).
    pub max_edges: usize,
}

impl BatchLimits {
    #[must_use]
    pub fn new(max_nodes: usize, max_edges: usize) -> Self {
        Self {
            max_nodes,
            max_edges,
        }
    }

    /// Estimates per-batch maxima from cluster sizes and the adjacency entries incident to each cluster.
    #[must_use]
    pub fn estimate(
        graph: &Graph,
        clustering: &Clustering,
        clusters_per_batch: usize,
        node_method: MaxSizeMethod,
        edge_method: MaxSizeMethod,
    ) -> Self {
        let node_sizes: Vec<usize> = clustering.clusters().iter().map(Vec::len).collect();
        let edge_sizes: Vec<usize> = clustering
            .clusters()
            .iter()
            .map(|nodes| nodes.iter().map(|&node| graph.degree(node)).sum())
            .collect();
        Self {
            max_nodes: node_method.estimate(node_sizes, clusters_per_batch).max(1),
            max_edges: edge_method.estimate(edge_sizes, clusters_per_batch),
        }
    }

    /// Room for the diagonal entry a self-connecting transform adds to every real row.
    #[must_use]
    pub fn with_self_connections(self) -> Self {
        Self {
            max_edges: self.max_edges + self.max_nodes,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphType, Splits};
    use ndarray::Array2;
    use rstest::rstest;

    fn star() -> Graph {
        Graph::from_parts(
            5,
            GraphType::Undirected,
            &[(0, 1), (0, 2), (0, 3), (0, 4)],
            Array2::zeros((5, 1)),
            vec![0; 5],
            Splits::default(),
        )
        .expect("graph should build")
    }

    #[rstest]
    #[case(MaxSizeMethod::Average, 4)]
    #[case(MaxSizeMethod::AveragePlusStd, 6)]
    #[case(MaxSizeMethod::UpperBound, 4)]
    fn node_limits_follow_method(#[case] method: MaxSizeMethod, #[case] expected: usize) {
        // sizes 3, 1, 1: mean 5/3, std ~0.943
        let clustering =
            Clustering::from_clusters(vec![vec![0, 1, 2], vec![3], vec![4]]).expect("valid");
        let limits = BatchLimits::estimate(&star(), &clustering, 2, method, method);
        assert_eq!(limits.max_nodes, expected);
    }

    #[test]
    fn upper_bound_edges_use_incident_entries() {
        let clustering =
            Clustering::from_clusters(vec![vec![0, 1, 2], vec![3], vec![4]]).expect("valid");
        let limits = BatchLimits::estimate(
            &star(),
            &clustering,
            1,
            MaxSizeMethod::UpperBound,
            MaxSizeMethod::UpperBound,
        );
        // node 0 has degree 4, nodes 1 and 2 degree 1
        assert_eq!(limits.max_edges, 6);
    }

    #[test]
    fn self_connections_reserve_one_entry_per_node() {
        let limits = BatchLimits::new(4, 6).with_self_connections();
        assert_eq!(limits, BatchLimits::new(4, 10));
    }

    #[test]
    fn method_parses_from_config_names() {
        let method: MaxSizeMethod =
            serde_json::from_str("\"average_plus_std\"").expect("method should parse");
        assert_eq!(method, MaxSizeMethod::AveragePlusStd);
    }
}
