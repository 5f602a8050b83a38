use serde::Serialize;
use tracing::info;

use super::Clustering;
use crate::graph::Graph;

/// Size distribution of a clustering and how many edges survive batching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusteringStatistics {
    pub num_clusters: usize,
    pub clusters_per_batch: usize,
    pub num_nodes: usize,
    pub min_cluster_size: usize,
    pub max_cluster_size: usize,
    pub mean_cluster_size: f64,
    pub std_cluster_size: f64,
    /// Undirected edges with both endpoints among the clustered nodes.
    pub total_edges: usize,
    pub intra_cluster_edges: usize,
    pub inter_cluster_edges: usize,
}

impl ClusteringStatistics {
    #[must_use]
    pub fn compute(graph: &Graph, clustering: &Clustering, clusters_per_batch: usize) -> Self {
        let sizes: Vec<usize> = clustering.clusters().iter().map(Vec::len).collect();
        let (mean, std) = mean_std(&sizes);

        let assignment = clustering.assignment();
        let (mut intra, mut inter) = (0, 0);
        for (&node, &cluster) in &assignment {
            for (neighbor, _) in graph.neighbors(node) {
                if node >= neighbor {
                    continue;
                }
                match assignment.get(&neighbor) {
                    Some(&other) if other == cluster => intra += 1,
                    Some(_) => inter += 1,
                    None => {}
                }
            }
        }

        Self {
            num_clusters: clustering.num_clusters(),
            clusters_per_batch,
            num_nodes: clustering.num_nodes(),
            min_cluster_size: sizes.iter().copied().min().unwrap_or(0),
            max_cluster_size: sizes.iter().copied().max().unwrap_or(0),
            mean_cluster_size: mean,
            std_cluster_size: std,
            total_edges: intra + inter,
            intra_cluster_edges: intra,
            inter_cluster_edges: inter,
        }
    }

    #[must_use]
    pub fn intra_cluster_ratio(&self) -> f64 {
        ratio(self.intra_cluster_edges as f64, self.total_edges)
    }

    /// Expected fraction of edges present in some batch over one epoch.
    ///
    /// Intra-cluster edges are always kept; an inter-cluster edge is kept when
    /// the other endpoint's cluster lands in the same batch, which happens with
    /// probability `(c - 1) / (k - 1)`.
    #[must_use]
    pub fn expected_retained_edge_ratio(&self) -> f64 {
        let together = if self.num_clusters > 1 {
            (self.clusters_per_batch.saturating_sub(1)) as f64 / (self.num_clusters - 1) as f64
        } else {
            1.0
        };
        ratio(
            self.intra_cluster_edges as f64 + self.inter_cluster_edges as f64 * together,
            self.total_edges,
        )
    }

    pub fn log(&self, label: &str) {
        info!(
            label,
            num_clusters = self.num_clusters,
            clusters_per_batch = self.clusters_per_batch,
            nodes = self.num_nodes,
            min_size = self.min_cluster_size,
            max_size = self.max_cluster_size,
            mean_size = self.mean_cluster_size,
            std_size = self.std_cluster_size,
            intra_edges = self.intra_cluster_edges,
            inter_edges = self.inter_cluster_edges,
            intra_ratio = self.intra_cluster_ratio(),
            retained_ratio = self.expected_retained_edge_ratio(),
            "clustering statistics"
        );
    }
}

fn ratio(numerator: f64, total: usize) -> f64 {
    if total == 0 { 1.0 } else { numerator / total as f64 }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn mean_std(values: &[usize]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let count = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / count;
    let variance = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / count;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphType, Splits};
    use ndarray::Array2;

    fn square() -> Graph {
        Graph::from_parts(
            4,
            GraphType::Undirected,
            &[(0, 1), (1, 2), (2, 3), (3, 0)],
            Array2::zeros((4, 1)),
            vec![0; 4],
            Splits::default(),
        )
        .expect("graph should build")
    }

    #[test]
    fn counts_intra_and_inter_edges() {
        let clustering = Clustering::from_clusters(vec![vec![0, 1], vec![2, 3]]).expect("valid");
        let stats = ClusteringStatistics::compute(&square(), &clustering, 1);
        assert_eq!(stats.intra_cluster_edges, 2);
        assert_eq!(stats.inter_cluster_edges, 2);
        assert!((stats.intra_cluster_ratio() - 0.5).abs() < 1e-9);
        assert!((stats.expected_retained_edge_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn full_batch_retains_every_edge() {
        let clustering = Clustering::from_clusters(vec![vec![0, 1], vec![2, 3]]).expect("valid");
        let stats = ClusteringStatistics::compute(&square(), &clustering, 2);
        assert!((stats.expected_retained_edge_ratio() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ignores_edges_leaving_the_clustered_nodes() {
        let clustering = Clustering::from_clusters(vec![vec![0], vec![1]]).expect("valid");
        let stats = ClusteringStatistics::compute(&square(), &clustering, 1);
        assert_eq!(stats.total_edges, 1);
        assert_eq!(stats.min_cluster_size, 1);
        assert!(stats.std_cluster_size.abs() < 1e-9);
    }
}
