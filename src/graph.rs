//! In-memory graph: symmetric CSR adjacency, node features, labels and split membership.

pub mod loader;

use std::fmt;

use ndarray::Array2;
use petgraph::graph::{NodeIndex, UnGraph};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use thiserror::Error;

pub use loader::{DatasetRecord, ProcessedDataset, SplitRecord, load_dataset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphType {
    #[default]
    Undirected,
    Directed,
}

/// Which part of the dataset a set of batches is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitKind {
    Training,
    Validation,
    Test,
}

impl SplitKind {
    pub const ALL: [Self; 3] = [Self::Training, Self::Validation, Self::Test];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for SplitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splits {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph has no nodes")]
    Empty,
    #[error("edge ({source_node}, {target_node}) references a node outside 0..{num_nodes}")]
    EdgeOutOfRange {
        source_node: usize,
        target_node: usize,
        num_nodes: usize,
    },
    #[error("expected {expected} feature rows, found {found}")]
    FeatureRows { expected: usize, found: usize },
    #[error("feature row {row} has width {found}, expected {expected}")]
    FeatureWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("feature matrix shape is inconsistent: {0}")]
    FeatureShape(#[from] ndarray::ShapeError),
    #[error("expected {expected} labels, found {found}")]
    LabelCount { expected: usize, found: usize },
    #[error("{split} split references node {node} outside 0..{num_nodes}")]
    SplitOutOfRange {
        split: &'static str,
        node: usize,
        num_nodes: usize,
    },
}

/// A homogeneous graph dataset held in memory.
///
/// The adjacency is stored symmetrized, without self-loops, with unit weights,
/// regardless of whether the source file listed directed arcs.
#[derive(Debug, Clone)]
pub struct Graph {
    graph_type: GraphType,
    adjacency: CsMat<f32>,
    row_offsets: Vec<usize>,
    features: Array2<f32>,
    labels: Vec<u32>,
    num_labels: usize,
    splits: Splits,
}

impl Graph {
    /// Builds a graph from an undirected edge list (each pair once or twice, any order).
    ///
    /// # Errors
    /// Returns [`GraphError`] when an edge, split entry, feature matrix or label
    /// vector does not match `num_nodes`.
    pub fn from_parts(
        num_nodes: usize,
        graph_type: GraphType,
        edges: &[(usize, usize)],
        features: Array2<f32>,
        labels: Vec<u32>,
        splits: Splits,
    ) -> Result<Self, GraphError> {
        if num_nodes == 0 {
            return Err(GraphError::Empty);
        }
        if features.nrows() != num_nodes {
            return Err(GraphError::FeatureRows {
                expected: num_nodes,
                found: features.nrows(),
            });
        }
        if labels.len() != num_nodes {
            return Err(GraphError::LabelCount {
                expected: num_nodes,
                found: labels.len(),
            });
        }
        for (split, nodes) in [
            ("train", &splits.train),
            ("validation", &splits.validation),
            ("test", &splits.test),
        ] {
            if let Some(&node) = nodes.iter().find(|&&node| node >= num_nodes) {
                return Err(GraphError::SplitOutOfRange {
                    split,
                    node,
                    num_nodes,
                });
            }
        }

        let adjacency = symmetric_adjacency(num_nodes, edges)?;
        let mut row_offsets = Vec::with_capacity(num_nodes + 1);
        row_offsets.push(0);
        for row in adjacency.outer_iterator() {
            let last = row_offsets.last().copied().unwrap_or_default();
            row_offsets.push(last + row.nnz());
        }
        let num_labels = labels.iter().max().map_or(0, |&max| max as usize + 1);

        Ok(Self {
            graph_type,
            adjacency,
            row_offsets,
            features,
            labels,
            num_labels,
            splits,
        })
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.adjacency.rows()
    }

    /// Number of undirected edges.
    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.adjacency.nnz() / 2
    }

    #[must_use]
    pub fn graph_type(&self) -> GraphType {
        self.graph_type
    }

    #[must_use]
    pub fn adjacency(&self) -> &CsMat<f32> {
        &self.adjacency
    }

    #[must_use]
    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    #[must_use]
    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    #[must_use]
    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    #[must_use]
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    #[must_use]
    pub fn splits(&self) -> &Splits {
        &self.splits
    }

    #[must_use]
    pub fn degree(&self, node: usize) -> usize {
        self.row_offsets[node + 1] - self.row_offsets[node]
    }

    /// Neighbours of `node` together with the edge weight.
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        let range = self.row_offsets[node]..self.row_offsets[node + 1];
        self.adjacency.indices()[range.clone()]
            .iter()
            .copied()
            .zip(self.adjacency.data()[range].iter().copied())
    }

    /// Adjacency of the subgraph induced by `nodes`, in the order given.
    #[must_use]
    pub fn induced_subgraph(&self, nodes: &[usize]) -> CsMat<f32> {
        let local: FxHashMap<usize, usize> = nodes
            .iter()
            .enumerate()
            .map(|(index, &node)| (node, index))
            .collect();
        let mut triplets = TriMat::new((nodes.len(), nodes.len()));
        for (row, &node) in nodes.iter().enumerate() {
            for (neighbor, weight) in self.neighbors(node) {
                if let Some(&col) = local.get(&neighbor) {
                    triplets.add_triplet(row, col, weight);
                }
            }
        }
        triplets.to_csr()
    }

    /// Number of connected components of the whole graph.
    #[must_use]
    pub fn connected_components(&self) -> usize {
        let mut graph = UnGraph::<(), ()>::with_capacity(self.num_nodes(), self.num_edges());
        for _ in 0..self.num_nodes() {
            graph.add_node(());
        }
        for node in 0..self.num_nodes() {
            for (neighbor, _) in self.neighbors(node) {
                if node < neighbor {
                    graph.add_edge(NodeIndex::new(node), NodeIndex::new(neighbor), ());
                }
            }
        }
        petgraph::algo::connected_components(&graph)
    }
}

fn symmetric_adjacency(num_nodes: usize, edges: &[(usize, usize)]) -> Result<CsMat<f32>, GraphError> {
    let mut pairs = Vec::with_capacity(edges.len() * 2);
    for &(source_node, target_node) in edges {
        if source_node >= num_nodes || target_node >= num_nodes {
            return Err(GraphError::EdgeOutOfRange {
                source_node,
                target_node,
                num_nodes,
            });
        }
        if source_node != target_node {
            pairs.push((source_node, target_node));
            pairs.push((target_node, source_node));
        }
    }
    pairs.sort_unstable();
    pairs.dedup();

    let mut triplets = TriMat::with_capacity((num_nodes, num_nodes), pairs.len());
    for (row, col) in pairs {
        triplets.add_triplet(row, col, 1.0_f32);
    }
    Ok(triplets.to_csr())
}
