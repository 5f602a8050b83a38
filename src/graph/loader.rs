//! JSON dataset loading with the processed form cached between runs.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::{Graph, GraphError, GraphType, Splits};
use crate::cache::{ArtifactCache, CacheKey, CachePolicy};

/// Bumped whenever [`ProcessedDataset`] changes shape so old cache files are never read.
const PROCESSED_FORMAT_VERSION: u32 = 1;

/// On-disk dataset as written by the preprocessing scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub num_nodes: usize,
    #[serde(default)]
    pub directed: bool,
    pub edges: Vec<[usize; 2]>,
    #[serde(default)]
    pub features: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    pub labels: Option<Vec<u32>>,
    #[serde(default)]
    pub splits: Option<SplitRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitRecord {
    #[serde(default)]
    pub train: Vec<usize>,
    #[serde(default)]
    pub validation: Vec<usize>,
    #[serde(default)]
    pub test: Vec<usize>,
}

/// Validated, deduplicated dataset; this is what the dataset cache stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedDataset {
    pub num_nodes: usize,
    pub graph_type: GraphType,
    /// Undirected edges with `source < target`, sorted.
    pub edges: Vec<(usize, usize)>,
    pub features: Array2<f32>,
    pub labels: Vec<u32>,
    pub splits: Splits,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read dataset at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse dataset at {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl ProcessedDataset {
    /// Validates a raw record and normalizes it: undirected deduplicated edges,
    /// a constant feature column when none are given, label 0 when labels are
    /// missing, and every node in `train` when no splits are given.
    ///
    /// # Errors
    /// Returns [`GraphError`] when the record is internally inconsistent.
    pub fn from_record(record: DatasetRecord) -> Result<Self, GraphError> {
        let num_nodes = record.num_nodes;
        if num_nodes == 0 {
            return Err(GraphError::Empty);
        }

        let mut edges = Vec::with_capacity(record.edges.len());
        for [source_node, target_node] in record.edges {
            if source_node >= num_nodes || target_node >= num_nodes {
                return Err(GraphError::EdgeOutOfRange {
                    source_node,
                    target_node,
                    num_nodes,
                });
            }
            if source_node != target_node {
                edges.push((source_node.min(target_node), source_node.max(target_node)));
            }
        }
        edges.sort_unstable();
        edges.dedup();

        let features = match record.features {
            Some(rows) => features_from_rows(num_nodes, rows)?,
            None => Array2::ones((num_nodes, 1)),
        };
        let labels = record.labels.unwrap_or_else(|| vec![0; num_nodes]);
        let splits = match record.splits {
            Some(split) => Splits {
                train: split.train,
                validation: split.validation,
                test: split.test,
            },
            None => Splits {
                train: (0..num_nodes).collect(),
                ..Splits::default()
            },
        };
        let graph_type = if record.directed {
            GraphType::Directed
        } else {
            GraphType::Undirected
        };

        Ok(Self {
            num_nodes,
            graph_type,
            edges,
            features,
            labels,
            splits,
        })
    }

    /// # Errors
    /// Propagates [`GraphError`] from [`Graph::from_parts`].
    pub fn to_graph(&self) -> Result<Graph, GraphError> {
        Graph::from_parts(
            self.num_nodes,
            self.graph_type,
            &self.edges,
            self.features.clone(),
            self.labels.clone(),
            self.splits.clone(),
        )
    }
}

fn features_from_rows(num_nodes: usize, rows: Vec<Vec<f32>>) -> Result<Array2<f32>, GraphError> {
    if rows.len() != num_nodes {
        return Err(GraphError::FeatureRows {
            expected: num_nodes,
            found: rows.len(),
        });
    }
    let width = rows.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(num_nodes * width);
    for (row, values) in rows.into_iter().enumerate() {
        if values.len() != width {
            return Err(GraphError::FeatureWidth {
                row,
                expected: width,
                found: values.len(),
            });
        }
        flat.extend(values);
    }
    Ok(Array2::from_shape_vec((num_nodes, width), flat)?)
}

/// Path of the raw dataset file for `dataset_name` under `data_path`.
#[must_use]
pub fn dataset_path(data_path: &Path, dataset_name: &str) -> PathBuf {
    data_path.join(format!("{dataset_name}.json"))
}

/// Reads and parses a raw dataset file.
///
/// # Errors
/// Returns [`LoadError::Io`] or [`LoadError::Deserialize`].
pub fn read_record(path: &Path) -> Result<DatasetRecord, LoadError> {
    let contents = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| LoadError::Deserialize {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads `<data_path>/<dataset_name>.json`, going through the dataset cache.
///
/// # Errors
/// Returns [`LoadError`] when the file cannot be read or fails validation.
pub fn load_dataset(
    data_path: &Path,
    dataset_name: &str,
    cache: &ArtifactCache,
    policy: CachePolicy,
) -> Result<Graph, LoadError> {
    let key = CacheKey::new("dataset", dataset_name).param("format", PROCESSED_FORMAT_VERSION);
    let path = dataset_path(data_path, dataset_name);

    let processed = cache.get_or_compute(&key, policy, || {
        info!(path = %path.display(), "processing raw dataset");
        let record = read_record(&path)?;
        Ok::<_, LoadError>(ProcessedDataset::from_record(record)?)
    })?;
    let graph = processed.to_graph()?;

    info!(
        dataset = dataset_name,
        nodes = graph.num_nodes(),
        edges = graph.num_edges(),
        features = graph.num_features(),
        labels = graph.num_labels(),
        train = graph.splits().train.len(),
        validation = graph.splits().validation.len(),
        test = graph.splits().test.len(),
        "graph dataset loaded"
    );
    Ok(graph)
}
