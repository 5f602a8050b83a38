//! Loader → clusterer → batch assembler wiring for the configured splits.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::adjacency::AdjacencyTransform;
use crate::batch::{BatchAssembler, BatchError, BatchLimits};
use crate::cache::ArtifactCache;
use crate::clustering::{
    ClusterSettings, Clustering, ClusteringError, ClusteringStatistics, MultilevelPartitioner,
    cluster_graph,
};
use crate::config::{ConfigError, Options};
use crate::graph::loader::LoadError;
use crate::graph::{Graph, SplitKind, load_dataset};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Clustering(#[from] ClusteringError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("{split} split is not configured")]
    MissingSplit { split: SplitKind },
    #[error("{split} split has no nodes")]
    EmptySplit { split: SplitKind },
}

/// Everything needed to assemble batches for one split.
#[derive(Debug, Clone)]
pub struct PreparedSplit {
    kind: SplitKind,
    label: String,
    visible: Vec<usize>,
    mask: Vec<bool>,
    clustering: Arc<Clustering>,
    clusters_per_batch: usize,
    transform: AdjacencyTransform,
    limits: BatchLimits,
    statistics: ClusteringStatistics,
    epochs: usize,
    use_sparse_representation: bool,
}

impl PreparedSplit {
    #[must_use]
    pub fn kind(&self) -> SplitKind {
        self.kind
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn visible(&self) -> &[usize] {
        &self.visible
    }

    /// Loss mask indexed by global node id.
    #[must_use]
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    #[must_use]
    pub fn clustering(&self) -> &Clustering {
        &self.clustering
    }

    #[must_use]
    pub fn clusters_per_batch(&self) -> usize {
        self.clusters_per_batch
    }

    #[must_use]
    pub fn transform(&self) -> AdjacencyTransform {
        self.transform
    }

    #[must_use]
    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    #[must_use]
    pub fn statistics(&self) -> &ClusteringStatistics {
        &self.statistics
    }

    #[must_use]
    pub fn epochs(&self) -> usize {
        self.epochs
    }

    #[must_use]
    pub fn use_sparse_representation(&self) -> bool {
        self.use_sparse_representation
    }

    /// Borrows an assembler over `graph`, which must be the graph this split was prepared from.
    ///
    /// # Errors
    /// Propagates [`BatchError`] from [`BatchAssembler::new`].
    pub fn assembler<'a>(&'a self, graph: &'a Graph) -> Result<BatchAssembler<'a>, BatchError> {
        Ok(
            BatchAssembler::new(graph, &self.clustering, self.clusters_per_batch, self.transform)?
                .with_mask(&self.mask)
                .with_limits(self.limits),
        )
    }
}

/// Loads `<data_path>/<dataset_name>.json` through the dataset cache.
///
/// # Errors
/// Returns [`PipelineError::Load`] when the dataset cannot be read or validated.
pub fn load_graph(options: &Options, cache: &ArtifactCache) -> Result<Graph, PipelineError> {
    let graph = load_dataset(
        &options.data_path,
        &options.dataset_name,
        cache,
        options.dataset_policy(),
    )?;
    let components = graph.connected_components();
    if components > 1 {
        info!(components, "graph has several connected components");
    }
    Ok(graph)
}

/// Nodes that take part in clustering: the train nodes for training, every node otherwise.
#[must_use]
pub fn visible_nodes(graph: &Graph, kind: SplitKind) -> Vec<usize> {
    match kind {
        SplitKind::Training => {
            let mut nodes = graph.splits().train.clone();
            nodes.sort_unstable();
            nodes.dedup();
            nodes
        }
        SplitKind::Validation | SplitKind::Test => (0..graph.num_nodes()).collect(),
    }
}

/// Per-node loss mask: `true` for the split's own nodes.
#[must_use]
pub fn mask_nodes(graph: &Graph, kind: SplitKind) -> Vec<bool> {
    let splits = graph.splits();
    let members = match kind {
        SplitKind::Training => &splits.train,
        SplitKind::Validation => &splits.validation,
        SplitKind::Test => &splits.test,
    };
    let mut mask = vec![false; graph.num_nodes()];
    for &node in members {
        mask[node] = true;
    }
    mask
}

/// Clusters one split and derives its batch limits and statistics.
///
/// # Errors
/// Fails when the split is not configured or empty, its cluster settings do
/// not fit the graph, or clustering fails.
pub fn prepare_split(
    options: &Options,
    kind: SplitKind,
    graph: &Graph,
    cache: &ArtifactCache,
) -> Result<PreparedSplit, PipelineError> {
    let split = options
        .split(kind)
        .ok_or(PipelineError::MissingSplit { split: kind })?;
    let visible = visible_nodes(graph, kind);
    if visible.is_empty() {
        return Err(PipelineError::EmptySplit { split: kind });
    }
    let mask = mask_nodes(graph, kind);
    if !mask.iter().any(|&m| m) {
        warn!(split = %kind, "split has no labelled nodes, every batch mask will be empty");
    }

    let num_clusters = split.resolve_num_clusters(kind.as_str(), visible.len())?;
    let settings = ClusterSettings {
        label: format!("{}-{}", options.dataset_name, kind),
        num_clusters,
        seed: options.seed,
        policy: options.clustering_policy(),
    };
    let partitioner = MultilevelPartitioner::new(options.imbalance_tolerance);

    let started = Instant::now();
    let clustering = cluster_graph(graph, &visible, &settings, &partitioner, cache)?;
    let statistics = ClusteringStatistics::compute(graph, &clustering, split.clusters_per_batch);
    statistics.log(&settings.label);

    let transform = options.transform_for(kind);
    let mut limits = BatchLimits::estimate(
        graph,
        &clustering,
        split.clusters_per_batch,
        options.method_max_nodes,
        options.method_max_edges,
    );
    if transform.transform_mode.adds_self_connections() {
        limits = limits.with_self_connections();
    }
    info!(
        split = %kind,
        num_clusters,
        clusters_per_batch = split.clusters_per_batch,
        max_nodes = limits.max_nodes,
        max_edges = limits.max_edges,
        transform = %transform.describe(),
        elapsed_ms = started.elapsed().as_millis(),
        "split prepared"
    );

    Ok(PreparedSplit {
        kind,
        label: settings.label,
        visible,
        mask,
        clustering,
        clusters_per_batch: split.clusters_per_batch,
        transform,
        limits,
        statistics,
        epochs: split.epochs,
        use_sparse_representation: split.use_sparse_representation,
    })
}

/// Prepares every configured split in `training`, `validation`, `test` order.
///
/// # Errors
/// Returns the first split that fails to prepare.
pub fn prepare_all(
    options: &Options,
    graph: &Graph,
    cache: &ArtifactCache,
) -> Result<Vec<PreparedSplit>, PipelineError> {
    SplitKind::ALL
        .into_iter()
        .filter(|&kind| options.split(kind).is_some())
        .map(|kind| prepare_split(options, kind, graph, cache))
        .collect()
}

/// `name-dataset-precision-device-form-timestamp`, built from the training split.
#[must_use]
pub fn run_name(options: &Options, now: DateTime<Utc>) -> String {
    let training = &options.training;
    let form = if training.use_sparse_representation {
        "sparse"
    } else {
        "dense"
    };
    format!(
        "{}-{}-{}-{}-{}-{}",
        options.name,
        options.dataset_name,
        training.precision.as_str(),
        training.device.as_str(),
        form,
        now.format("%Y%m%d_%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphType, Splits};
    use chrono::TimeZone;
    use ndarray::Array2;
    use serde_json::json;

    fn graph() -> Graph {
        Graph::from_parts(
            5,
            GraphType::Undirected,
            &[(0, 1), (1, 2), (2, 3), (3, 4)],
            Array2::zeros((5, 1)),
            vec![0; 5],
            Splits {
                train: vec![3, 0, 1, 0],
                validation: vec![2],
                test: vec![4],
            },
        )
        .expect("graph should build")
    }

    #[test]
    fn training_sees_only_train_nodes() {
        assert_eq!(visible_nodes(&graph(), SplitKind::Training), vec![0, 1, 3]);
        assert_eq!(visible_nodes(&graph(), SplitKind::Test).len(), 5);
    }

    #[test]
    fn mask_follows_split_membership() {
        assert_eq!(
            mask_nodes(&graph(), SplitKind::Validation),
            vec![false, false, true, false, false]
        );
    }

    #[test]
    fn run_name_joins_options_and_timestamp() {
        let options = Options::from_value(json!({
            "name": "cluster_gcn",
            "dataset_name": "arxiv",
            "data_path": "data",
            "training": {
                "num_clusters": 4,
                "precision": "fp16",
                "device": "ipu",
                "use_sparse_representation": false,
            },
        }))
        .expect("options are valid");
        let now = Utc
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("valid timestamp");
        assert_eq!(
            run_name(&options, now),
            "cluster_gcn-arxiv-fp16-ipu-dense-20240309_140507"
        );
    }
}
