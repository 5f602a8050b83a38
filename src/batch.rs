//! Mini-batch assembly from clusters.
//!
//! Every epoch visits the clusters in a fresh seeded shuffle, taking
//! `clusters_per_batch` of them per step. The induced subgraph of their union
//! becomes the batch's adjacency block.

pub mod limits;

use ndarray::Array2;
use rand::Rng;
use rand::seq::SliceRandom;
use sprs::{CsMat, TriMat};
use thiserror::Error;
use tracing::debug;

use crate::adjacency::{AdjacencyTransform, to_dense};
use crate::clustering::Clustering;
use crate::graph::Graph;

pub use limits::{BatchLimits, MaxSizeMethod};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("clusters_per_batch must be greater than zero")]
    ZeroClustersPerBatch,
    #[error("clusters_per_batch ({clusters_per_batch}) exceeds num_clusters ({num_clusters})")]
    TooManyClustersPerBatch {
        clusters_per_batch: usize,
        num_clusters: usize,
    },
    #[error("worker {worker_index} is outside 0..{worker_count}")]
    InvalidShard {
        worker_index: usize,
        worker_count: usize,
    },
    #[error("{worker_count} workers cannot share {batches_per_epoch} batches per epoch")]
    ShardLargerThanEpoch {
        worker_count: usize,
        batches_per_epoch: usize,
    },
    #[error("step {step} is outside 0..{batches_per_epoch}")]
    StepOutOfRange {
        step: usize,
        batches_per_epoch: usize,
    },
    #[error("cluster order has {found} entries, expected {expected}")]
    OrderLength { expected: usize, found: usize },
    #[error("cluster order references cluster {cluster} outside 0..{num_clusters}")]
    UnknownCluster { cluster: usize, num_clusters: usize },
    #[error("cluster order visits cluster {cluster} more than once")]
    DuplicateCluster { cluster: usize },
}

/// One training step's worth of nodes.
#[derive(Debug, Clone)]
pub struct Batch {
    pub epoch: usize,
    pub step: usize,
    pub cluster_ids: Vec<usize>,
    /// Global ids of the real (non-padding) rows, in block order.
    pub node_ids: Vec<usize>,
    /// Normalized block; padding rows and columns are empty.
    pub adjacency: CsMat<f32>,
    pub features: Array2<f32>,
    pub labels: Vec<u32>,
    pub mask: Vec<bool>,
    pub num_padding_nodes: usize,
    pub pruned_nodes: usize,
    /// Adjacency entries dropped to fit the edge limit.
    pub pruned_edges: usize,
}

impl Batch {
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.adjacency.rows()
    }

    #[must_use]
    pub fn num_real_nodes(&self) -> usize {
        self.node_ids.len()
    }

    /// Non-zero entries of the normalized block, self-connections included.
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.adjacency.nnz()
    }

    #[must_use]
    pub fn num_masked_nodes(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    #[must_use]
    pub fn dense_adjacency(&self) -> Array2<f32> {
        to_dense(&self.adjacency)
    }
}

/// Builds batches for one split from a fixed clustering.
#[derive(Debug, Clone)]
pub struct BatchAssembler<'a> {
    graph: &'a Graph,
    clustering: &'a Clustering,
    clusters_per_batch: usize,
    transform: AdjacencyTransform,
    mask: Option<&'a [bool]>,
    limits: Option<BatchLimits>,
    worker_index: usize,
    worker_count: usize,
}

impl<'a> BatchAssembler<'a> {
    /// # Errors
    /// Fails unless `1 <= clusters_per_batch <= clustering.num_clusters()`.
    pub fn new(
        graph: &'a Graph,
        clustering: &'a Clustering,
        clusters_per_batch: usize,
        transform: AdjacencyTransform,
    ) -> Result<Self, BatchError> {
        if clusters_per_batch == 0 {
            return Err(BatchError::ZeroClustersPerBatch);
        }
        if clusters_per_batch > clustering.num_clusters() {
            return Err(BatchError::TooManyClustersPerBatch {
                clusters_per_batch,
                num_clusters: clustering.num_clusters(),
            });
        }
        Ok(Self {
            graph,
            clustering,
            clusters_per_batch,
            transform,
            mask: None,
            limits: None,
            worker_index: 0,
            worker_count: 1,
        })
    }

    /// Loss mask indexed by global node id; nodes outside it count as masked out.
    #[must_use]
    pub fn with_mask(mut self, mask: &'a [bool]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Pads every batch up to `limits` and prunes batches that exceed them.
    #[must_use]
    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Restricts iteration to the steps `step % worker_count == worker_index`.
    ///
    /// # Errors
    /// Fails when the index is out of range or there are more workers than batches per epoch.
    pub fn shard(mut self, worker_index: usize, worker_count: usize) -> Result<Self, BatchError> {
        if worker_count == 0 || worker_index >= worker_count {
            return Err(BatchError::InvalidShard {
                worker_index,
                worker_count,
            });
        }
        let batches_per_epoch = self.batches_per_epoch();
        if worker_count > batches_per_epoch {
            return Err(BatchError::ShardLargerThanEpoch {
                worker_count,
                batches_per_epoch,
            });
        }
        self.worker_index = worker_index;
        self.worker_count = worker_count;
        Ok(self)
    }

    #[must_use]
    pub fn clusters_per_batch(&self) -> usize {
        self.clusters_per_batch
    }

    #[must_use]
    pub fn limits(&self) -> Option<BatchLimits> {
        self.limits
    }

    #[must_use]
    pub fn transform(&self) -> AdjacencyTransform {
        self.transform
    }

    #[must_use]
    pub fn batches_per_epoch(&self) -> usize {
        self.clustering.num_clusters().div_ceil(self.clusters_per_batch)
    }

    /// Batches this worker sees per epoch.
    #[must_use]
    pub fn steps_per_epoch(&self) -> usize {
        (self.batches_per_epoch() - self.worker_index).div_ceil(self.worker_count)
    }

    /// A fresh permutation of the cluster ids.
    pub fn shuffled_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.clustering.num_clusters()).collect();
        order.shuffle(rng);
        order
    }

    /// Assembles the batch at `step` of `epoch`, which visits clusters in `order`.
    ///
    /// # Errors
    /// Fails when `order` is not a permutation of the cluster ids or `step` is past the epoch.
    pub fn batch_at(
        &self,
        order: &[usize],
        epoch: usize,
        step: usize,
    ) -> Result<Batch, BatchError> {
        let num_clusters = self.clustering.num_clusters();
        if order.len() != num_clusters {
            return Err(BatchError::OrderLength {
                expected: num_clusters,
                found: order.len(),
            });
        }
        let mut seen = vec![false; num_clusters];
        for &cluster in order {
            if cluster >= num_clusters {
                return Err(BatchError::UnknownCluster {
                    cluster,
                    num_clusters,
                });
            }
            if std::mem::replace(&mut seen[cluster], true) {
                return Err(BatchError::DuplicateCluster { cluster });
            }
        }
        let batches_per_epoch = self.batches_per_epoch();
        if step >= batches_per_epoch {
            return Err(BatchError::StepOutOfRange {
                step,
                batches_per_epoch,
            });
        }
        Ok(self.assemble(order, epoch, step))
    }

    /// One finite epoch; the cluster order is drawn from `rng` immediately.
    pub fn epoch<R: Rng + ?Sized>(&self, epoch: usize, rng: &mut R) -> EpochBatches<'_, 'a> {
        EpochBatches {
            assembler: self,
            order: self.shuffled_order(rng),
            epoch,
            next_step: self.worker_index,
        }
    }

    /// Endless batches, reshuffling at every epoch boundary.
    pub fn stream<'s, 'r, R: Rng + ?Sized>(&'s self, rng: &'r mut R) -> BatchStream<'s, 'a, 'r, R> {
        let order = self.shuffled_order(&mut *rng);
        BatchStream {
            assembler: self,
            rng,
            order,
            epoch: 0,
            next_step: self.worker_index,
        }
    }

    fn assemble(&self, order: &[usize], epoch: usize, step: usize) -> Batch {
        let start = step * self.clusters_per_batch;
        let end = (start + self.clusters_per_batch).min(order.len());
        let cluster_ids = order[start..end].to_vec();

        let mut node_ids: Vec<usize> = cluster_ids
            .iter()
            .flat_map(|&cluster| self.clustering.cluster(cluster).iter().copied())
            .collect();
        let mut pruned_nodes = 0;
        if let Some(limits) = self.limits {
            if node_ids.len() > limits.max_nodes {
                pruned_nodes = node_ids.len() - limits.max_nodes;
                node_ids.truncate(limits.max_nodes);
            }
        }

        let mut block = self.graph.induced_subgraph(&node_ids);
        let mut pruned_edges = 0;
        if let Some(limits) = self.limits {
            // the transform adds one diagonal entry per real row
            let reserved = if self.transform.transform_mode.adds_self_connections() {
                node_ids.len()
            } else {
                0
            };
            let budget = limits.max_edges.saturating_sub(reserved);
            if block.nnz() > budget {
                let (pruned, dropped) = prune_entries(&block, budget);
                block = pruned;
                pruned_edges = dropped;
            }
        }

        let real = node_ids.len();
        let size = self.limits.map_or(real, |limits| limits.max_nodes.max(real));
        let normalized = self.transform.apply(&block);
        let adjacency = if size > real {
            pad_block(&normalized, size)
        } else {
            normalized
        };

        let source = self.graph.features();
        let mut features = Array2::zeros((size, source.ncols()));
        for (row, &node) in node_ids.iter().enumerate() {
            features.row_mut(row).assign(&source.row(node));
        }
        let mut labels: Vec<u32> = node_ids.iter().map(|&node| self.graph.labels()[node]).collect();
        labels.resize(size, 0);
        let mut mask: Vec<bool> = node_ids
            .iter()
            .map(|&node| self.mask.is_none_or(|mask| mask.get(node).copied().unwrap_or(false)))
            .collect();
        mask.resize(size, false);

        if pruned_nodes > 0 || pruned_edges > 0 {
            debug!(epoch, step, pruned_nodes, pruned_edges, "batch pruned to fit limits");
        }

        Batch {
            epoch,
            step,
            cluster_ids,
            node_ids,
            adjacency,
            features,
            labels,
            mask,
            num_padding_nodes: size - real,
            pruned_nodes,
            pruned_edges,
        }
    }
}

/// Keeps whole symmetric pairs in row-major order until `max_entries` is reached.
fn prune_entries(block: &CsMat<f32>, max_entries: usize) -> (CsMat<f32>, usize) {
    let mut triplets = TriMat::new(block.shape());
    let mut kept = 0;
    for (row, entries) in block.outer_iterator().enumerate() {
        for (col, &value) in entries.iter() {
            if row < col && kept + 2 <= max_entries {
                triplets.add_triplet(row, col, value);
                triplets.add_triplet(col, row, value);
                kept += 2;
            }
        }
    }
    (triplets.to_csr(), block.nnz() - kept)
}

fn pad_block(block: &CsMat<f32>, size: usize) -> CsMat<f32> {
    let mut triplets = TriMat::with_capacity((size, size), block.nnz());
    for (row, entries) in block.outer_iterator().enumerate() {
        for (col, &value) in entries.iter() {
            triplets.add_triplet(row, col, value);
        }
    }
    triplets.to_csr()
}

/// Batches of a single epoch.
#[derive(Debug)]
pub struct EpochBatches<'s, 'a> {
    assembler: &'s BatchAssembler<'a>,
    order: Vec<usize>,
    epoch: usize,
    next_step: usize,
}

impl EpochBatches<'_, '_> {
    /// Cluster visiting order of this epoch.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Starts the same epoch over with the same order.
    pub fn restart(&mut self) {
        self.next_step = self.assembler.worker_index;
    }
}

impl Iterator for EpochBatches<'_, '_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.next_step >= self.assembler.batches_per_epoch() {
            return None;
        }
        let batch = self.assembler.assemble(&self.order, self.epoch, self.next_step);
        self.next_step += self.assembler.worker_count;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let total = self.assembler.batches_per_epoch();
        let remaining = total
            .saturating_sub(self.next_step)
            .div_ceil(self.assembler.worker_count);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EpochBatches<'_, '_> {}

/// Endless batch stream.
pub struct BatchStream<'s, 'a, 'r, R: ?Sized> {
    assembler: &'s BatchAssembler<'a>,
    rng: &'r mut R,
    order: Vec<usize>,
    epoch: usize,
    next_step: usize,
}

impl<R: ?Sized> BatchStream<'_, '_, '_, R> {
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl<R: Rng + ?Sized> Iterator for BatchStream<'_, '_, '_, R> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.next_step >= self.assembler.batches_per_epoch() {
            self.epoch += 1;
            self.order = self.assembler.shuffled_order(&mut *self.rng);
            self.next_step = self.assembler.worker_index;
        }
        let batch = self.assembler.assemble(&self.order, self.epoch, self.next_step);
        self.next_step += self.assembler.worker_count;
        Some(batch)
    }
}
