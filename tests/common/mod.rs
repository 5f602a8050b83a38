#![allow(dead_code)]

use std::fs;
use std::path::Path;

use cluster_batcher::graph::{DatasetRecord, Graph, ProcessedDataset, SplitRecord};

/// `num_cliques` cliques of `size` nodes, joined into a ring by one edge between neighbours.
///
/// Nodes with `node % 4 < 2` are train nodes, `== 2` validation, `== 3` test.
pub fn ring_of_cliques(num_cliques: usize, size: usize) -> DatasetRecord {
    let num_nodes = num_cliques * size;
    let mut edges = Vec::new();
    for clique in 0..num_cliques {
        let base = clique * size;
        for a in 0..size {
            for b in (a + 1)..size {
                edges.push([base + a, base + b]);
            }
        }
        let next = ((clique + 1) % num_cliques) * size;
        if num_cliques > 1 {
            edges.push([base + size - 1, next]);
        }
    }

    let features = (0..num_nodes).map(|node| vec![node as f32, 1.0]).collect();
    let labels = (0..num_nodes).map(|node| (node / size % 3) as u32).collect();
    let by_residue = |residue: usize| -> Vec<usize> {
        (0..num_nodes).filter(|node| node % 4 == residue).collect()
    };
    let mut train = by_residue(0);
    train.extend(by_residue(1));
    train.sort_unstable();

    DatasetRecord {
        num_nodes,
        directed: true,
        edges,
        features: Some(features),
        labels: Some(labels),
        splits: Some(SplitRecord {
            train,
            validation: by_residue(2),
            test: by_residue(3),
        }),
    }
}

pub fn graph_from(record: DatasetRecord) -> Graph {
    ProcessedDataset::from_record(record)
        .and_then(|processed| processed.to_graph())
        .expect("fixture graph is valid")
}

pub fn write_dataset(dir: &Path, name: &str, record: &DatasetRecord) {
    let contents = serde_json::to_string(record).expect("record serializes");
    fs::write(dir.join(format!("{name}.json")), contents).expect("dataset file is written");
}
