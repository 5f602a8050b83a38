//! Multi-level recursive bisection.
//!
//! Every bisection coarsens the graph with heavy-edge matching, grows an
//! initial split on the coarsest level, then projects it back level by level
//! with greedy boundary refinement. The two halves of a bisection share no
//! vertices, so they are partitioned in parallel.

use std::collections::BinaryHeap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use sprs::CsMat;

use super::Partitioner;
use crate::util::derive_seed;

const NO_VERTEX: usize = usize::MAX;
const LEFT: u8 = 0;
const RIGHT: u8 = 1;

/// Compact CSR graph with vertex and edge weights, as used by the partitioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedGraph {
    xadj: Vec<usize>,
    adjncy: Vec<usize>,
    adjwgt: Vec<u32>,
    vwgt: Vec<u32>,
}

impl WeightedGraph {
    /// Unit vertex and edge weights; the diagonal is ignored. `adjacency` must be symmetric.
    #[must_use]
    pub fn from_adjacency(adjacency: &CsMat<f32>) -> Self {
        let num_vertices = adjacency.rows();
        let mut xadj = Vec::with_capacity(num_vertices + 1);
        let mut adjncy = Vec::with_capacity(adjacency.nnz());
        xadj.push(0);
        for (row, entries) in adjacency.outer_iterator().enumerate() {
            adjncy.extend(entries.iter().map(|(col, _)| col).filter(|&col| col != row));
            xadj.push(adjncy.len());
        }
        let adjwgt = vec![1; adjncy.len()];
        Self {
            xadj,
            adjncy,
            adjwgt,
            vwgt: vec![1; num_vertices],
        }
    }

    #[must_use]
    pub fn num_vertices(&self) -> usize {
        self.vwgt.len()
    }

    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.adjncy.len() / 2
    }

    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.vwgt.iter().map(|&weight| u64::from(weight)).sum()
    }

    fn neighbors(&self, vertex: usize) -> impl Iterator<Item = (usize, u32)> + '_ {
        let range = self.xadj[vertex]..self.xadj[vertex + 1];
        self.adjncy[range.clone()]
            .iter()
            .copied()
            .zip(self.adjwgt[range].iter().copied())
    }

    fn weighted_degree(&self, vertex: usize) -> i64 {
        self.neighbors(vertex).map(|(_, weight)| i64::from(weight)).sum()
    }

    /// Total weight of edges whose endpoints fall in different parts.
    #[must_use]
    pub fn edge_cut(&self, parts: &[usize]) -> u64 {
        (0..self.num_vertices())
            .flat_map(|vertex| {
                self.neighbors(vertex)
                    .filter(move |&(neighbor, _)| vertex < neighbor && parts[vertex] != parts[neighbor])
            })
            .map(|(_, weight)| u64::from(weight))
            .sum()
    }

    fn induced(&self, vertices: &[usize]) -> Self {
        let mut local = vec![NO_VERTEX; self.num_vertices()];
        for (index, &vertex) in vertices.iter().enumerate() {
            local[vertex] = index;
        }
        let mut xadj = Vec::with_capacity(vertices.len() + 1);
        let mut adjncy = Vec::new();
        let mut adjwgt = Vec::new();
        xadj.push(0);
        for &vertex in vertices {
            for (neighbor, weight) in self.neighbors(vertex) {
                if local[neighbor] != NO_VERTEX {
                    adjncy.push(local[neighbor]);
                    adjwgt.push(weight);
                }
            }
            xadj.push(adjncy.len());
        }
        Self {
            xadj,
            adjncy,
            adjwgt,
            vwgt: vertices.iter().map(|&vertex| self.vwgt[vertex]).collect(),
        }
    }
}

/// Allowed weight range for the left side of a bisection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BalanceWindow {
    target: u64,
    lo: u64,
    hi: u64,
}

impl BalanceWindow {
    fn new(total: u64, left_parts: usize, right_parts: usize, tolerance: f32) -> Self {
        let (left, right) = (left_parts as u64, right_parts as u64);
        let parts = left + right;
        // every leaf part needs at least one vertex
        let (hard_lo, hard_hi) = (left, total.saturating_sub(right).max(left));
        let target = ((total * left + parts / 2) / parts).clamp(hard_lo, hard_hi);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let slack = (target as f64 * f64::from(tolerance)).floor() as u64;
        Self {
            target,
            lo: target.saturating_sub(slack).max(hard_lo),
            hi: (target + slack).min(hard_hi),
        }
    }

    fn contains(&self, weight: u64) -> bool {
        (self.lo..=self.hi).contains(&weight)
    }

    fn distance(&self, weight: u64) -> u64 {
        weight.abs_diff(self.target)
    }

    fn violation(&self, weight: u64) -> u64 {
        if weight < self.lo {
            self.lo - weight
        } else {
            weight.saturating_sub(self.hi)
        }
    }
}

/// METIS-style multi-level partitioner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultilevelPartitioner {
    imbalance_tolerance: f32,
    coarsen_to: usize,
    refinement_passes: usize,
    initial_trials: usize,
    parallel_threshold: usize,
}

impl Default for MultilevelPartitioner {
    fn default() -> Self {
        Self {
            imbalance_tolerance: 0.05,
            coarsen_to: 64,
            refinement_passes: 8,
            initial_trials: 4,
            parallel_threshold: 4096,
        }
    }
}

impl MultilevelPartitioner {
    #[must_use]
    pub fn new(imbalance_tolerance: f32) -> Self {
        Self {
            imbalance_tolerance: imbalance_tolerance.max(0.0),
            ..Self::default()
        }
    }

    fn recurse(&self, graph: &WeightedGraph, num_parts: usize, seed: u64) -> Vec<usize> {
        let num_vertices = graph.num_vertices();
        if num_parts <= 1 {
            return vec![0; num_vertices];
        }
        if num_parts >= num_vertices {
            return (0..num_vertices).collect();
        }

        let left_parts = num_parts / 2;
        let right_parts = num_parts - left_parts;
        let side = self.bisect(graph, left_parts, right_parts, seed);
        let (left, right): (Vec<usize>, Vec<usize>) =
            (0..num_vertices).partition(|&vertex| side[vertex] == LEFT);

        let left_graph = graph.induced(&left);
        let right_graph = graph.induced(&right);
        let recurse_left = || self.recurse(&left_graph, left_parts, derive_seed(seed, 1));
        let recurse_right = || self.recurse(&right_graph, right_parts, derive_seed(seed, 2));
        let (left_parts_of, right_parts_of) = if num_vertices >= self.parallel_threshold {
            rayon::join(recurse_left, recurse_right)
        } else {
            (recurse_left(), recurse_right())
        };

        let mut parts = vec![0; num_vertices];
        for (&vertex, &part) in left.iter().zip(&left_parts_of) {
            parts[vertex] = part;
        }
        for (&vertex, &part) in right.iter().zip(&right_parts_of) {
            parts[vertex] = left_parts + part;
        }
        parts
    }

    fn bisect(
        &self,
        graph: &WeightedGraph,
        left_parts: usize,
        right_parts: usize,
        seed: u64,
    ) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let total = graph.total_weight();
        let window = BalanceWindow::new(total, left_parts, right_parts, self.imbalance_tolerance);
        let max_vertex_weight = u32::try_from((total * 3).div_ceil(2 * self.coarsen_to as u64))
            .unwrap_or(u32::MAX)
            .max(2);

        // levels[i] holds the graph one step coarser than its predecessor plus the fine-to-coarse map.
        let mut levels: Vec<(WeightedGraph, Vec<usize>)> = Vec::new();
        loop {
            let current = levels.last().map_or(graph, |(coarse, _)| coarse);
            if current.num_vertices() <= self.coarsen_to {
                break;
            }
            let (coarse, cmap) = coarsen(current, max_vertex_weight, &mut rng);
            if coarse.num_vertices() * 20 > current.num_vertices() * 19 {
                break;
            }
            levels.push((coarse, cmap));
        }

        let coarsest = levels.last().map_or(graph, |(coarse, _)| coarse);
        let mut side = self.initial_bisection(coarsest, &window, &mut rng);

        for index in (0..levels.len()).rev() {
            let finer = if index == 0 { graph } else { &levels[index - 1].0 };
            side = levels[index].1.iter().map(|&coarse| side[coarse]).collect();
            refine(finer, &mut side, &window, self.refinement_passes);
        }

        rebalance(graph, &mut side, &window);
        refine(graph, &mut side, &window, self.refinement_passes);
        side
    }

    fn initial_bisection(
        &self,
        graph: &WeightedGraph,
        window: &BalanceWindow,
        rng: &mut StdRng,
    ) -> Vec<u8> {
        let mut best: Option<(u64, u64, Vec<u8>)> = None;
        for _ in 0..self.initial_trials.max(1) {
            let mut side = grow_bisection(graph, window, rng);
            refine(graph, &mut side, window, self.refinement_passes);
            let violation = window.violation(left_weight(graph, &side));
            let cut = side_cut(graph, &side);
            if best
                .as_ref()
                .is_none_or(|(best_violation, best_cut, _)| (violation, cut) < (*best_violation, *best_cut))
            {
                best = Some((violation, cut, side));
            }
        }
        best.map_or_else(|| vec![RIGHT; graph.num_vertices()], |(_, _, side)| side)
    }
}

impl Partitioner for MultilevelPartitioner {
    fn partition(&self, graph: &WeightedGraph, num_parts: usize, seed: u64) -> Vec<usize> {
        self.recurse(graph, num_parts.min(graph.num_vertices()), seed)
    }

    fn describe(&self) -> String {
        format!(
            "multilevel:tol={}:coarsen_to={}:passes={}:trials={}",
            self.imbalance_tolerance, self.coarsen_to, self.refinement_passes, self.initial_trials
        )
    }
}

/// Heavy-edge matching; returns the coarse graph and the fine-to-coarse vertex map.
fn coarsen(
    graph: &WeightedGraph,
    max_vertex_weight: u32,
    rng: &mut StdRng,
) -> (WeightedGraph, Vec<usize>) {
    let num_vertices = graph.num_vertices();
    let mut order: Vec<usize> = (0..num_vertices).collect();
    order.shuffle(rng);

    let mut mate = vec![NO_VERTEX; num_vertices];
    for &vertex in &order {
        if mate[vertex] != NO_VERTEX {
            continue;
        }
        let mut best: Option<(u32, usize)> = None;
        for (neighbor, weight) in graph.neighbors(vertex) {
            if neighbor == vertex
                || mate[neighbor] != NO_VERTEX
                || graph.vwgt[vertex] + graph.vwgt[neighbor] > max_vertex_weight
            {
                continue;
            }
            if best.is_none_or(|(best_weight, _)| weight > best_weight) {
                best = Some((weight, neighbor));
            }
        }
        match best {
            Some((_, neighbor)) => {
                mate[vertex] = neighbor;
                mate[neighbor] = vertex;
            }
            None => mate[vertex] = vertex,
        }
    }

    let mut cmap = vec![NO_VERTEX; num_vertices];
    let mut members: Vec<[usize; 2]> = Vec::new();
    for vertex in 0..num_vertices {
        if cmap[vertex] == NO_VERTEX {
            let coarse = members.len();
            cmap[vertex] = coarse;
            cmap[mate[vertex]] = coarse;
            members.push([vertex, mate[vertex]]);
        }
    }

    let num_coarse = members.len();
    let mut xadj = Vec::with_capacity(num_coarse + 1);
    let mut adjncy = Vec::new();
    let mut adjwgt: Vec<u32> = Vec::new();
    let mut vwgt = Vec::with_capacity(num_coarse);
    let mut slot = vec![NO_VERTEX; num_coarse];
    xadj.push(0);

    for (coarse, pair) in members.iter().enumerate() {
        let start = adjncy.len();
        let mut weight = graph.vwgt[pair[0]];
        if pair[1] != pair[0] {
            weight += graph.vwgt[pair[1]];
        }
        let fine_vertices = if pair[1] == pair[0] { &pair[..1] } else { &pair[..] };
        for &vertex in fine_vertices {
            for (neighbor, edge_weight) in graph.neighbors(vertex) {
                let target = cmap[neighbor];
                if target == coarse {
                    continue;
                }
                if slot[target] == NO_VERTEX {
                    slot[target] = adjncy.len();
                    adjncy.push(target);
                    adjwgt.push(edge_weight);
                } else {
                    adjwgt[slot[target]] += edge_weight;
                }
            }
        }
        for &target in &adjncy[start..] {
            slot[target] = NO_VERTEX;
        }
        xadj.push(adjncy.len());
        vwgt.push(weight);
    }

    (
        WeightedGraph {
            xadj,
            adjncy,
            adjwgt,
            vwgt,
        },
        cmap,
    )
}

/// Greedy graph growing: the left region absorbs the frontier vertex with the
/// best cut gain until it reaches the target weight. Disconnected pieces are
/// entered through a shuffled restart order.
fn grow_bisection(graph: &WeightedGraph, window: &BalanceWindow, rng: &mut StdRng) -> Vec<u8> {
    let num_vertices = graph.num_vertices();
    let degree: Vec<i64> = (0..num_vertices).map(|v| graph.weighted_degree(v)).collect();
    let mut side = vec![RIGHT; num_vertices];
    let mut connection = vec![0_i64; num_vertices];
    let mut heap: BinaryHeap<(i64, usize)> = BinaryHeap::new();
    let mut restarts: Vec<usize> = (0..num_vertices).collect();
    restarts.shuffle(rng);
    let mut next_restart = 0;
    let mut weight = 0_u64;

    while weight < window.target {
        let next = loop {
            match heap.pop() {
                Some((gain, vertex))
                    if side[vertex] == RIGHT && gain == 2 * connection[vertex] - degree[vertex] =>
                {
                    break Some(vertex);
                }
                Some(_) => {}
                None => {
                    while next_restart < num_vertices && side[restarts[next_restart]] == LEFT {
                        next_restart += 1;
                    }
                    break restarts.get(next_restart).copied();
                }
            }
        };
        let Some(vertex) = next else {
            break;
        };

        side[vertex] = LEFT;
        weight += u64::from(graph.vwgt[vertex]);
        for (neighbor, edge_weight) in graph.neighbors(vertex) {
            if side[neighbor] == RIGHT {
                connection[neighbor] += i64::from(edge_weight);
                heap.push((2 * connection[neighbor] - degree[neighbor], neighbor));
            }
        }
    }
    side
}

fn left_weight(graph: &WeightedGraph, side: &[u8]) -> u64 {
    side.iter()
        .zip(&graph.vwgt)
        .filter(|&(&s, _)| s == LEFT)
        .map(|(_, &weight)| u64::from(weight))
        .sum()
}

fn side_cut(graph: &WeightedGraph, side: &[u8]) -> u64 {
    (0..graph.num_vertices())
        .flat_map(|vertex| {
            graph
                .neighbors(vertex)
                .filter(move |&(neighbor, _)| vertex < neighbor && side[vertex] != side[neighbor])
        })
        .map(|(_, weight)| u64::from(weight))
        .sum()
}

/// Gain of moving `vertex` to the other side: external minus internal edge weight.
fn move_gain(graph: &WeightedGraph, side: &[u8], vertex: usize) -> i64 {
    graph
        .neighbors(vertex)
        .map(|(neighbor, weight)| {
            if side[neighbor] == side[vertex] {
                -i64::from(weight)
            } else {
                i64::from(weight)
            }
        })
        .sum()
}

/// Greedy boundary refinement; only moves that keep the left weight inside the window.
fn refine(graph: &WeightedGraph, side: &mut [u8], window: &BalanceWindow, passes: usize) {
    let mut weight = left_weight(graph, side);
    for _ in 0..passes {
        let mut moved = false;
        for vertex in 0..graph.num_vertices() {
            let gain = move_gain(graph, side, vertex);
            if gain < 0 {
                continue;
            }
            let vertex_weight = u64::from(graph.vwgt[vertex]);
            let moved_weight = if side[vertex] == LEFT {
                weight - vertex_weight
            } else {
                weight + vertex_weight
            };
            if !window.contains(moved_weight) {
                continue;
            }
            if gain > 0 || window.distance(moved_weight) < window.distance(weight) {
                side[vertex] ^= 1;
                weight = moved_weight;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
}

/// Forces the left weight into the window, moving the cheapest vertices first.
fn rebalance(graph: &WeightedGraph, side: &mut [u8], window: &BalanceWindow) {
    let mut weight = left_weight(graph, side);
    if window.contains(weight) {
        return;
    }
    let from = if weight < window.lo { RIGHT } else { LEFT };
    let mut candidates: Vec<(i64, usize)> = (0..graph.num_vertices())
        .filter(|&vertex| side[vertex] == from)
        .map(|vertex| (move_gain(graph, side, vertex), vertex))
        .collect();
    candidates.sort_unstable_by(|a, b| b.cmp(a));

    for (_, vertex) in candidates {
        if window.contains(weight) {
            break;
        }
        let vertex_weight = u64::from(graph.vwgt[vertex]);
        let moved_weight = if from == RIGHT {
            weight + vertex_weight
        } else {
            weight - vertex_weight
        };
        if (from == RIGHT && moved_weight > window.hi) || (from == LEFT && moved_weight < window.lo) {
            continue;
        }
        side[vertex] = 1 - from;
        weight = moved_weight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    fn graph_from_edges(num_vertices: usize, edges: &[(usize, usize)]) -> WeightedGraph {
        let mut triplets = TriMat::new((num_vertices, num_vertices));
        for &(a, b) in edges {
            triplets.add_triplet(a, b, 1.0_f32);
            triplets.add_triplet(b, a, 1.0_f32);
        }
        WeightedGraph::from_adjacency(&triplets.to_csr())
    }

    fn two_cliques(size: usize) -> WeightedGraph {
        let mut edges = Vec::new();
        for offset in [0, size] {
            for a in 0..size {
                for b in (a + 1)..size {
                    edges.push((offset + a, offset + b));
                }
            }
        }
        edges.push((0, size));
        graph_from_edges(size * 2, &edges)
    }

    #[test]
    fn bisection_finds_the_bridge() {
        let graph = two_cliques(8);
        let parts = MultilevelPartitioner::default().partition(&graph, 2, 42);
        assert_eq!(graph.edge_cut(&parts), 1);
        assert_eq!(parts.iter().filter(|&&part| part == 0).count(), 8);
    }

    #[test]
    fn coarsening_halves_a_matching_friendly_graph() {
        let graph = two_cliques(16);
        let mut rng = StdRng::seed_from_u64(3);
        let (coarse, cmap) = coarsen(&graph, 4, &mut rng);
        assert!(coarse.num_vertices() <= 20);
        assert_eq!(coarse.total_weight(), graph.total_weight());
        assert!(cmap.iter().all(|&c| c < coarse.num_vertices()));
    }

    #[test]
    fn every_part_is_non_empty_when_parts_equal_vertices() {
        let graph = graph_from_edges(5, &[(0, 1), (1, 2), (2, 3), (3, 4)]);
        let mut parts = MultilevelPartitioner::default().partition(&graph, 5, 1);
        parts.sort_unstable();
        assert_eq!(parts, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn balance_window_respects_leaf_minimums() {
        let window = BalanceWindow::new(3, 1, 2, 0.5);
        assert!(window.lo >= 1);
        assert!(window.hi <= 1);
    }

    #[test]
    fn rebalance_pulls_weight_into_window() {
        let graph = graph_from_edges(6, &[(0, 1), (1, 2), (3, 4), (4, 5)]);
        let window = BalanceWindow::new(6, 1, 1, 0.0);
        let mut side = vec![LEFT; 6];
        rebalance(&graph, &mut side, &window);
        assert_eq!(left_weight(&graph, &side), 3);
    }

    #[test]
    fn isolated_vertices_are_still_partitioned() {
        let graph = graph_from_edges(10, &[]);
        let parts = MultilevelPartitioner::default().partition(&graph, 3, 9);
        for part in 0..3 {
            assert!(parts.contains(&part));
        }
    }
}
