//! Dijkstra shortest paths over the CSR neighbor graph.
//!
//! Edge weights are non-negative by construction; uncomputed edges carry
//! `+∞` and are never relaxed. Heap ties are broken by ascending node index
//! so repeated runs are deterministic.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::NeighborGraph;

/// Predecessor sentinel for nodes unreachable from the source.
pub const NO_PATH: u32 = u32::MAX;

#[derive(Copy, Clone, PartialEq)]
struct HeapEntry {
    dist: f64,
    node: u32,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: rank smaller distances (then smaller
        // node indices) as greater so they pop first.
        other
            .dist
            .total_cmp(&self.dist)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Single-source shortest paths, reusable across sources.
pub struct DijkstraSolver<'g> {
    graph: &'g NeighborGraph,
    distance: Vec<f64>,
    predecessor: Vec<u32>,
}

impl<'g> DijkstraSolver<'g> {
    pub fn new(graph: &'g NeighborGraph) -> Self {
        let n = graph.node_count();
        Self {
            graph,
            distance: vec![f64::INFINITY; n],
            predecessor: vec![NO_PATH; n],
        }
    }

    /// Distances after the last `compute`; unreachable nodes hold `+∞`.
    pub fn distance(&self) -> &[f64] {
        &self.distance
    }

    /// Predecessors after the last `compute`; `predecessor[source]` is the
    /// source itself and unreachable nodes hold [`NO_PATH`].
    pub fn predecessor(&self) -> &[u32] {
        &self.predecessor
    }

    /// Populate distance and predecessor arrays from `source`.
    pub fn compute(&mut self, source: u32) {
        self.distance.fill(f64::INFINITY);
        self.predecessor.fill(NO_PATH);
        self.distance[source as usize] = 0.0;
        self.predecessor[source as usize] = source;

        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry {
            dist: 0.0,
            node: source,
        });

        while let Some(HeapEntry { dist, node }) = heap.pop() {
            if dist > self.distance[node as usize] {
                continue; // stale entry
            }
            for slot in self.graph.edge_slots(node) {
                let weight = self.graph.weight(slot);
                if weight.is_infinite() {
                    continue;
                }
                let target = self.graph.target(slot);
                let candidate = dist + weight;
                if candidate < self.distance[target as usize] {
                    self.distance[target as usize] = candidate;
                    self.predecessor[target as usize] = node;
                    heap.push(HeapEntry {
                        dist: candidate,
                        node: target,
                    });
                }
            }
        }
    }
}
