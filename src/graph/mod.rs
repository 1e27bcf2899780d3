//! Neighbor graph over the slide stack.
//!
//! Nodes are slides; a directed edge `(s → t)` commits the pipeline to
//! registering `t` against `s`. Edges connect each slide to its z-local
//! neighborhood: walking outward from a slide in both directions, a
//! candidate is added while either nothing has been added in that direction
//! yet or the z-gap is still inside `z_range`. The "at least one per
//! direction" rule keeps slides at extreme or sparse z-positions connected.
//!
//! The edge set is stored CSR-style: a prefix-sum index of size `|V|+1`
//! over a flat adjacency array, with one weight slot per edge. Weight slots
//! start at `+∞` and are filled by the pairwise registrar.

pub mod dijkstra;

use std::collections::BTreeSet;
use std::ops::Range;

use crate::manifest::SlideIndex;

pub use self::dijkstra::{DijkstraSolver, NO_PATH};

/// Weight of an edge whose registration has not been computed.
pub const UNREGISTERED_WEIGHT: f64 = f64::INFINITY;

/// Map a pairwise similarity metric and a z-gap to an edge weight.
/// Higher similarity and smaller gaps give cheaper edges; with
/// `z_epsilon >= 0` the weight is non-decreasing in the gap.
pub fn edge_weight(normalized_metric: f64, z_gap: f64, z_epsilon: f64) -> f64 {
    (1.0 - normalized_metric) * (1.0 + z_epsilon).powf(z_gap.abs())
}

/// CSR adjacency of the slide stack with per-edge weights.
#[derive(Clone, Debug)]
pub struct NeighborGraph {
    adj_index: Vec<u32>,
    adjacency: Vec<u32>,
    weights: Vec<f64>,
}

impl NeighborGraph {
    /// Build the z-local adjacency from the sorted index.
    pub fn build(index: &SlideIndex, z_range: f64) -> Self {
        let n = index.len();
        // Per-slide neighbor sets keyed by (z-bits, ordinal) so iteration
        // follows the (z, ordinal) order; the two direction passes cannot
        // produce duplicates but the set keeps the contract explicit.
        let mut neighbor_sets: Vec<BTreeSet<(u64, u32)>> = vec![BTreeSet::new(); n];

        let sort_key = |z: f64, ordinal: u32| (ordered_bits(z), ordinal);

        for rank in 0..n {
            let (z, ordinal) = index.entry(rank);

            let mut added = 0usize;
            for next in (rank + 1)..n {
                let (zn, on) = index.entry(next);
                if added >= 1 && (zn - z).abs() >= z_range {
                    break;
                }
                neighbor_sets[ordinal as usize].insert(sort_key(zn, on));
                added += 1;
            }

            let mut added = 0usize;
            for prev in (0..rank).rev() {
                let (zp, op) = index.entry(prev);
                if added >= 1 && (zp - z).abs() >= z_range {
                    break;
                }
                neighbor_sets[ordinal as usize].insert(sort_key(zp, op));
                added += 1;
            }
        }

        let mut adj_index = Vec::with_capacity(n + 1);
        adj_index.push(0u32);
        let mut adjacency = Vec::new();
        for set in &neighbor_sets {
            for &(_, ordinal) in set {
                adjacency.push(ordinal);
            }
            adj_index.push(adjacency.len() as u32);
        }
        let weights = vec![UNREGISTERED_WEIGHT; adjacency.len()];
        Self {
            adj_index,
            adjacency,
            weights,
        }
    }

    /// Assemble a graph directly from CSR parts.
    pub fn from_parts(adj_index: Vec<u32>, adjacency: Vec<u32>, weights: Vec<f64>) -> Self {
        debug_assert_eq!(adj_index.last().copied().unwrap_or(0) as usize, adjacency.len());
        debug_assert_eq!(adjacency.len(), weights.len());
        Self {
            adj_index,
            adjacency,
            weights,
        }
    }

    pub fn node_count(&self) -> usize {
        self.adj_index.len().saturating_sub(1)
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Edge-slot range of a node; slots index both `adjacency` and the
    /// weight array.
    pub fn edge_slots(&self, node: u32) -> Range<usize> {
        self.adj_index[node as usize] as usize..self.adj_index[node as usize + 1] as usize
    }

    /// Neighbor ordinals of a node, in (z, ordinal) order.
    pub fn neighbors(&self, node: u32) -> &[u32] {
        &self.adjacency[self.edge_slots(node)]
    }

    pub fn weight(&self, slot: usize) -> f64 {
        self.weights[slot]
    }

    pub fn set_weight(&mut self, slot: usize, weight: f64) {
        self.weights[slot] = weight;
    }

    pub fn target(&self, slot: usize) -> u32 {
        self.adjacency[slot]
    }
}

/// Monotone mapping from f64 to sortable bits (all z-values are finite).
fn ordered_bits(z: f64) -> u64 {
    let bits = z.to_bits();
    if bits >> 63 == 0 {
        bits | (1 << 63)
    } else {
        !bits
    }
}
