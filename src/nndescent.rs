//! NN-descent bulk builder for the base layer.
//!
//! Inserting a large corpus one element at a time pays a full graph search
//! per element. NN-descent instead starts every neighbor list random and
//! jointly refines them: each point compares its current neighbors against
//! each other ("local join"), keeps the diverse ones, hands the rest to the
//! closer neighbor, and periodically merges reverse edges back in. A few
//! turns converge to a navigable graph with the same contract as the base
//! layer: bounded degree, no duplicates, no self-loops.
//!
//! All passes are data-parallel across points. Every mutation of a neighbor
//! list holds that point's mutex, including a point swapping out its own
//! list and the cross insertions into another point's list.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::distance::DistanceFunc;
use crate::error::{IndexError, Result};
use crate::InnerId;

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct NNDescent {
    /// Degree bound of the produced graph.
    pub max_degree: usize,
    /// Number of refinement iterations.
    pub turns: usize,
    /// Fixed seed for the random initialization. `None` seeds each point
    /// from the OS.
    pub seed: Option<u64>,
}

impl Default for NNDescent {
    fn default() -> Self {
        Self {
            max_degree: 32,
            turns: 10,
            seed: None,
        }
    }
}

/// Loss-like convergence measurement over the whole graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnStats {
    /// Mean distance across all stored edges.
    pub mean_distance: f32,
    /// Total number of stored edges.
    pub edge_count: u64,
}

/// Per-phase measurements for convergence monitoring.
#[derive(Debug, Clone)]
pub struct ConvergenceStats {
    /// After random initialization.
    pub after_init: TurnStats,
    /// After each refinement turn (measured before the reverse-edge merge).
    pub per_turn: Vec<TurnStats>,
    /// After the final prune.
    pub after_prune: TurnStats,
}

/// The produced base-layer graph.
#[derive(Debug, Clone)]
pub struct BaseGraph {
    /// Neighbor lists indexed by inner id.
    pub neighbors: Vec<Vec<InnerId>>,
    /// Convergence measurements.
    pub stats: ConvergenceStats,
}

#[derive(Debug, Clone, Copy)]
struct Neighbor {
    id: u32,
    distance: f32,
    old: bool,
}

impl Neighbor {
    fn new(id: u32, distance: f32) -> Self {
        let distance = if distance.is_nan() {
            f32::INFINITY
        } else {
            distance
        };
        Self {
            id,
            distance,
            old: false,
        }
    }
}

/// Build a base-layer graph over `vectors` with the given bound and turn
/// count. Convenience wrapper over [`NNDescent::build`].
pub fn build_base_layer_nn_descent(
    vectors: &[f32],
    dim: usize,
    distance: DistanceFunc,
    max_degree: usize,
    turns: usize,
) -> Result<BaseGraph> {
    NNDescent {
        max_degree,
        turns,
        seed: None,
    }
    .build(vectors, dim, distance)
}

impl NNDescent {
    /// Run the full init → refine → prune pipeline.
    pub fn build(&self, vectors: &[f32], dim: usize, distance: DistanceFunc) -> Result<BaseGraph> {
        if dim == 0 {
            return Err(IndexError::InvalidParameter("dimension must be positive".into()));
        }
        if vectors.len() % dim != 0 {
            return Err(IndexError::InvalidParameter(format!(
                "{} floats cannot form whole {dim}-dimensional vectors",
                vectors.len()
            )));
        }
        if self.max_degree == 0 {
            return Err(IndexError::InvalidParameter(
                "max_degree must be at least 1".into(),
            ));
        }
        if self.turns == 0 {
            return Err(IndexError::InvalidParameter("turns must be at least 1".into()));
        }
        let n = vectors.len() / dim;
        if n > u32::MAX as usize {
            return Err(IndexError::CapacityExceeded {
                capacity: u32::MAX as u64,
                requested: n as u64,
            });
        }
        if n == 0 {
            return Ok(BaseGraph {
                neighbors: Vec::new(),
                stats: ConvergenceStats {
                    after_init: TurnStats {
                        mean_distance: 0.0,
                        edge_count: 0,
                    },
                    per_turn: Vec::new(),
                    after_prune: TurnStats {
                        mean_distance: 0.0,
                        edge_count: 0,
                    },
                },
            });
        }

        let point = |i: usize| &vectors[i * dim..(i + 1) * dim];
        let dist = |a: usize, b: usize| distance(point(a), point(b));

        let graph: Vec<Mutex<Vec<Neighbor>>> = (0..n).map(|_| Mutex::new(Vec::new())).collect();

        // Random init, with replacement; dedup and self-removal happen in
        // the prune.
        graph.par_iter().enumerate().for_each(|(i, slot)| {
            let mut rng = self.rng_for(i);
            let mut list = Vec::with_capacity(self.max_degree);
            for _ in 0..self.max_degree {
                let id = rng.random_range(0..n);
                list.push(Neighbor::new(id as u32, dist(i, id)));
            }
            *slot.lock() = list;
        });

        let after_init = measure(&graph);
        tracing::debug!(
            mean_distance = f64::from(after_init.mean_distance),
            edge_count = after_init.edge_count,
            "nn-descent init"
        );

        let mut per_turn = Vec::with_capacity(self.turns);
        for turn in 0..self.turns {
            self.local_join(&graph, &dist);
            let stats = measure(&graph);
            tracing::debug!(
                turn,
                mean_distance = f64::from(stats.mean_distance),
                edge_count = stats.edge_count,
                "nn-descent turn complete"
            );
            per_turn.push(stats);
            if turn + 1 != self.turns {
                self.merge_reverse_edges(&graph);
            }
        }

        graph.par_iter().enumerate().for_each(|(i, slot)| {
            prune(&mut slot.lock(), i, self.max_degree);
        });
        let after_prune = measure(&graph);
        tracing::debug!(
            mean_distance = f64::from(after_prune.mean_distance),
            edge_count = after_prune.edge_count,
            "nn-descent final prune"
        );

        let neighbors = graph
            .into_iter()
            .map(|slot| {
                slot.into_inner()
                    .into_iter()
                    .map(|nb| nb.id as InnerId)
                    .collect()
            })
            .collect();

        Ok(BaseGraph {
            neighbors,
            stats: ConvergenceStats {
                after_init,
                per_turn,
                after_prune,
            },
        })
    }

    /// One local-join pass: each point sweeps its neighbors in ascending
    /// distance, keeps the diverse ones, and hands every shadowed candidate
    /// to the neighbor that shadows it.
    fn local_join(&self, graph: &[Mutex<Vec<Neighbor>>], dist: &(dyn Fn(usize, usize) -> f32 + Sync)) {
        (0..graph.len()).into_par_iter().for_each(|i| {
            let mut old_neighbors = std::mem::take(&mut *graph[i].lock());
            old_neighbors.sort_unstable_by(|a, b| a.distance.total_cmp(&b.distance));

            let mut new_neighbors: Vec<Neighbor> = Vec::new();
            let mut last_id = u32::MAX;
            for candidate in old_neighbors {
                if candidate.id == last_id {
                    continue;
                }
                last_id = candidate.id;

                let mut keep = true;
                for kept in &new_neighbors {
                    if candidate.old && kept.old {
                        continue;
                    }
                    if candidate.id == kept.id {
                        keep = false;
                        break;
                    }
                    let d = dist(candidate.id as usize, kept.id as usize);
                    if d < candidate.distance {
                        // The kept neighbor is closer to the candidate than
                        // we are: the edge belongs to them.
                        graph[kept.id as usize]
                            .lock()
                            .push(Neighbor::new(candidate.id, d));
                        keep = false;
                        break;
                    }
                }
                if keep {
                    new_neighbors.push(candidate);
                }
            }

            for nb in &mut new_neighbors {
                nb.old = true;
            }
            let mut slot = graph[i].lock();
            slot.extend(new_neighbors);
            prune(&mut slot, i, self.max_degree);
        });
    }

    /// Merge each point's reverse edges back into its list.
    fn merge_reverse_edges(&self, graph: &[Mutex<Vec<Neighbor>>]) {
        let reverse: Vec<Mutex<Vec<Neighbor>>> =
            (0..graph.len()).map(|_| Mutex::new(Vec::new())).collect();

        graph.par_iter().enumerate().for_each(|(i, slot)| {
            let snapshot = slot.lock().clone();
            for nb in snapshot {
                reverse[nb.id as usize]
                    .lock()
                    .push(Neighbor::new(i as u32, nb.distance));
            }
        });

        graph.par_iter().enumerate().for_each(|(i, slot)| {
            let extra = std::mem::take(&mut *reverse[i].lock());
            let mut list = slot.lock();
            list.extend(extra);
            prune(&mut list, i, self.max_degree);
        });
    }

    fn rng_for(&self, i: usize) -> StdRng {
        match self.seed {
            Some(seed) => {
                StdRng::seed_from_u64(seed ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
            }
            None => StdRng::from_os_rng(),
        }
    }
}

/// Sort ascending, drop duplicates and self-edges, truncate to the bound.
fn prune(list: &mut Vec<Neighbor>, u: usize, max_degree: usize) {
    list.sort_unstable_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
    list.dedup_by_key(|nb| nb.id);
    list.retain(|nb| nb.id as usize != u);
    list.truncate(max_degree);
}

fn measure(graph: &[Mutex<Vec<Neighbor>>]) -> TurnStats {
    let mut total = 0.0f64;
    let mut edges = 0u64;
    for slot in graph {
        let list = slot.lock();
        for nb in list.iter() {
            total += f64::from(nb.distance);
        }
        edges += list.len() as u64;
    }
    let mean_distance = if edges == 0 {
        0.0
    } else {
        (total / edges as f64) as f32
    };
    TurnStats {
        mean_distance,
        edge_count: edges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::l2_distance_squared;

    fn grid_corpus(side: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(side * side * 2);
        for x in 0..side {
            for y in 0..side {
                out.push(x as f32);
                out.push(y as f32);
            }
        }
        out
    }

    #[test]
    fn produced_graph_honors_the_contract() {
        let vectors = grid_corpus(8); // 64 points
        let builder = NNDescent {
            max_degree: 6,
            turns: 4,
            seed: Some(3),
        };
        let graph = builder.build(&vectors, 2, l2_distance_squared).unwrap();

        assert_eq!(graph.neighbors.len(), 64);
        for (u, list) in graph.neighbors.iter().enumerate() {
            assert!(list.len() <= 6, "degree bound violated on {u}");
            assert!(!list.contains(&(u as InnerId)), "self-loop on {u}");
            let mut sorted = list.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), list.len(), "duplicate neighbor on {u}");
            for &v in list {
                assert!((v as usize) < 64, "neighbor {v} out of range");
            }
        }
    }

    #[test]
    fn configured_turn_count_is_honored() {
        let vectors = grid_corpus(4);
        let builder = NNDescent {
            max_degree: 4,
            turns: 3,
            seed: Some(1),
        };
        let graph = builder.build(&vectors, 2, l2_distance_squared).unwrap();
        assert_eq!(graph.stats.per_turn.len(), 3);
    }

    #[test]
    fn refinement_tightens_the_graph() {
        let vectors = grid_corpus(10); // 100 points
        let builder = NNDescent {
            max_degree: 8,
            turns: 5,
            seed: Some(9),
        };
        let graph = builder.build(&vectors, 2, l2_distance_squared).unwrap();
        assert!(
            graph.stats.after_prune.mean_distance < graph.stats.after_init.mean_distance,
            "final prune must be strictly tighter than random init"
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(NNDescent::default().build(&[1.0, 2.0, 3.0], 2, l2_distance_squared).is_err());
        let zero_turns = NNDescent {
            turns: 0,
            ..NNDescent::default()
        };
        assert!(zero_turns.build(&[1.0, 2.0], 2, l2_distance_squared).is_err());
    }

    #[test]
    fn empty_corpus_builds_an_empty_graph() {
        let graph = NNDescent::default().build(&[], 2, l2_distance_squared).unwrap();
        assert!(graph.neighbors.is_empty());
        assert_eq!(graph.stats.after_prune.edge_count, 0);
    }
}
