//! Mutual connection of a new element into one layer.

use std::collections::BinaryHeap;

use smallvec::SmallVec;

use crate::error::{IndexError, Result};
use crate::hier::adjacency::AdjacencyStore;
use crate::hier::locks::PointLocks;
use crate::hier::search::Candidate;
use crate::hier::select::select_edges_by_heuristic;
use crate::store::VectorStore;
use crate::InnerId;

/// Wire `u` into `graph`: prune `candidates` to the layer's degree bound,
/// write them as `u`'s outbound list, then add `u` to each selected
/// neighbor's list, re-pruning neighbors that are already full.
///
/// In insert mode (`update == false`) the element is not yet published, so
/// only the neighbors' locks are taken; in update mode `u`'s own lock is
/// acquired around the write of its list. Each neighbor lock is taken one at
/// a time with nothing else held, so no deadlock chain can form.
///
/// Returns the closest selected neighbor, the entry point for the next layer
/// down.
pub(crate) fn connect_new_element<S: VectorStore>(
    store: &S,
    graph: &AdjacencyStore,
    locks: &PointLocks,
    u: InnerId,
    candidates: &mut BinaryHeap<Candidate>,
    update: bool,
) -> Result<InnerId> {
    let max_size = graph.maximum_degree() as usize;

    select_edges_by_heuristic(store, candidates, max_size);
    if candidates.len() > max_size {
        return Err(IndexError::InvariantViolation(format!(
            "edge selection kept {} candidates, bound is {max_size}",
            candidates.len()
        )));
    }

    // Drain tip-down (furthest first); the last id out is the closest.
    let mut selected: SmallVec<[InnerId; 64]> = SmallVec::new();
    while let Some(c) = candidates.pop() {
        selected.push(c.id);
    }
    let next_entry_point = *selected.last().ok_or_else(|| {
        IndexError::InvariantViolation("connecting an element with no candidates".into())
    })?;

    {
        let guard = update.then(|| locks.lock(u));
        graph.insert_neighbors(u, selected.to_vec());
        drop(guard);
    }

    let mut neighbors: Vec<InnerId> = Vec::with_capacity(max_size + 1);
    for &v in &selected {
        if v == u {
            return Err(IndexError::InvariantViolation(format!(
                "element {u} selected itself as a neighbor"
            )));
        }

        let _guard = locks.lock(v);
        graph.get_neighbors(v, &mut neighbors);

        if neighbors.len() > max_size {
            return Err(IndexError::InvariantViolation(format!(
                "adjacency of {v} holds {} ids, bound is {max_size}",
                neighbors.len()
            )));
        }

        if update && neighbors.contains(&u) {
            continue;
        }

        if neighbors.len() < max_size {
            neighbors.push(u);
            graph.insert_neighbors(v, neighbors.clone());
        } else {
            // Full list: let the heuristic decide whether `u` displaces one
            // of the existing neighbors of `v`.
            let mut pool: BinaryHeap<Candidate> = BinaryHeap::with_capacity(max_size + 1);
            pool.push(Candidate::new(store.pairwise(u, v), u));
            for &w in &neighbors {
                pool.push(Candidate::new(store.pairwise(w, v), w));
            }
            select_edges_by_heuristic(store, &mut pool, max_size);
            if pool.len() > max_size {
                return Err(IndexError::InvariantViolation(format!(
                    "edge selection kept {} candidates, bound is {max_size}",
                    pool.len()
                )));
            }
            let list: Vec<InnerId> = std::mem::take(&mut pool).into_iter().map(|c| c.id).collect();
            graph.insert_neighbors(v, list);
        }
    }

    Ok(next_entry_point)
}
