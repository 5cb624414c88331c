//! Diversity-preserving edge selection.
//!
//! Keeping the `M` plain-nearest candidates clusters edges on one side of a
//! point and leaves the graph without long-range shortcuts. The heuristic
//! instead keeps a candidate only when the pivot is its closest accepted
//! point, so the retained edges spread across directions.

use std::collections::BinaryHeap;

use crate::hier::search::Candidate;
use crate::store::VectorStore;

/// Prune `edges` (candidates scored by distance to some pivot) down to at
/// most `max_size` entries, in place.
///
/// Candidates are processed in ascending distance; `c` is kept iff every
/// already-kept `k` satisfies `d(c, k) >= d(c, pivot)`. Already-small inputs
/// are returned unchanged, which makes the procedure idempotent.
pub(crate) fn select_edges_by_heuristic<S: VectorStore>(
    store: &S,
    edges: &mut BinaryHeap<Candidate>,
    max_size: usize,
) {
    if edges.len() < max_size {
        return;
    }

    let closest_first = std::mem::take(edges).into_sorted_vec();
    let mut kept: Vec<Candidate> = Vec::with_capacity(max_size);

    for candidate in closest_first {
        if kept.len() >= max_size {
            break;
        }
        let good = kept.iter().all(|k| {
            let d = store.pairwise(k.id, candidate.id);
            let d = if d.is_nan() { f32::INFINITY } else { d };
            d >= candidate.distance
        });
        if good {
            kept.push(candidate);
        }
    }

    edges.extend(kept);
}
