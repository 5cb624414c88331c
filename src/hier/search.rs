//! Greedy best-first layer search with a bounded result heap.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use smallvec::SmallVec;

use crate::filter::IdFilter;
use crate::hier::adjacency::AdjacencyStore;
use crate::hier::visited::VisitedPool;
use crate::store::VectorStore;
use crate::InnerId;

/// Scored node during search. Max-heap order: the worst (largest) distance
/// surfaces at the top, which is what the bounded result heap evicts.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Candidate {
    pub(crate) distance: f32,
    pub(crate) id: InnerId,
}

impl Candidate {
    /// NaN distances compare as `+inf` so they are never preferred and never
    /// poison the heap order.
    #[inline]
    pub(crate) fn new(distance: f32, id: InnerId) -> Self {
        let distance = if distance.is_nan() {
            f32::INFINITY
        } else {
            distance
        };
        Self { distance, id }
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance.total_cmp(&other.distance).is_eq() && self.id == other.id
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Best-first search over one layer, returning up to `ef` nearest reachable
/// candidates as a max-heap (worst on top).
///
/// Ids rejected by `filter` never enter the result heap but still have their
/// neighborhoods expanded, so a selective filter cannot strand the traversal.
pub(crate) fn search_layer<S: VectorStore>(
    store: &S,
    computer: &S::Computer,
    graph: &AdjacencyStore,
    pool: &VisitedPool,
    ep: InnerId,
    ef: usize,
    filter: Option<&dyn IdFilter>,
) -> BinaryHeap<Candidate> {
    let mut visited = pool.acquire();

    let mut result: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef + 1);
    let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(ef * 2);

    let allowed = |id: InnerId| filter.map_or(true, |f| f.allows(id));

    visited.insert(ep);
    let mut dist = [0.0f32; 1];
    store.query(computer, &[ep], &mut dist);
    let entry = Candidate::new(dist[0], ep);
    if allowed(ep) {
        result.push(entry);
    }
    frontier.push(Reverse(entry));

    // Worst distance still kept; only meaningful once the result is full.
    let mut upper = if result.len() == ef {
        entry.distance
    } else {
        f32::INFINITY
    };

    let max_degree = graph.maximum_degree() as usize;
    let mut neighbors: Vec<InnerId> = Vec::with_capacity(max_degree);
    let mut to_visit: SmallVec<[InnerId; 64]> = SmallVec::new();
    let mut distances: SmallVec<[f32; 64]> = SmallVec::new();

    while let Some(Reverse(current)) = frontier.pop() {
        if current.distance > upper && result.len() == ef {
            break;
        }

        graph.get_neighbors(current.id, &mut neighbors);
        if let Some(&first) = neighbors.first() {
            store.prefetch(first);
        }

        to_visit.clear();
        for &v in &neighbors {
            if visited.insert(v) {
                to_visit.push(v);
            }
        }

        distances.resize(to_visit.len(), 0.0);
        store.query(computer, &to_visit, &mut distances);

        for (&d, &v) in distances.iter().zip(to_visit.iter()) {
            let candidate = Candidate::new(d, v);
            if result.len() < ef || candidate.distance < upper {
                frontier.push(Reverse(candidate));
                if let Some(Reverse(best)) = frontier.peek() {
                    store.prefetch(best.id);
                }
                if allowed(v) {
                    result.push(candidate);
                    if result.len() > ef {
                        result.pop();
                    }
                }
                if result.len() == ef {
                    if let Some(worst) = result.peek() {
                        upper = worst.distance;
                    }
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::DistanceMetric;
    use crate::filter::FnFilter;
    use crate::store::FlatStore;

    fn line_graph(n: u64) -> (FlatStore, AdjacencyStore) {
        // Points 0..n at x = id on a line, chained bidirectionally.
        let mut store = FlatStore::new(1, DistanceMetric::L2);
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let labels: Vec<u64> = (0..n).collect();
        store.batch_insert(&data, n as usize, &labels).unwrap();

        let graph = AdjacencyStore::dense(4, n);
        for i in 0..n {
            let mut list = Vec::new();
            if i > 0 {
                list.push(i - 1);
            }
            if i + 1 < n {
                list.push(i + 1);
            }
            graph.insert_neighbors(i, list);
        }
        graph.increase_total_count(n);
        (store, graph)
    }

    #[test]
    fn candidate_heap_orders_worst_on_top() {
        let mut heap = BinaryHeap::new();
        heap.push(Candidate::new(0.5, 0));
        heap.push(Candidate::new(0.1, 1));
        heap.push(Candidate::new(0.3, 2));
        assert_eq!(heap.pop().unwrap().distance, 0.5);
        assert_eq!(heap.pop().unwrap().distance, 0.3);
        assert_eq!(heap.pop().unwrap().distance, 0.1);
    }

    #[test]
    fn nan_distance_is_worst() {
        let nan = Candidate::new(f32::NAN, 0);
        assert_eq!(nan.distance, f32::INFINITY);
        assert!(nan > Candidate::new(1e30, 1));
    }

    #[test]
    fn walks_to_the_nearest_point() {
        let (store, graph) = line_graph(32);
        let pool = VisitedPool::new(32);
        let computer = store.make_computer(&[20.2]).unwrap();

        let result = search_layer(&store, &computer, &graph, &pool, 0, 3, None);
        let ids: Vec<InnerId> = result.into_sorted_vec().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![20, 21, 19]);
    }

    #[test]
    fn result_is_bounded_by_ef() {
        let (store, graph) = line_graph(32);
        let pool = VisitedPool::new(32);
        let computer = store.make_computer(&[0.0]).unwrap();

        let result = search_layer(&store, &computer, &graph, &pool, 31, 5, None);
        assert_eq!(result.len(), 5);
    }

    #[test]
    fn filtered_ids_are_expanded_but_not_returned() {
        let (store, graph) = line_graph(32);
        let pool = VisitedPool::new(32);
        let computer = store.make_computer(&[10.0]).unwrap();

        // Reject even ids; the nearest odd ones are still reachable *through*
        // even nodes.
        let filter = FnFilter(|id: InnerId| id % 2 == 1);
        let result = search_layer(&store, &computer, &graph, &pool, 0, 2, Some(&filter));
        let ids: Vec<InnerId> = result.into_sorted_vec().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![9, 11]);
    }

    #[test]
    fn isolated_entry_returns_itself() {
        let (store, _) = line_graph(4);
        let graph = AdjacencyStore::dense(4, 4); // no edges at all
        graph.increase_total_count(4);
        let pool = VisitedPool::new(4);
        let computer = store.make_computer(&[2.0]).unwrap();

        let result = search_layer(&store, &computer, &graph, &pool, 0, 10, None);
        assert_eq!(result.len(), 1);
        assert_eq!(result.peek().unwrap().id, 0);
    }
}
