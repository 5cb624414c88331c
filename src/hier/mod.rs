//! Hierarchical proximity-graph index.
//!
//! A multi-layer navigable graph: layer 0 (the "base") holds every element
//! with degree bound `max_degree`; each layer above is a sparse routing
//! graph with half that bound. Searches descend from a single entry point at
//! the top layer, narrowing with `ef = 1` per routing layer, then sweep the
//! base layer with the configured `ef`.
//!
//! Construction is incremental and thread-safe: batches are data-parallel
//! across elements, adjacency writes go through per-point locks, and the
//! only global serialization points are the label registration step and the
//! (rare, bounded) top-layer promotion.

pub(crate) mod adjacency;
pub(crate) mod connect;
pub(crate) mod locks;
pub(crate) mod persist;
pub(crate) mod search;
pub(crate) mod select;
pub(crate) mod visited;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};
use crate::filter::IdFilter;
use crate::hier::adjacency::AdjacencyStore;
use crate::hier::connect::connect_new_element;
use crate::hier::locks::{LabelLocks, PointLocks};
use crate::hier::search::{search_layer, Candidate};
use crate::hier::visited::VisitedPool;
use crate::store::{FlatStore, VectorStore};
use crate::{InnerId, Label};

/// Levels are geometrically distributed; anything this high is noise.
const MAX_ASSIGNED_LEVEL: usize = 16;

/// Construction-time parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierParams {
    /// Distance metric.
    pub metric: DistanceMetric,
    /// Degree bound of the base layer; routing layers use half.
    pub max_degree: usize,
    /// Result-heap bound during construction searches.
    pub ef_construct: usize,
    /// Planned maximum element count. Sizes the base layer, the lock table
    /// and the visited buffers; inserts beyond it fail per element.
    pub capacity: usize,
    /// Keep a second high-precision code store and re-rank with it.
    pub use_reorder: bool,
    /// Fixed seed for level assignment. `None` draws from the thread RNG.
    pub seed: Option<u64>,
}

impl Default for HierParams {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::L2,
            max_degree: 32,
            ef_construct: 200,
            capacity: 1_000_000,
            use_reorder: false,
            seed: None,
        }
    }
}

/// Per-query parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    /// Result-heap bound during the base-layer sweep. Values below `k` are
    /// raised to `k`.
    pub ef_search: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self { ef_search: 50 }
    }
}

#[derive(Default, Debug)]
struct LabelMap {
    map: HashMap<Label, InnerId>,
    by_id: Vec<Label>,
}

/// Hierarchical ANN index over a [`VectorStore`].
#[derive(Debug)]
pub struct HierIndex<S: VectorStore = FlatStore> {
    params: HierParams,
    dim: usize,
    mult: f64,

    store: RwLock<S>,
    precise: Option<RwLock<S>>,

    base: AdjacencyStore,
    route: RwLock<Vec<Arc<AdjacencyStore>>>,

    labels: RwLock<LabelMap>,
    point_locks: PointLocks,
    label_locks: LabelLocks,
    visited: VisitedPool,

    /// Serializes id assignment together with the store append, so inner
    /// ids and store rows can never go out of step across batches.
    registration: Mutex<()>,
    /// Covers route-vector extension, `max_level`, and entry publication.
    global: Mutex<()>,

    max_level: AtomicUsize,
    entry_point: AtomicU64,
    next_id: AtomicU64,
}

impl HierIndex<FlatStore> {
    /// Create an index over flat f32 storage.
    pub fn new(dim: usize, params: HierParams) -> Result<Self> {
        let store = FlatStore::new(dim, params.metric);
        let precise = params.use_reorder.then(|| FlatStore::new(dim, params.metric));
        Self::with_stores(store, precise, params)
    }
}

impl<S: VectorStore> HierIndex<S> {
    /// Create an index over caller-supplied stores. `precise` must be given
    /// exactly when `params.use_reorder` is set.
    pub fn with_stores(store: S, precise: Option<S>, params: HierParams) -> Result<Self> {
        let dim = store.dim();
        if dim == 0 {
            return Err(IndexError::InvalidParameter("dimension must be positive".into()));
        }
        if params.max_degree < 2 {
            return Err(IndexError::InvalidParameter(
                "max_degree must be at least 2".into(),
            ));
        }
        if params.ef_construct == 0 {
            return Err(IndexError::InvalidParameter(
                "ef_construct must be at least 1".into(),
            ));
        }
        if params.capacity == 0 {
            return Err(IndexError::InvalidParameter("capacity must be positive".into()));
        }
        if params.use_reorder != precise.is_some() {
            return Err(IndexError::InvalidParameter(
                "use_reorder requires exactly one precise store".into(),
            ));
        }
        if let Some(p) = &precise {
            if p.dim() != dim {
                return Err(IndexError::DimensionMismatch {
                    expected: dim,
                    got: p.dim(),
                });
            }
        }

        let mult = 1.0 / (params.max_degree as f64).ln();
        let base = AdjacencyStore::dense(params.max_degree as u32, params.capacity as u64);
        // The planned capacity of the base layer bounds every id-indexed
        // structure: locks, visited tags, dense slots.
        let capacity = base.max_capacity();
        Ok(Self {
            base,
            route: RwLock::new(Vec::new()),
            labels: RwLock::new(LabelMap::default()),
            point_locks: PointLocks::new(capacity),
            label_locks: LabelLocks::new(),
            visited: VisitedPool::new(capacity),
            registration: Mutex::new(()),
            global: Mutex::new(()),
            max_level: AtomicUsize::new(0),
            entry_point: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            store: RwLock::new(store),
            precise: precise.map(RwLock::new),
            dim,
            mult,
            params,
        })
    }

    /// Number of inserted elements.
    pub fn len(&self) -> usize {
        self.labels.read().by_id.len()
    }

    /// Whether the index holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Construction parameters.
    pub fn params(&self) -> &HierParams {
        &self.params
    }

    /// One past the highest assigned level; 0 while empty.
    pub fn max_level(&self) -> usize {
        self.max_level.load(Ordering::Acquire)
    }

    /// The id every descent starts from, if any element exists.
    pub fn entry_point(&self) -> Option<InnerId> {
        (!self.is_empty()).then(|| self.entry_point.load(Ordering::Acquire))
    }

    /// Inner id of `label`, if inserted.
    pub fn inner_id(&self, label: Label) -> Option<InnerId> {
        self.labels.read().map.get(&label).copied()
    }

    /// Insert a batch of labeled vectors, `labels.len() * dim` floats in
    /// row-major order. Returns the labels that were rejected (duplicate
    /// label, capacity exhausted); the rest of the batch is inserted.
    pub fn insert(&self, labels: &[Label], vectors: &[f32]) -> Result<Vec<Label>> {
        if labels.is_empty() {
            if !vectors.is_empty() {
                return Err(IndexError::InvalidParameter(
                    "vectors supplied without labels".into(),
                ));
            }
            return Ok(Vec::new());
        }
        if vectors.len() % labels.len() != 0 {
            return Err(IndexError::InvalidParameter(format!(
                "{} floats cannot form {} vectors",
                vectors.len(),
                labels.len()
            )));
        }
        let got = vectors.len() / labels.len();
        if got != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got,
            });
        }

        let registration = self.registration.lock();

        let mut failed = Vec::new();
        let mut accepted: Vec<usize> = Vec::with_capacity(labels.len());
        let first_id;
        {
            let mut label_map = self.labels.write();
            let mut batch_seen = HashSet::new();
            for (i, &label) in labels.iter().enumerate() {
                if label_map.map.contains_key(&label) || !batch_seen.insert(label) {
                    failed.push(label);
                } else {
                    accepted.push(i);
                }
            }

            let cur = self.next_id.load(Ordering::Acquire);
            let room = (self.params.capacity as u64).saturating_sub(cur) as usize;
            if accepted.len() > room {
                tracing::warn!(
                    capacity = self.params.capacity,
                    rejected = accepted.len() - room,
                    "insert batch exceeds planned capacity"
                );
                for &i in &accepted[room..] {
                    failed.push(labels[i]);
                }
                accepted.truncate(room);
            }

            first_id = self.next_id.fetch_add(accepted.len() as u64, Ordering::AcqRel);
            for (offset, &i) in accepted.iter().enumerate() {
                label_map.map.insert(labels[i], first_id + offset as u64);
                label_map.by_id.push(labels[i]);
            }
        }

        if accepted.is_empty() {
            return Ok(failed);
        }

        let mut accepted_vectors = Vec::with_capacity(accepted.len() * self.dim);
        let mut accepted_labels = Vec::with_capacity(accepted.len());
        for &i in &accepted {
            accepted_vectors.extend_from_slice(&vectors[i * self.dim..(i + 1) * self.dim]);
            accepted_labels.push(labels[i]);
        }

        {
            let mut store = self.store.write();
            store.train(&accepted_vectors, accepted.len())?;
            store.batch_insert(&accepted_vectors, accepted.len(), &accepted_labels)?;
        }
        if let Some(precise) = &self.precise {
            let mut precise = precise.write();
            precise.train(&accepted_vectors, accepted.len())?;
            precise.batch_insert(&accepted_vectors, accepted.len(), &accepted_labels)?;
        }
        drop(registration);

        tracing::debug!(batch = labels.len(), accepted = accepted.len(), "inserting batch");

        let store = self.store.read();
        (0..accepted.len()).into_par_iter().try_for_each(|offset| {
            let inner_id = first_id + offset as u64;
            let vector = &accepted_vectors[offset * self.dim..(offset + 1) * self.dim];
            let level = self.sample_level(inner_id);
            self.insert_one(&store, accepted_labels[offset], inner_id, vector, level)
        })?;

        Ok(failed)
    }

    /// Bulk-build alias for [`HierIndex::insert`].
    pub fn build(&self, labels: &[Label], vectors: &[f32]) -> Result<Vec<Label>> {
        self.insert(labels, vectors)
    }

    /// k-nearest-neighbor query. Returns up to `k` `(label, distance)` pairs
    /// in ascending distance; empty on an empty index.
    pub fn knn_search(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
        filter: Option<&dyn IdFilter>,
    ) -> Result<Vec<(Label, f32)>> {
        if k == 0 {
            return Err(IndexError::InvalidParameter("k must be at least 1".into()));
        }
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let store = self.store.read();
        let computer = store.make_computer(query)?;
        let route = self.route_snapshot();
        let mut ep = self.entry_point.load(Ordering::Acquire);

        for layer in (1..=route.len()).rev() {
            let result = search_layer(&*store, &computer, &route[layer - 1], &self.visited, ep, 1, filter);
            if let Some(best) = result.peek() {
                ep = best.id;
            }
        }

        let ef = params.ef_search.max(k);
        let mut result = search_layer(&*store, &computer, &self.base, &self.visited, ep, ef, filter);

        let ranked = if let Some(precise) = &self.precise {
            let ids: Vec<InnerId> = result.iter().map(|c| c.id).collect();
            let precise = precise.read();
            let precise_computer = precise.make_computer(query)?;
            let mut distances = vec![0.0f32; ids.len()];
            precise.query(&precise_computer, &ids, &mut distances);

            let mut reranked: Vec<Candidate> = ids
                .iter()
                .zip(distances.iter())
                .map(|(&id, &d)| Candidate::new(d, id))
                .collect();
            reranked.sort_unstable();
            reranked.truncate(k);
            reranked
        } else {
            while result.len() > k {
                result.pop();
            }
            result.into_sorted_vec()
        };

        let labels = self.labels.read();
        Ok(ranked
            .iter()
            .map(|c| (labels.by_id[c.id as usize], c.distance))
            .collect())
    }

    /// Validate degree bounds, duplicate/self-loop freedom, and the label
    /// bijection across every layer.
    pub fn check_integrity(&self) -> Result<()> {
        let n;
        {
            let labels = self.labels.read();
            n = labels.by_id.len();
            if labels.map.len() != n {
                return Err(IndexError::InvariantViolation(format!(
                    "label map holds {} entries for {} ids",
                    labels.map.len(),
                    n
                )));
            }
            for (id, label) in labels.by_id.iter().enumerate() {
                if labels.map.get(label).copied() != Some(id as InnerId) {
                    return Err(IndexError::InvariantViolation(format!(
                        "label {label} does not map back to id {id}"
                    )));
                }
            }
        }

        if self.base.total_count() != n as u64 {
            return Err(IndexError::InvariantViolation(format!(
                "base layer counts {} of {} elements",
                self.base.total_count(),
                n
            )));
        }

        check_graph(&self.base, n as u64)?;
        for graph in self.route_snapshot().iter() {
            check_graph(graph, n as u64)?;
        }
        Ok(())
    }

    fn route_snapshot(&self) -> Vec<Arc<AdjacencyStore>> {
        self.route.read().clone()
    }

    fn route_degree(&self) -> u32 {
        (self.params.max_degree / 2).max(1) as u32
    }

    fn sample_level(&self, inner_id: InnerId) -> usize {
        let unit: f64 = match self.params.seed {
            Some(seed) => {
                StdRng::seed_from_u64(seed ^ inner_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)).random()
            }
            None => rand::rng().random(),
        };
        // `unit` is in [0, 1); flip it so the log argument stays in (0, 1].
        ((-(1.0 - unit).ln() * self.mult).floor() as usize).min(MAX_ASSIGNED_LEVEL)
    }

    /// Insert one registered element into the graph at `level`.
    fn insert_one(
        &self,
        store: &S,
        label: Label,
        inner_id: InnerId,
        vector: &[f32],
        level: usize,
    ) -> Result<()> {
        let mut promoted = false;
        {
            let _global = self.global.lock();
            let max_level = self.max_level.load(Ordering::Acquire);
            if level + 1 > max_level || self.base.total_count() == 0 {
                let mut route = self.route.write();
                while route.len() < level {
                    route.push(Arc::new(AdjacencyStore::sparse(
                        self.route_degree(),
                        self.params.capacity as u64,
                    )));
                }
                drop(route);
                self.max_level
                    .store((level + 1).max(max_level), Ordering::Release);
                promoted = true;
            }
        }

        {
            let _label_guard = self.label_locks.lock(label);
            let computer = store.make_computer(vector)?;
            let route = self.route_snapshot();
            let mut ep = self.entry_point.load(Ordering::Acquire);

            // Refine the entry point down to the element's top layer.
            for layer in ((level + 1)..=route.len()).rev() {
                let result =
                    search_layer(store, &computer, &route[layer - 1], &self.visited, ep, 1, None);
                if let Some(best) = result.peek() {
                    ep = best.id;
                }
            }

            // Connect on every layer the element lives on, feeding each
            // layer's closest selected neighbor to the one below.
            for layer in (0..=level).rev() {
                let graph: &AdjacencyStore = if layer == 0 {
                    &self.base
                } else {
                    &route[layer - 1]
                };
                if graph.total_count() == 0 {
                    graph.insert_neighbors(inner_id, Vec::new());
                } else {
                    let mut result = search_layer(
                        store,
                        &computer,
                        graph,
                        &self.visited,
                        ep,
                        self.params.ef_construct,
                        None,
                    );
                    ep = connect_new_element(
                        store,
                        graph,
                        &self.point_locks,
                        inner_id,
                        &mut result,
                        false,
                    )?;
                }
                graph.increase_total_count(1);
            }
        }

        if promoted {
            let _global = self.global.lock();
            // A taller concurrent promotion wins; never demote the top.
            if self.max_level.load(Ordering::Acquire) == level + 1 {
                self.entry_point.store(inner_id, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Register and insert a single element at a fixed level.
    #[cfg(test)]
    pub(crate) fn insert_single_at_level(
        &self,
        label: Label,
        vector: &[f32],
        level: usize,
    ) -> Result<()> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        let registration = self.registration.lock();
        let inner_id;
        {
            let mut label_map = self.labels.write();
            if label_map.map.contains_key(&label) {
                return Err(IndexError::InvalidParameter(format!(
                    "label {label} already inserted"
                )));
            }
            inner_id = self.next_id.fetch_add(1, Ordering::AcqRel);
            label_map.map.insert(label, inner_id);
            label_map.by_id.push(label);
        }
        {
            let mut store = self.store.write();
            store.train(vector, 1)?;
            store.batch_insert(vector, 1, &[label])?;
        }
        if let Some(precise) = &self.precise {
            let mut precise = precise.write();
            precise.train(vector, 1)?;
            precise.batch_insert(vector, 1, &[label])?;
        }
        drop(registration);

        let store = self.store.read();
        self.insert_one(&store, label, inner_id, vector, level)
    }
}

fn check_graph(graph: &AdjacencyStore, n: u64) -> Result<()> {
    let bound = graph.maximum_degree() as usize;
    let mut problem: Option<String> = None;
    graph.for_each_list(|id, list| {
        if problem.is_some() {
            return;
        }
        if list.len() > bound {
            problem = Some(format!("adjacency of {id} has {} ids, bound {bound}", list.len()));
            return;
        }
        let mut seen = HashSet::with_capacity(list.len());
        for &v in list {
            if v == id {
                problem = Some(format!("self-loop on {id}"));
                return;
            }
            if v >= n {
                problem = Some(format!("neighbor {v} of {id} out of range {n}"));
                return;
            }
            if !seen.insert(v) {
                problem = Some(format!("duplicate neighbor {v} of {id}"));
                return;
            }
        }
    });
    problem.map_or(Ok(()), |p| Err(IndexError::InvariantViolation(p)))
}
