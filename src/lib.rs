//! cairn: hierarchical proximity-graph approximate nearest neighbor search.
//!
//! The crate centers on [`HierIndex`], a multi-layer navigable graph in the
//! HNSW family:
//!
//! - **Base layer**: a dense graph holding every element, degree-bounded,
//!   searched greedily with a tunable `ef` (accuracy/latency knob).
//! - **Route layers**: sparse graphs above the base; a search descends them
//!   with `ef = 1` to land near the target before the base sweep.
//! - **Diversity pruning**: edges are selected by the classic heuristic that
//!   keeps a candidate only when the pivot is its closest accepted point,
//!   preserving long-range shortcuts.
//!
//! Construction is incremental and thread-safe: batches are inserted in
//! parallel under per-point adjacency locks. For bulk loads, the
//! [`nndescent`] module builds a base-layer graph in a few joint refinement
//! passes instead of one search per element.
//!
//! Vector storage sits behind the [`VectorStore`] seam so codecs can be
//! swapped at construction; [`FlatStore`] is the plain f32 implementation.
//!
//! # Usage
//!
//! ```rust
//! use cairn::{HierIndex, HierParams, SearchParams};
//!
//! # fn main() -> cairn::Result<()> {
//! let params = HierParams { capacity: 1_000, ..HierParams::default() };
//! let index = HierIndex::new(2, params)?;
//!
//! index.insert(&[0, 1, 2], &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0])?;
//!
//! let hits = index.knn_search(&[0.1, 0.1], 2, &SearchParams::default(), None)?;
//! assert_eq!(hits[0].0, 0);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - Malkov & Yashunin (2016): "Efficient and robust approximate nearest
//!   neighbor search using Hierarchical Navigable Small World graphs"
//! - Dong, Moses & Li (2011): "Efficient k-nearest neighbor graph
//!   construction for generic similarity measures" (NN-descent)

pub mod distance;
pub mod error;
pub mod filter;
pub mod hier;
pub mod nndescent;
pub mod store;

/// Dense internal id, assigned on insertion and used as the adjacency key.
pub type InnerId = u64;

/// External 64-bit label, bijective with inner ids.
pub type Label = u64;

pub use distance::{DistanceFunc, DistanceMetric};
pub use error::{IndexError, Result};
pub use filter::{FnFilter, IdFilter, NoFilter};
pub use hier::{HierIndex, HierParams, SearchParams};
pub use nndescent::{build_base_layer_nn_descent, BaseGraph, NNDescent};
pub use store::{FlatStore, VectorStore};
