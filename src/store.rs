//! Vector storage behind the codec seam.
//!
//! The index never touches raw vectors directly; everything goes through a
//! [`VectorStore`], which answers distance queries from inner ids. The store
//! variant (flat f32, quantized, ...) is chosen at index construction via
//! the type parameter. [`FlatStore`] is the contiguous-f32 reference
//! implementation.
//!
//! Query-side distances go through a prebound [`VectorStore::Computer`]:
//! the store gets one chance per search to transform the query (encode it,
//! precompute norms) before the traversal issues batched lookups.

use std::io::{Read, Write};

use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};
use crate::hier::persist::{read_f32_vec, read_u32, read_u64, write_f32_slice, write_u32, write_u64};
use crate::{InnerId, Label};

/// Capability set a vector codec supplies to the index.
pub trait VectorStore: Send + Sync {
    /// Reusable query-side state that accelerates query-to-id distances.
    type Computer: Send + Sync;

    /// Optional pre-training step for quantizers. No-op for flat storage.
    fn train(&mut self, vectors: &[f32], n: usize) -> Result<()>;

    /// Register `n` vectors under the next `n` inner ids `[count, count + n)`.
    ///
    /// `labels` are provided for codecs that key side tables by external
    /// label; the flat store ignores them.
    fn batch_insert(&mut self, vectors: &[f32], n: usize, labels: &[Label]) -> Result<()>;

    /// Bind a query vector into a reusable distance computer.
    fn make_computer(&self, query: &[f32]) -> Result<Self::Computer>;

    /// Batch distance of the prebound query against `ids`, written to `out`.
    ///
    /// Only the first `ids.len()` entries of `out` are written.
    fn query(&self, computer: &Self::Computer, ids: &[InnerId], out: &mut [f32]);

    /// Distance between two stored vectors.
    fn pairwise(&self, a: InnerId, b: InnerId) -> f32;

    /// Optional cache hint; omitting it must not change correctness.
    #[inline]
    fn prefetch(&self, _id: InnerId) {}

    /// Number of vectors registered so far.
    fn count(&self) -> u64;

    /// Vector dimension.
    fn dim(&self) -> usize;

    /// Write the store's codes blob to `writer`.
    fn serialize(&self, writer: &mut dyn Write) -> Result<()>;

    /// Read a codes blob previously written by [`VectorStore::serialize`].
    fn deserialize(reader: &mut dyn Read) -> Result<Self>
    where
        Self: Sized;
}

/// Contiguous row-major f32 storage with on-the-fly distance computation.
#[derive(Debug, Clone)]
pub struct FlatStore {
    metric: DistanceMetric,
    dim: usize,
    data: Vec<f32>,
}

/// Prebound query state for [`FlatStore`]: an owned copy of the query.
pub struct FlatComputer {
    query: Vec<f32>,
}

impl FlatStore {
    /// Create an empty store for `dim`-dimensional vectors.
    #[must_use]
    pub fn new(dim: usize, metric: DistanceMetric) -> Self {
        Self {
            metric,
            dim,
            data: Vec::new(),
        }
    }

    /// The stored vector for `id`.
    ///
    /// # Panics
    /// Panics if `id` was never inserted.
    #[inline]
    #[must_use]
    pub fn vector(&self, id: InnerId) -> &[f32] {
        let start = id as usize * self.dim;
        &self.data[start..start + self.dim]
    }

    /// The configured metric.
    #[must_use]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }
}

impl VectorStore for FlatStore {
    type Computer = FlatComputer;

    fn train(&mut self, _vectors: &[f32], _n: usize) -> Result<()> {
        Ok(())
    }

    fn batch_insert(&mut self, vectors: &[f32], n: usize, _labels: &[Label]) -> Result<()> {
        if vectors.len() != n * self.dim {
            return Err(IndexError::InvalidParameter(format!(
                "batch of {n} vectors needs {} floats, got {}",
                n * self.dim,
                vectors.len()
            )));
        }
        self.data.extend_from_slice(vectors);
        Ok(())
    }

    fn make_computer(&self, query: &[f32]) -> Result<FlatComputer> {
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }
        Ok(FlatComputer {
            query: query.to_vec(),
        })
    }

    fn query(&self, computer: &FlatComputer, ids: &[InnerId], out: &mut [f32]) {
        let kernel = self.metric.kernel();
        for (slot, &id) in out.iter_mut().zip(ids.iter()) {
            *slot = kernel(&computer.query, self.vector(id));
        }
    }

    #[inline]
    fn pairwise(&self, a: InnerId, b: InnerId) -> f32 {
        self.metric.kernel()(self.vector(a), self.vector(b))
    }

    fn count(&self) -> u64 {
        (self.data.len() / self.dim.max(1)) as u64
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn serialize(&self, writer: &mut dyn Write) -> Result<()> {
        write_u32(writer, self.metric.wire_id())?;
        write_u64(writer, self.dim as u64)?;
        write_u64(writer, self.data.len() as u64)?;
        write_f32_slice(writer, &self.data)?;
        Ok(())
    }

    fn deserialize(reader: &mut dyn Read) -> Result<Self> {
        let metric = DistanceMetric::from_wire_id(read_u32(reader)?)
            .ok_or_else(|| IndexError::Deserialization("unknown metric id".into()))?;
        let dim = read_u64(reader)? as usize;
        if dim == 0 {
            return Err(IndexError::Deserialization("zero dimension".into()));
        }
        let len = read_u64(reader)? as usize;
        if len % dim != 0 {
            return Err(IndexError::Deserialization(
                "codes blob is not a whole number of vectors".into(),
            ));
        }
        let data = read_f32_vec(reader, len)?;
        Ok(Self { metric, dim, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_query() {
        let mut store = FlatStore::new(2, DistanceMetric::L2);
        store
            .batch_insert(&[0.0, 0.0, 3.0, 4.0], 2, &[10, 11])
            .unwrap();
        assert_eq!(store.count(), 2);

        let computer = store.make_computer(&[0.0, 0.0]).unwrap();
        let mut out = [0.0f32; 2];
        store.query(&computer, &[0, 1], &mut out);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 25.0);
        assert_eq!(store.pairwise(0, 1), 25.0);
    }

    #[test]
    fn rejects_bad_batch_size() {
        let mut store = FlatStore::new(3, DistanceMetric::L2);
        assert!(store.batch_insert(&[1.0, 2.0], 1, &[0]).is_err());
    }

    #[test]
    fn rejects_bad_query_dim() {
        let store = FlatStore::new(3, DistanceMetric::L2);
        assert!(matches!(
            store.make_computer(&[1.0]),
            Err(IndexError::DimensionMismatch { expected: 3, got: 1 })
        ));
    }

    #[test]
    fn codes_blob_roundtrip() {
        let mut store = FlatStore::new(2, DistanceMetric::Cosine);
        store
            .batch_insert(&[1.0, 0.0, 0.0, 1.0], 2, &[0, 1])
            .unwrap();

        let mut buf = Vec::new();
        store.serialize(&mut buf).unwrap();
        let restored = FlatStore::deserialize(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.count(), 2);
        assert_eq!(restored.vector(1), &[0.0, 1.0]);
        assert_eq!(restored.metric(), DistanceMetric::Cosine);
    }
}
