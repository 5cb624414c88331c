//! Binary (de)serialization of the whole index.
//!
//! Single-stream format, little-endian throughout:
//!
//! ```text
//! magic "CRN1" | version u32
//! use_reorder u8 | dim u64 | metric u32 | max_level u64
//! entry_point u64 | ef_construct u64
//! label map: count u64, then (label u64, inner_id u64) per entry
//! base codes blob (store-defined)
//! base adjacency
//! precise codes blob (only when use_reorder)
//! route adjacencies, layers 1..max_level in order
//! ```
//!
//! Serializing a quiesced index and deserializing the stream restores an
//! index with identical observable behavior. Truncated input, unknown magic
//! or version, and internally inconsistent payloads all surface
//! [`IndexError::Deserialization`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::distance::DistanceMetric;
use crate::error::{IndexError, Result};
use crate::hier::adjacency::AdjacencyStore;
use crate::hier::locks::{LabelLocks, PointLocks};
use crate::hier::visited::VisitedPool;
use crate::hier::{HierIndex, HierParams, LabelMap};
use crate::store::VectorStore;
use crate::Label;

const MAGIC: [u8; 4] = *b"CRN1";
const FORMAT_VERSION: u32 = 1;

impl<S: VectorStore> HierIndex<S> {
    /// Write the full index to `writer`.
    ///
    /// The index must be quiesced: no insert may be in flight.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&MAGIC)?;
        write_u32(writer, FORMAT_VERSION)?;

        write_u8(writer, u8::from(self.params.use_reorder))?;
        write_u64(writer, self.dim as u64)?;
        write_u32(writer, self.params.metric.wire_id())?;
        write_u64(writer, self.max_level.load(Ordering::Acquire) as u64)?;
        write_u64(writer, self.entry_point.load(Ordering::Acquire))?;
        write_u64(writer, self.params.ef_construct as u64)?;

        {
            let labels = self.labels.read();
            write_u64(writer, labels.by_id.len() as u64)?;
            for (inner, &label) in labels.by_id.iter().enumerate() {
                write_u64(writer, label)?;
                write_u64(writer, inner as u64)?;
            }
        }

        self.store.read().serialize(writer)?;
        self.base.serialize(writer)?;
        if let Some(precise) = &self.precise {
            precise.read().serialize(writer)?;
        }
        for graph in self.route_snapshot().iter() {
            graph.serialize(writer)?;
        }
        Ok(())
    }

    /// Restore an index previously written by [`HierIndex::serialize`].
    ///
    /// `params` supplies what the stream does not carry (degree bound,
    /// capacity, seed); fields present in the stream win over `params`.
    pub fn deserialize<R: Read>(reader: &mut R, params: HierParams) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(reader, &mut magic)?;
        if magic != MAGIC {
            return Err(IndexError::Deserialization("bad magic bytes".into()));
        }
        let version = read_u32(reader)?;
        if version != FORMAT_VERSION {
            return Err(IndexError::Deserialization(format!(
                "unsupported format version {version}"
            )));
        }

        let use_reorder = match read_u8(reader)? {
            0 => false,
            1 => true,
            other => {
                return Err(IndexError::Deserialization(format!(
                    "bad use_reorder flag {other}"
                )))
            }
        };
        let dim = read_u64(reader)? as usize;
        if dim == 0 {
            return Err(IndexError::Deserialization("zero dimension".into()));
        }
        let metric = DistanceMetric::from_wire_id(read_u32(reader)?)
            .ok_or_else(|| IndexError::Deserialization("unknown metric id".into()))?;
        let max_level = read_u64(reader)? as usize;
        let entry_point = read_u64(reader)?;
        let ef_construct = read_u64(reader)? as usize;
        if ef_construct == 0 {
            return Err(IndexError::Deserialization("zero ef_construct".into()));
        }

        let n = read_u64(reader)? as usize;
        let mut map = HashMap::with_capacity(n);
        let mut by_id: Vec<Option<Label>> = vec![None; n];
        for _ in 0..n {
            let label = read_u64(reader)?;
            let inner = read_u64(reader)?;
            if inner >= n as u64 {
                return Err(IndexError::Deserialization(format!(
                    "inner id {inner} out of range {n}"
                )));
            }
            if map.insert(label, inner).is_some() || by_id[inner as usize].replace(label).is_some() {
                return Err(IndexError::Deserialization(
                    "label map is not a bijection".into(),
                ));
            }
        }
        let by_id: Vec<Label> = by_id
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| IndexError::Deserialization("label map is not a bijection".into()))?;

        if n > 0 && entry_point >= n as u64 {
            return Err(IndexError::Deserialization(format!(
                "entry point {entry_point} out of range {n}"
            )));
        }

        let params = HierParams {
            metric,
            ef_construct,
            use_reorder,
            capacity: params.capacity.max(n),
            ..params
        };
        if params.max_degree < 2 {
            return Err(IndexError::InvalidParameter(
                "max_degree must be at least 2".into(),
            ));
        }
        let capacity = params.capacity as u64;
        let max_degree = params.max_degree as u32;
        let route_degree = ((params.max_degree / 2).max(1)) as u32;

        let store = S::deserialize(reader)?;
        if store.dim() != dim {
            return Err(IndexError::Deserialization(format!(
                "codes dimension {} does not match index dimension {dim}",
                store.dim()
            )));
        }
        if store.count() != n as u64 {
            return Err(IndexError::Deserialization(format!(
                "codes hold {} vectors for {n} labels",
                store.count()
            )));
        }

        let base = AdjacencyStore::deserialize_dense(reader, max_degree, capacity)?;
        if base.total_count() != n as u64 {
            return Err(IndexError::Deserialization(format!(
                "base layer counts {} of {n} elements",
                base.total_count()
            )));
        }

        let precise = if use_reorder {
            let precise = S::deserialize(reader)?;
            if precise.dim() != dim || precise.count() != n as u64 {
                return Err(IndexError::Deserialization(
                    "precise codes do not match the index".into(),
                ));
            }
            Some(RwLock::new(precise))
        } else {
            None
        };

        let mut route = Vec::with_capacity(max_level.saturating_sub(1));
        for _ in 1..max_level.max(1) {
            route.push(Arc::new(AdjacencyStore::deserialize_sparse(
                reader,
                route_degree,
                capacity,
            )?));
        }

        let mult = 1.0 / (params.max_degree as f64).ln();
        Ok(HierIndex {
            base,
            route: RwLock::new(route),
            labels: RwLock::new(LabelMap { map, by_id }),
            point_locks: PointLocks::new(capacity),
            label_locks: LabelLocks::new(),
            visited: VisitedPool::new(capacity),
            registration: Mutex::new(()),
            global: Mutex::new(()),
            max_level: AtomicUsize::new(max_level),
            entry_point: AtomicU64::new(entry_point),
            next_id: AtomicU64::new(n as u64),
            store: RwLock::new(store),
            precise,
            dim,
            mult,
            params,
        })
    }
}

fn read_exact(reader: &mut dyn Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IndexError::Deserialization("stream truncated".into())
        } else {
            IndexError::Io(e)
        }
    })
}

pub(crate) fn write_u8(writer: &mut dyn Write, v: u8) -> Result<()> {
    writer.write_all(&[v])?;
    Ok(())
}

pub(crate) fn read_u8(reader: &mut dyn Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(reader, &mut buf)?;
    Ok(buf[0])
}

pub(crate) fn write_u32(writer: &mut dyn Write, v: u32) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_u32(reader: &mut dyn Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn write_u64(writer: &mut dyn Write, v: u64) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_u64(reader: &mut dyn Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn write_f32_slice(writer: &mut dyn Write, values: &[f32]) -> Result<()> {
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

pub(crate) fn read_f32_vec(reader: &mut dyn Read, len: usize) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 4];
    for _ in 0..len {
        read_exact(reader, &mut buf)?;
        out.push(f32::from_le_bytes(buf));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_helpers_roundtrip() {
        let mut buf = Vec::new();
        write_u8(&mut buf, 7).unwrap();
        write_u32(&mut buf, 0xDEAD_BEEF).unwrap();
        write_u64(&mut buf, u64::MAX - 1).unwrap();
        write_f32_slice(&mut buf, &[1.5, -2.25]).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(read_u8(&mut r).unwrap(), 7);
        assert_eq!(read_u32(&mut r).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_u64(&mut r).unwrap(), u64::MAX - 1);
        assert_eq!(read_f32_vec(&mut r, 2).unwrap(), vec![1.5, -2.25]);
    }

    #[test]
    fn truncation_is_a_deserialization_error() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 42).unwrap();
        buf.truncate(3);
        let err = read_u64(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, IndexError::Deserialization(_)));
    }
}
