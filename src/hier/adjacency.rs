//! Per-layer adjacency storage.
//!
//! The base layer is dense: a slot per inner id, pre-sized to the planned
//! capacity. Route layers are sparse: most ids never reach them, so lists
//! live in a map. Writes replace whole lists; reads copy the current list
//! out under a shared lock, so a reader always sees a list that was complete
//! at some point in time and never a torn one.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{IndexError, Result};
use crate::hier::persist::{read_u32, read_u64, write_u32, write_u64};
use crate::InnerId;

#[derive(Debug)]
enum Lists {
    Dense(Box<[RwLock<Vec<InnerId>>]>),
    Sparse(RwLock<HashMap<InnerId, Vec<InnerId>>>),
}

#[derive(Debug)]
pub(crate) struct AdjacencyStore {
    lists: Lists,
    total_count: AtomicU64,
    max_degree: u32,
    max_capacity: u64,
}

impl AdjacencyStore {
    /// Dense store for the base layer, one slot per id up to `capacity`.
    pub(crate) fn dense(max_degree: u32, capacity: u64) -> Self {
        let slots = (0..capacity)
            .map(|_| RwLock::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            lists: Lists::Dense(slots),
            total_count: AtomicU64::new(0),
            max_degree,
            max_capacity: capacity,
        }
    }

    /// Sparse store for a route layer.
    pub(crate) fn sparse(max_degree: u32, capacity: u64) -> Self {
        Self {
            lists: Lists::Sparse(RwLock::new(HashMap::new())),
            total_count: AtomicU64::new(0),
            max_degree,
            max_capacity: capacity,
        }
    }

    /// Replace the adjacency of `u` by `list`.
    ///
    /// The caller is responsible for holding the per-point lock of `u` and
    /// for having pruned `list` to at most [`Self::maximum_degree`].
    pub(crate) fn insert_neighbors(&self, u: InnerId, list: Vec<InnerId>) {
        match &self.lists {
            Lists::Dense(slots) => {
                *slots[u as usize].write() = list;
            }
            Lists::Sparse(map) => {
                map.write().insert(u, list);
            }
        }
    }

    /// Copy the current adjacency of `u` into `out` (cleared first).
    ///
    /// An id with no list on this layer yields an empty `out`.
    pub(crate) fn get_neighbors(&self, u: InnerId, out: &mut Vec<InnerId>) {
        out.clear();
        match &self.lists {
            Lists::Dense(slots) => {
                out.extend_from_slice(&slots[u as usize].read());
            }
            Lists::Sparse(map) => {
                if let Some(list) = map.read().get(&u) {
                    out.extend_from_slice(list);
                }
            }
        }
    }

    /// Number of ids present on this layer.
    pub(crate) fn total_count(&self) -> u64 {
        self.total_count.load(Ordering::Acquire)
    }

    pub(crate) fn increase_total_count(&self, n: u64) {
        self.total_count.fetch_add(n, Ordering::AcqRel);
    }

    /// Configured degree bound for this layer.
    pub(crate) fn maximum_degree(&self) -> u32 {
        self.max_degree
    }

    /// Planned capacity (sizes the visited pool and the lock table).
    pub(crate) fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Visit every stored list in ascending id order.
    ///
    /// Dense layers iterate `0..total_count`; sparse layers iterate present
    /// ids. Holds each slot's shared lock only for the duration of the
    /// callback on that list.
    pub(crate) fn for_each_list(&self, mut f: impl FnMut(InnerId, &[InnerId])) {
        match &self.lists {
            Lists::Dense(slots) => {
                for id in 0..self.total_count() {
                    f(id, &slots[id as usize].read());
                }
            }
            Lists::Sparse(map) => {
                let map = map.read();
                let mut ids: Vec<InnerId> = map.keys().copied().collect();
                ids.sort_unstable();
                for id in ids {
                    f(id, &map[&id]);
                }
            }
        }
    }

    pub(crate) fn serialize(&self, writer: &mut dyn Write) -> Result<()> {
        write_u64(writer, self.total_count())?;
        match &self.lists {
            Lists::Dense(slots) => {
                for id in 0..self.total_count() {
                    let list = slots[id as usize].read();
                    write_u32(writer, list.len() as u32)?;
                    for &v in list.iter() {
                        write_u64(writer, v)?;
                    }
                }
            }
            Lists::Sparse(map) => {
                let map = map.read();
                let mut ids: Vec<InnerId> = map.keys().copied().collect();
                ids.sort_unstable();
                write_u64(writer, ids.len() as u64)?;
                for id in ids {
                    let list = &map[&id];
                    write_u64(writer, id)?;
                    write_u32(writer, list.len() as u32)?;
                    for &v in list {
                        write_u64(writer, v)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn deserialize_dense(
        reader: &mut dyn Read,
        max_degree: u32,
        capacity: u64,
    ) -> Result<Self> {
        let total = read_u64(reader)?;
        if total > capacity {
            return Err(IndexError::Deserialization(format!(
                "base layer holds {total} ids but capacity is {capacity}"
            )));
        }
        let store = Self::dense(max_degree, capacity);
        for id in 0..total {
            let list = read_list(reader, max_degree, capacity)?;
            store.insert_neighbors(id, list);
        }
        store.total_count.store(total, Ordering::Release);
        Ok(store)
    }

    pub(crate) fn deserialize_sparse(
        reader: &mut dyn Read,
        max_degree: u32,
        capacity: u64,
    ) -> Result<Self> {
        let total = read_u64(reader)?;
        let entries = read_u64(reader)?;
        if entries != total {
            return Err(IndexError::Deserialization(format!(
                "route layer count {total} does not match {entries} stored lists"
            )));
        }
        let store = Self::sparse(max_degree, capacity);
        for _ in 0..entries {
            let id = read_u64(reader)?;
            if id >= capacity {
                return Err(IndexError::Deserialization(format!(
                    "id {id} beyond capacity {capacity}"
                )));
            }
            let list = read_list(reader, max_degree, capacity)?;
            store.insert_neighbors(id, list);
        }
        store.total_count.store(total, Ordering::Release);
        Ok(store)
    }
}

fn read_list(reader: &mut dyn Read, max_degree: u32, capacity: u64) -> Result<Vec<InnerId>> {
    let len = read_u32(reader)?;
    if len > max_degree {
        return Err(IndexError::Deserialization(format!(
            "adjacency list of length {len} exceeds maximum degree {max_degree}"
        )));
    }
    let mut list = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let v = read_u64(reader)?;
        if v >= capacity {
            return Err(IndexError::Deserialization(format!(
                "neighbor id {v} beyond capacity {capacity}"
            )));
        }
        list.push(v);
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_replace_and_read() {
        let store = AdjacencyStore::dense(4, 8);
        let mut out = Vec::new();

        store.get_neighbors(3, &mut out);
        assert!(out.is_empty());

        store.insert_neighbors(3, vec![1, 2]);
        store.get_neighbors(3, &mut out);
        assert_eq!(out, vec![1, 2]);

        store.insert_neighbors(3, vec![5]);
        store.get_neighbors(3, &mut out);
        assert_eq!(out, vec![5]);
    }

    #[test]
    fn sparse_absent_is_empty() {
        let store = AdjacencyStore::sparse(4, 8);
        let mut out = vec![42];
        store.get_neighbors(7, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn counts_accumulate() {
        let store = AdjacencyStore::sparse(4, 8);
        assert_eq!(store.total_count(), 0);
        store.increase_total_count(1);
        store.increase_total_count(2);
        assert_eq!(store.total_count(), 3);
    }

    #[test]
    fn dense_stream_roundtrip() {
        let store = AdjacencyStore::dense(4, 8);
        store.insert_neighbors(0, vec![1]);
        store.insert_neighbors(1, vec![0, 2]);
        store.insert_neighbors(2, vec![]);
        store.increase_total_count(3);

        let mut buf = Vec::new();
        store.serialize(&mut buf).unwrap();
        let restored = AdjacencyStore::deserialize_dense(&mut buf.as_slice(), 4, 8).unwrap();

        assert_eq!(restored.total_count(), 3);
        let mut out = Vec::new();
        restored.get_neighbors(1, &mut out);
        assert_eq!(out, vec![0, 2]);
    }

    #[test]
    fn sparse_stream_roundtrip() {
        let store = AdjacencyStore::sparse(2, 16);
        store.insert_neighbors(9, vec![4]);
        store.insert_neighbors(4, vec![9, 11]);
        store.increase_total_count(2);

        let mut buf = Vec::new();
        store.serialize(&mut buf).unwrap();
        let restored = AdjacencyStore::deserialize_sparse(&mut buf.as_slice(), 2, 16).unwrap();

        let mut out = Vec::new();
        restored.get_neighbors(9, &mut out);
        assert_eq!(out, vec![4]);
        restored.get_neighbors(4, &mut out);
        assert_eq!(out, vec![9, 11]);
    }

    #[test]
    fn corrupt_degree_is_rejected() {
        let store = AdjacencyStore::dense(2, 8);
        store.insert_neighbors(0, vec![1, 2, 3]); // over-long on purpose
        store.increase_total_count(1);

        let mut buf = Vec::new();
        store.serialize(&mut buf).unwrap();
        assert!(AdjacencyStore::deserialize_dense(&mut buf.as_slice(), 2, 8).is_err());
    }
}
