//! Pooled, epoch-tagged visited buffers.
//!
//! A search needs an O(1) "seen this id?" check over the whole id space.
//! Clearing an `O(capacity)` array per search would dominate small queries,
//! so each buffer carries an epoch counter: bumping the epoch invalidates
//! every tag at once, and a full reset happens only when the counter wraps.
//!
//! Buffers are pooled and handed out behind the pool's own mutex; the guard
//! returns its buffer on drop, so every exit path of a search, including
//! early `?` returns, releases exactly what it acquired.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use crate::InnerId;

#[derive(Debug)]
pub(crate) struct VisitedBuffer {
    tags: Vec<u16>,
    epoch: u16,
}

impl VisitedBuffer {
    fn new(capacity: u64) -> Self {
        Self {
            tags: vec![0; capacity as usize],
            epoch: 0,
        }
    }

    /// Invalidate all tags. Full reset only on epoch wrap.
    fn advance_epoch(&mut self) {
        if self.epoch == u16::MAX {
            self.tags.fill(0);
            self.epoch = 1;
        } else {
            self.epoch += 1;
        }
    }

    /// Tag `id` as visited. Returns `true` if it was not previously tagged.
    #[inline]
    pub(crate) fn insert(&mut self, id: InnerId) -> bool {
        let slot = &mut self.tags[id as usize];
        if *slot == self.epoch {
            false
        } else {
            *slot = self.epoch;
            true
        }
    }
}

#[derive(Debug)]
pub(crate) struct VisitedPool {
    free: Mutex<Vec<VisitedBuffer>>,
    capacity: u64,
}

impl VisitedPool {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Take a buffer out of the pool (allocating if none is free) with a
    /// fresh epoch. No other lock may be held across this call.
    pub(crate) fn acquire(&self) -> VisitedGuard<'_> {
        let mut buffer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| VisitedBuffer::new(self.capacity));
        buffer.advance_epoch();
        VisitedGuard {
            pool: self,
            buffer: Some(buffer),
        }
    }
}

pub(crate) struct VisitedGuard<'p> {
    pool: &'p VisitedPool,
    buffer: Option<VisitedBuffer>,
}

impl Deref for VisitedGuard<'_> {
    type Target = VisitedBuffer;

    fn deref(&self) -> &VisitedBuffer {
        self.buffer.as_ref().unwrap()
    }
}

impl DerefMut for VisitedGuard<'_> {
    fn deref_mut(&mut self) -> &mut VisitedBuffer {
        self.buffer.as_mut().unwrap()
    }
}

impl Drop for VisitedGuard<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.free.lock().push(buffer);
        }
    }
}
