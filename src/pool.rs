#![forbid(unsafe_code)]

use crate::error::FilterError;
use std::sync::{Arc, Mutex};

/// Buffers handed out per pool growth step.
const POOL_BATCH: usize = 59;
/// Hand-out stride within a batch; coprime with `POOL_BATCH`, so the walk
/// visits every slot while spreading neighbouring buffers apart.
const POOL_STRIDE: usize = 7;

struct PoolInner {
    free: Vec<Vec<u32>>,
}

/// A batching pool of fixed-size word buffers backing materialized blocks.
///
/// One pool is shared by a filter and every shallow copy made from it; the
/// handle is a cheap `Arc` clone. The mutex covers structural hand-out and
/// return only; bit mutation happens through exclusive access to the buffer
/// itself and never takes the lock.
#[derive(Clone)]
pub(crate) struct BlockAllocator {
    word_capacity: usize,
    inner: Arc<Mutex<PoolInner>>,
}

impl BlockAllocator {
    pub(crate) fn new(word_capacity: usize) -> Self {
        debug_assert!(word_capacity > 0);
        Self {
            word_capacity,
            inner: Arc::new(Mutex::new(PoolInner { free: Vec::new() })),
        }
    }

    pub(crate) fn word_capacity(&self) -> usize {
        self.word_capacity
    }

    /// Whether `self` and `other` hand out buffers from the same pool, i.e.
    /// one filter is a shallow copy of the other.
    pub(crate) fn shares_pool_with(&self, other: &BlockAllocator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Hands out one zeroed buffer of `word_capacity` words, growing the pool
    /// by a whole batch when the free list runs dry.
    pub(crate) fn alloc_zeroed(&self) -> Result<Vec<u32>, FilterError> {
        let mut inner = self.inner.lock().expect("bit-block pool lock poisoned");
        if inner.free.is_empty() {
            grow(&mut inner, self.word_capacity)?;
        }
        let mut buf = inner.free.pop().expect("bit-block pool refill failed");
        buf.fill(0);
        Ok(buf)
    }

    /// Returns a buffer to the free list for reuse.
    pub(crate) fn dealloc(&self, buf: Vec<u32>) {
        debug_assert_eq!(buf.len(), self.word_capacity);
        let mut inner = self.inner.lock().expect("bit-block pool lock poisoned");
        inner.free.push(buf);
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.inner.lock().expect("bit-block pool lock poisoned").free.len()
    }
}

fn grow(inner: &mut PoolInner, word_capacity: usize) -> Result<(), FilterError> {
    inner
        .free
        .try_reserve(POOL_BATCH)
        .map_err(|_| FilterError::OutOfMemory)?;

    let mut batch: Vec<Vec<u32>> = Vec::new();
    batch
        .try_reserve_exact(POOL_BATCH)
        .map_err(|_| FilterError::OutOfMemory)?;
    for _ in 0..POOL_BATCH {
        let mut buf = Vec::new();
        buf.try_reserve_exact(word_capacity)
            .map_err(|_| FilterError::OutOfMemory)?;
        buf.resize(word_capacity, 0);
        batch.push(buf);
    }

    // Enqueue the batch stride-permuted so consecutive hand-outs do not walk
    // neighbouring slots of one growth step.
    let mut idx = 0;
    for _ in 0..POOL_BATCH {
        inner.free.push(std::mem::take(&mut batch[idx]));
        idx = (idx + POOL_STRIDE) % POOL_BATCH;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_whole_batches() {
        let alloc = BlockAllocator::new(4);
        assert_eq!(alloc.free_len(), 0);
        let buf = alloc.alloc_zeroed().unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(alloc.free_len(), POOL_BATCH - 1);
    }

    #[test]
    fn recycles_returned_buffers() {
        let alloc = BlockAllocator::new(2);
        let mut buf = alloc.alloc_zeroed().unwrap();
        buf[0] = 0xDEAD_BEEF;
        let before = alloc.free_len();
        alloc.dealloc(buf);
        assert_eq!(alloc.free_len(), before + 1);

        // Recycled buffers come back zeroed.
        let buf = alloc.alloc_zeroed().unwrap();
        assert_eq!(buf, vec![0, 0]);
    }

    #[test]
    fn stride_permutation_covers_the_batch() {
        // The stride walk must be a permutation, or slots would leak.
        let mut seen = [false; POOL_BATCH];
        let mut idx = 0;
        for _ in 0..POOL_BATCH {
            assert!(!seen[idx]);
            seen[idx] = true;
            idx = (idx + POOL_STRIDE) % POOL_BATCH;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn pool_identity_tracks_sharing() {
        let a = BlockAllocator::new(4);
        let b = a.clone();
        let c = BlockAllocator::new(4);
        assert!(a.shares_pool_with(&b));
        assert!(!a.shares_pool_with(&c));
    }
}
