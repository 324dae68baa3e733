#![forbid(unsafe_code)]

use crate::error::FilterError;
use crate::pool::BlockAllocator;
use std::sync::Arc;

/// A materialized per-block bitmap: pooled `u32` words plus an incrementally
/// maintained population count.
///
/// Bits are little-endian within each word (bit 0 is the LSB of word 0). Two
/// invariants hold at all times: bits at positions `num_objects..` of the
/// final in-use word are zero, and words past `ceil(num_objects/32)` are zero.
/// That keeps `set_bits` a plain popcount over the buffer.
///
/// The word buffer is shared (`Arc`) with any shallow copy of the owning
/// filter; the first mutation through either side copies onto a private
/// buffer from the pool before writing.
pub(crate) struct Block {
    /// `Some` for the whole life of the block; taken in `Drop` so the buffer
    /// can return to the pool once the last referent is gone.
    words: Option<Arc<Vec<u32>>>,
    num_objects: u32,
    set_bits: u32,
    alloc: BlockAllocator,
}

impl Block {
    /// Materializes a block of `num_objects` bits, all clear or all set.
    pub(crate) fn new(
        alloc: &BlockAllocator,
        num_objects: u32,
        all_full: bool,
    ) -> Result<Block, FilterError> {
        debug_assert!(num_objects > 0);
        debug_assert!(num_objects as usize <= alloc.word_capacity() * 32);
        let mut buf = alloc.alloc_zeroed()?;
        let mut set_bits = 0;
        if all_full {
            let full = (num_objects / 32) as usize;
            for w in &mut buf[..full] {
                *w = u32::MAX;
            }
            let rem = num_objects % 32;
            if rem != 0 {
                buf[full] = (1u32 << rem) - 1;
            }
            set_bits = num_objects;
        }
        Ok(Block {
            words: Some(Arc::new(buf)),
            num_objects,
            set_bits,
            alloc: alloc.clone(),
        })
    }

    /// Physical copy of `src` into `alloc`'s pool.
    pub(crate) fn copy_of(src: &Block, alloc: &BlockAllocator) -> Result<Block, FilterError> {
        debug_assert_eq!(src.words().len(), alloc.word_capacity());
        let mut buf = alloc.alloc_zeroed()?;
        buf.copy_from_slice(src.words());
        Ok(Block {
            words: Some(Arc::new(buf)),
            num_objects: src.num_objects,
            set_bits: src.set_bits,
            alloc: alloc.clone(),
        })
    }

    /// Aliasing copy for shallow filter copies: the word buffer is shared
    /// until either side mutates it.
    pub(crate) fn share(&self) -> Block {
        Block {
            words: self.words.clone(),
            num_objects: self.num_objects,
            set_bits: self.set_bits,
            alloc: self.alloc.clone(),
        }
    }

    pub(crate) fn count_ones(&self) -> u32 {
        self.set_bits
    }

    fn words(&self) -> &[u32] {
        self.words.as_deref().expect("block buffer missing")
    }

    /// Exclusive access to the words, diverging onto a private pool buffer
    /// first if the current one is shared with a shallow copy.
    fn words_mut(&mut self) -> Result<&mut Vec<u32>, FilterError> {
        let arc = self.words.as_mut().expect("block buffer missing");
        if Arc::get_mut(arc).is_none() {
            let mut fresh = self.alloc.alloc_zeroed()?;
            fresh.copy_from_slice(arc);
            *arc = Arc::new(fresh);
        }
        Ok(Arc::get_mut(arc).expect("block buffer still shared"))
    }

    pub(crate) fn get(&self, n: u32) -> bool {
        debug_assert!(n < self.num_objects);
        (self.words()[(n >> 5) as usize] >> (n & 31)) & 1 == 1
    }

    /// Sets one bit; returns whether the block is now fully set.
    pub(crate) fn set(&mut self, n: u32) -> Result<bool, FilterError> {
        debug_assert!(n < self.num_objects);
        let idx = (n >> 5) as usize;
        let mask = 1u32 << (n & 31);
        let words = self.words_mut()?;
        if words[idx] & mask == 0 {
            words[idx] |= mask;
            self.set_bits += 1;
        }
        Ok(self.set_bits == self.num_objects)
    }

    /// Clears one bit; returns whether the block is now fully clear.
    pub(crate) fn reset(&mut self, n: u32) -> Result<bool, FilterError> {
        debug_assert!(n < self.num_objects);
        let idx = (n >> 5) as usize;
        let mask = 1u32 << (n & 31);
        let words = self.words_mut()?;
        if words[idx] & mask != 0 {
            words[idx] &= !mask;
            self.set_bits -= 1;
        }
        Ok(self.set_bits == 0)
    }

    /// Sets `[n1, n2]` inclusive; returns whether the block is now fully set.
    pub(crate) fn set_range(&mut self, n1: u32, n2: u32) -> Result<bool, FilterError> {
        debug_assert!(n1 <= n2 && n2 < self.num_objects);
        let (w1, w2) = ((n1 >> 5) as usize, (n2 >> 5) as usize);
        let m1 = u32::MAX << (n1 & 31);
        let m2 = u32::MAX >> (31 - (n2 & 31));
        let mut added = 0;
        let words = self.words_mut()?;
        if w1 == w2 {
            let m = m1 & m2;
            added += (!words[w1] & m).count_ones();
            words[w1] |= m;
        } else {
            added += (!words[w1] & m1).count_ones();
            words[w1] |= m1;
            for w in &mut words[w1 + 1..w2] {
                added += (!*w).count_ones();
                *w = u32::MAX;
            }
            added += (!words[w2] & m2).count_ones();
            words[w2] |= m2;
        }
        self.set_bits += added;
        Ok(self.set_bits == self.num_objects)
    }

    /// Clears `[n1, n2]` inclusive; returns whether the block is now fully
    /// clear.
    pub(crate) fn reset_range(&mut self, n1: u32, n2: u32) -> Result<bool, FilterError> {
        debug_assert!(n1 <= n2 && n2 < self.num_objects);
        let (w1, w2) = ((n1 >> 5) as usize, (n2 >> 5) as usize);
        let m1 = u32::MAX << (n1 & 31);
        let m2 = u32::MAX >> (31 - (n2 & 31));
        let mut removed = 0;
        let words = self.words_mut()?;
        if w1 == w2 {
            let m = m1 & m2;
            removed += (words[w1] & m).count_ones();
            words[w1] &= !m;
        } else {
            removed += (words[w1] & m1).count_ones();
            words[w1] &= !m1;
            for w in &mut words[w1 + 1..w2] {
                removed += w.count_ones();
                *w = 0;
            }
            removed += (words[w2] & m2).count_ones();
            words[w2] &= !m2;
        }
        self.set_bits -= removed;
        Ok(self.set_bits == 0)
    }

    pub(crate) fn is_empty_between(&self, n1: u32, n2: u32) -> bool {
        debug_assert!(n1 <= n2 && n2 < self.num_objects);
        let words = self.words();
        let (w1, w2) = ((n1 >> 5) as usize, (n2 >> 5) as usize);
        let m1 = u32::MAX << (n1 & 31);
        let m2 = u32::MAX >> (31 - (n2 & 31));
        if w1 == w2 {
            return words[w1] & m1 & m2 == 0;
        }
        if words[w1] & m1 != 0 || words[w2] & m2 != 0 {
            return false;
        }
        words[w1 + 1..w2].iter().all(|&w| w == 0)
    }

    pub(crate) fn is_full_between(&self, n1: u32, n2: u32) -> bool {
        debug_assert!(n1 <= n2 && n2 < self.num_objects);
        let words = self.words();
        let (w1, w2) = ((n1 >> 5) as usize, (n2 >> 5) as usize);
        let m1 = u32::MAX << (n1 & 31);
        let m2 = u32::MAX >> (31 - (n2 & 31));
        if w1 == w2 {
            let m = m1 & m2;
            return words[w1] & m == m;
        }
        if words[w1] & m1 != m1 || words[w2] & m2 != m2 {
            return false;
        }
        words[w1 + 1..w2].iter().all(|&w| w == u32::MAX)
    }

    pub(crate) fn count_ones_between(&self, n1: u32, n2: u32) -> u32 {
        debug_assert!(n1 <= n2 && n2 < self.num_objects);
        let words = self.words();
        let (w1, w2) = ((n1 >> 5) as usize, (n2 >> 5) as usize);
        let m1 = u32::MAX << (n1 & 31);
        let m2 = u32::MAX >> (31 - (n2 & 31));
        if w1 == w2 {
            return (words[w1] & m1 & m2).count_ones();
        }
        let mut count = (words[w1] & m1).count_ones() + (words[w2] & m2).count_ones();
        count += words[w1 + 1..w2].iter().map(|w| w.count_ones()).sum::<u32>();
        count
    }

    /// Position of the first set bit at or after `from`, if any.
    pub(crate) fn next_one_at_or_after(&self, from: u32) -> Option<u32> {
        if from >= self.num_objects {
            return None;
        }
        let words = self.words();
        let word_count = ((self.num_objects + 31) / 32) as usize;
        let mut idx = (from >> 5) as usize;
        let mut masked = words[idx] & (u32::MAX << (from & 31));
        loop {
            if masked != 0 {
                // Tail bits past `num_objects` are zero, so the hit is valid.
                return Some((idx as u32) * 32 + masked.trailing_zeros());
            }
            idx += 1;
            if idx >= word_count {
                return None;
            }
            masked = words[idx];
        }
    }

    /// Word-wise intersection over the common width; returns whether the
    /// block is now fully clear.
    pub(crate) fn and(&mut self, rhs: &Block) -> Result<bool, FilterError> {
        self.apply_bitwise(rhs, |a, b| a & b)?;
        Ok(self.set_bits == 0)
    }

    /// Word-wise union over the common width; returns whether the block is
    /// now fully set.
    pub(crate) fn or(&mut self, rhs: &Block) -> Result<bool, FilterError> {
        self.apply_bitwise(rhs, |a, b| a | b)?;
        Ok(self.set_bits == self.num_objects)
    }

    /// Clears every bit set in `rhs` over the common width; returns whether
    /// the block is now fully clear.
    pub(crate) fn and_not(&mut self, rhs: &Block) -> Result<bool, FilterError> {
        self.apply_bitwise(rhs, |a, b| a & !b)?;
        Ok(self.set_bits == 0)
    }

    /// Flips every bit below `num_objects`, keeping the tail invariant.
    pub(crate) fn not(&mut self) -> Result<(), FilterError> {
        let n = self.num_objects;
        let full = (n / 32) as usize;
        let rem = n % 32;
        let words = self.words_mut()?;
        for w in &mut words[..full] {
            *w = !*w;
        }
        if rem != 0 {
            words[full] = !words[full] & ((1u32 << rem) - 1);
        }
        self.set_bits = n - self.set_bits;
        Ok(())
    }

    fn apply_bitwise(
        &mut self,
        rhs: &Block,
        f: impl Fn(u32, u32) -> u32,
    ) -> Result<(), FilterError> {
        let mn = self.num_objects.min(rhs.num_objects);
        let full = (mn / 32) as usize;
        let rem = mn % 32;
        let rhs_words = rhs.words();
        let words = self.words_mut()?;
        for i in 0..full {
            words[i] = f(words[i], rhs_words[i]);
        }
        if rem != 0 {
            // Combine only the low `rem` bits; the rest of the word belongs
            // to this block alone.
            let m = (1u32 << rem) - 1;
            words[full] = (f(words[full], rhs_words[full]) & m) | (words[full] & !m);
        }
        // Bulk ops recompute the population once instead of patching it.
        let total = words.iter().map(|w| w.count_ones()).sum();
        self.set_bits = total;
        Ok(())
    }

    pub(crate) fn is_equal(&self, rhs: &Block) -> bool {
        debug_assert_eq!(self.num_objects, rhs.num_objects);
        let full = (self.num_objects / 32) as usize;
        let rem = self.num_objects % 32;
        let a = self.words();
        let b = rhs.words();
        if a[..full] != b[..full] {
            return false;
        }
        if rem != 0 {
            let m = (1u32 << rem) - 1;
            if a[full] & m != b[full] & m {
                return false;
            }
        }
        true
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(arc) = self.words.take() {
            if let Ok(buf) = Arc::try_unwrap(arc) {
                self.alloc.dealloc(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_for(bits: u32) -> BlockAllocator {
        BlockAllocator::new(((bits + 31) / 32) as usize)
    }

    #[test]
    fn full_constructor_masks_the_tail() {
        let alloc = alloc_for(64);
        let block = Block::new(&alloc, 40, true).unwrap();
        assert_eq!(block.count_ones(), 40);
        assert!(block.is_full_between(0, 39));
        // Tail invariant keeps the popcount honest.
        assert_eq!(block.words().iter().map(|w| w.count_ones()).sum::<u32>(), 40);
    }

    #[test]
    fn set_and_reset_report_collapse() {
        let alloc = alloc_for(8);
        let mut block = Block::new(&alloc, 8, false).unwrap();
        for n in 0..7 {
            assert!(!block.set(n).unwrap());
        }
        assert!(block.set(7).unwrap());
        // Fullness is an exact count, never a counter wrap.
        assert_eq!(block.count_ones(), 8);

        for n in 0..7 {
            assert!(!block.reset(n).unwrap());
        }
        assert!(block.reset(7).unwrap());
        assert_eq!(block.count_ones(), 0);
    }

    #[test]
    fn range_ops_cross_word_boundaries() {
        let alloc = alloc_for(96);
        let mut block = Block::new(&alloc, 96, false).unwrap();
        block.set_range(20, 70).unwrap();
        assert_eq!(block.count_ones(), 51);
        assert!(block.is_full_between(20, 70));
        assert!(block.is_empty_between(0, 19));
        assert!(block.is_empty_between(71, 95));
        assert_eq!(block.count_ones_between(30, 80), 41);

        assert!(!block.reset_range(25, 60).unwrap());
        assert_eq!(block.count_ones(), 51 - 36);
        assert!(block.is_empty_between(25, 60));
        assert!(block.is_full_between(20, 24));
    }

    #[test]
    fn not_flips_within_width_only() {
        let alloc = alloc_for(40);
        let mut block = Block::new(&alloc, 40, false).unwrap();
        block.set_range(0, 9).unwrap();
        block.not().unwrap();
        assert_eq!(block.count_ones(), 30);
        assert!(block.is_empty_between(0, 9));
        assert!(block.is_full_between(10, 39));
        assert_eq!(block.words().iter().map(|w| w.count_ones()).sum::<u32>(), 30);
    }

    #[test]
    fn bitwise_ops_recompute_population() {
        let alloc = alloc_for(64);
        let mut a = Block::new(&alloc, 64, false).unwrap();
        let mut b = Block::new(&alloc, 64, false).unwrap();
        a.set_range(0, 40).unwrap();
        b.set_range(30, 63).unwrap();

        let mut x = Block::copy_of(&a, &alloc).unwrap();
        assert!(!x.and(&b).unwrap());
        assert_eq!(x.count_ones(), 11);

        let mut x = Block::copy_of(&a, &alloc).unwrap();
        assert!(x.or(&b).unwrap());
        assert_eq!(x.count_ones(), 64);

        let mut x = Block::copy_of(&a, &alloc).unwrap();
        assert!(!x.and_not(&b).unwrap());
        assert_eq!(x.count_ones(), 30);
    }

    #[test]
    fn shared_buffers_diverge_on_write() {
        let alloc = alloc_for(32);
        let mut a = Block::new(&alloc, 32, false).unwrap();
        a.set_range(0, 15).unwrap();
        let mut b = a.share();
        assert!(b.get(10));

        b.reset(10).unwrap();
        assert!(a.get(10), "writer must diverge, not mutate the shared words");
        assert!(!b.get(10));
        assert_eq!(a.count_ones(), 16);
        assert_eq!(b.count_ones(), 15);
    }

    #[test]
    fn buffers_return_to_the_pool_once_unshared() {
        let alloc = alloc_for(32);
        let a = Block::new(&alloc, 32, false).unwrap();
        let b = a.share();
        let free_before = alloc.free_len();
        drop(a);
        assert_eq!(alloc.free_len(), free_before, "still referenced by the share");
        drop(b);
        assert_eq!(alloc.free_len(), free_before + 1);
    }

    #[test]
    fn next_one_skips_zero_words() {
        let alloc = alloc_for(96);
        let mut block = Block::new(&alloc, 96, false).unwrap();
        block.set(70).unwrap();
        block.set(95).unwrap();
        assert_eq!(block.next_one_at_or_after(0), Some(70));
        assert_eq!(block.next_one_at_or_after(70), Some(70));
        assert_eq!(block.next_one_at_or_after(71), Some(95));
        assert_eq!(block.next_one_at_or_after(96), None);
    }

    #[test]
    fn equality_masks_the_final_word() {
        let alloc = alloc_for(40);
        let mut a = Block::new(&alloc, 40, false).unwrap();
        let mut b = Block::new(&alloc, 40, false).unwrap();
        a.set_range(3, 17).unwrap();
        b.set_range(3, 17).unwrap();
        assert!(a.is_equal(&b));
        b.set(39).unwrap();
        assert!(!a.is_equal(&b));
    }
}
