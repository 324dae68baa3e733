#![forbid(unsafe_code)]

use crate::block::Block;
use crate::error::FilterError;
use crate::pool::BlockAllocator;
use std::fmt;

/// Engine-wide bound on addressable rows (2^47 - 1).
pub const MAX_ROW_NUMBER: u64 = (1 << 47) - 1;

/// Reported by [`Filter::density_weight`] when fewer than two blocks are
/// nonempty and no useful density estimate exists.
pub const NO_DENSITY_ESTIMATE: u32 = 65_537;

/// Per-block representation. A block is materialized if and only if it is
/// `Mixed`; the other two variants carry the whole bit pattern in the tag.
pub(crate) enum BlockState {
    /// Every bit clear.
    Empty,
    /// Bits `[0, last_one]` set, the rest clear. `last_one == width - 1` is
    /// the truly-full case.
    Full { last_one: u16 },
    Mixed(Block),
}

/// Cursor for the batched mutation protocol. The two channels are mutually
/// exclusive by construction; a `Spent` cursor keeps its channel reserved
/// until [`Filter::commit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delay {
    None,
    Set { block: usize, cursor: DelayCursor },
    Reset { block: usize, cursor: DelayCursor },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DelayCursor {
    /// Channel open, no position accumulated yet.
    NotStarted,
    /// Positions `[0, p]` are pending.
    At(u16),
    /// A skip forced a direct write; no further delaying on this block.
    Spent,
}

/// A mutable row-membership bitmap over `[0, num_objects)`, organized into
/// power-of-two blocks aligned to the engine's pack size.
///
/// Each block independently collapses into one of three representations
/// (empty, prefix-full, materialized), so narrowing a predicate over runs of
/// whole packs costs O(#blocks) rather than O(#rows), and uniform blocks
/// never allocate word storage. The representation is an implementation
/// detail: `get`/`count_ones`/equality behave identically whichever
/// representation a block happens to be in.
///
/// A single filter is a single-writer structure; only the backing word pool
/// is internally synchronized (it is shared with shallow copies, which may
/// live on other threads).
pub struct Filter {
    pub(crate) block_power: u32,
    pub(crate) block_size: u32,
    pub(crate) num_blocks: usize,
    pub(crate) last_block_bits: u32,
    pub(crate) states: Vec<BlockState>,
    block_changed: Vec<bool>,
    delay: Delay,
    alloc: BlockAllocator,
    release_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl Filter {
    /// Creates a filter with every row excluded.
    pub fn all_zeros(num_objects: u64, block_power: u32) -> Result<Filter, FilterError> {
        Self::with_initial(num_objects, block_power, false)
    }

    /// Creates a filter with every row included.
    pub fn all_ones(num_objects: u64, block_power: u32) -> Result<Filter, FilterError> {
        Self::with_initial(num_objects, block_power, true)
    }

    fn with_initial(num_objects: u64, block_power: u32, ones: bool) -> Result<Filter, FilterError> {
        debug_assert!((1..=16).contains(&block_power));
        if num_objects > MAX_ROW_NUMBER {
            return Err(FilterError::CapacityExceeded {
                requested: num_objects,
                max: MAX_ROW_NUMBER,
            });
        }
        let block_size = 1u32 << block_power;
        let num_blocks = num_objects.div_ceil(u64::from(block_size)) as usize;
        let last_block_bits = if num_objects == 0 {
            0
        } else {
            let rem = (num_objects & u64::from(block_size - 1)) as u32;
            if rem == 0 {
                block_size
            } else {
                rem
            }
        };
        let word_capacity = ((block_size + 31) / 32) as usize;
        let mut filter = Filter {
            block_power,
            block_size,
            num_blocks,
            last_block_bits,
            states: Vec::with_capacity(num_blocks),
            block_changed: vec![false; num_blocks],
            delay: Delay::None,
            alloc: BlockAllocator::new(word_capacity),
            release_hook: None,
        };
        for b in 0..num_blocks {
            filter.states.push(if ones {
                BlockState::Full {
                    last_one: (filter.block_width(b) - 1) as u16,
                }
            } else {
                BlockState::Empty
            });
        }
        Ok(filter)
    }

    /// Deep copy: a fresh pool, every materialized block physically copied.
    /// Fallible because block materialization is, hence not `impl Clone`.
    pub fn try_clone(&self) -> Result<Filter, FilterError> {
        let alloc = BlockAllocator::new(self.alloc.word_capacity());
        let mut states = Vec::with_capacity(self.num_blocks);
        for state in &self.states {
            states.push(match state {
                BlockState::Empty => BlockState::Empty,
                BlockState::Full { last_one } => BlockState::Full {
                    last_one: *last_one,
                },
                BlockState::Mixed(block) => BlockState::Mixed(Block::copy_of(block, &alloc)?),
            });
        }
        Ok(Filter {
            block_power: self.block_power,
            block_size: self.block_size,
            num_blocks: self.num_blocks,
            last_block_bits: self.last_block_bits,
            states,
            block_changed: vec![false; self.num_blocks],
            delay: Delay::None,
            alloc,
            release_hook: None,
        })
    }

    /// Zero-copy transient view: its own status and dirty arrays (free to
    /// diverge), block word buffers and pool shared with `self`. Bit contents
    /// read the same from both sides until one side's mutation diverges onto
    /// a private buffer; dropping either side never frees storage the other
    /// still references.
    pub fn shallow_copy(&self) -> Filter {
        Filter {
            block_power: self.block_power,
            block_size: self.block_size,
            num_blocks: self.num_blocks,
            last_block_bits: self.last_block_bits,
            states: self
                .states
                .iter()
                .map(|state| match state {
                    BlockState::Empty => BlockState::Empty,
                    BlockState::Full { last_one } => BlockState::Full {
                        last_one: *last_one,
                    },
                    BlockState::Mixed(block) => BlockState::Mixed(block.share()),
                })
                .collect(),
            block_changed: self.block_changed.clone(),
            delay: Delay::None,
            alloc: self.alloc.clone(),
            release_hook: None,
        }
    }

    /// Total addressable rows.
    pub fn num_objects(&self) -> u64 {
        if self.num_blocks == 0 {
            return 0;
        }
        ((self.num_blocks as u64 - 1) << self.block_power) + u64::from(self.last_block_bits)
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Valid bit count of the final (possibly partial) block.
    pub fn last_block_bits(&self) -> u32 {
        self.last_block_bits
    }

    /// Logical width of block `b` in bits.
    pub(crate) fn block_width(&self, b: usize) -> u32 {
        debug_assert!(b < self.num_blocks);
        if b + 1 == self.num_blocks {
            self.last_block_bits
        } else {
            self.block_size
        }
    }

    fn decompose(&self, n: u64) -> (usize, u32) {
        (
            (n >> self.block_power) as usize,
            (n & u64::from(self.block_size - 1)) as u32,
        )
    }

    // --- point and range mutation -------------------------------------------

    /// Sets bit `pos` of block `b`.
    pub fn set(&mut self, b: usize, pos: u32) -> Result<(), FilterError> {
        debug_assert!(b < self.num_blocks);
        self.block_changed[b] = true;
        if let BlockState::Mixed(block) = &mut self.states[b] {
            let full = block.set(pos)?;
            if full {
                self.set_block(b);
            }
            return Ok(());
        }
        self.set_range_in_block(b, pos, pos)
    }

    /// Clears bit `pos` of block `b`.
    pub fn reset(&mut self, b: usize, pos: u32) -> Result<(), FilterError> {
        debug_assert!(b < self.num_blocks);
        self.block_changed[b] = true;
        if let BlockState::Mixed(block) = &mut self.states[b] {
            let empty = block.reset(pos)?;
            if empty {
                self.reset_block(b);
            }
            return Ok(());
        }
        self.reset_range_in_block(b, pos, pos)
    }

    /// Sets the bit for global row `n`.
    pub fn set_at(&mut self, n: u64) -> Result<(), FilterError> {
        let (b, pos) = self.decompose(n);
        self.set(b, pos)
    }

    /// Clears the bit for global row `n`.
    pub fn reset_at(&mut self, n: u64) -> Result<(), FilterError> {
        let (b, pos) = self.decompose(n);
        self.reset(b, pos)
    }

    /// Marks block `b` truly full, releasing any materialized storage.
    pub fn set_block(&mut self, b: usize) {
        debug_assert!(b < self.num_blocks);
        let width = self.block_width(b);
        self.states[b] = BlockState::Full {
            last_one: (width - 1) as u16,
        };
    }

    /// Marks block `b` empty, releasing any materialized storage.
    pub fn reset_block(&mut self, b: usize) {
        debug_assert!(b < self.num_blocks);
        self.states[b] = BlockState::Empty;
    }

    /// Includes every row. Clears any open delayed cursor.
    pub fn set_all(&mut self) {
        self.delay = Delay::None;
        for b in 0..self.num_blocks {
            self.set_block(b);
        }
    }

    /// Excludes every row. Clears any open delayed cursor.
    pub fn reset_all(&mut self) {
        self.delay = Delay::None;
        for b in 0..self.num_blocks {
            self.reset_block(b);
        }
    }

    /// Sets global rows `[n1, n2]` inclusive. Whole interior blocks flip to
    /// the prefix-full representation in O(1) each.
    pub fn set_between(&mut self, n1: u64, n2: u64) -> Result<(), FilterError> {
        debug_assert!(n1 <= n2 && n2 < self.num_objects());
        let (b1, p1) = self.decompose(n1);
        let (b2, p2) = self.decompose(n2);
        if b1 == b2 {
            return self.set_range_in_block(b1, p1, p2);
        }
        if p1 == 0 {
            self.set_block(b1);
        } else {
            self.set_range_in_block(b1, p1, self.block_size - 1)?;
        }
        for b in b1 + 1..b2 {
            self.set_block(b);
        }
        self.set_range_in_block(b2, 0, p2)
    }

    /// Clears global rows `[n1, n2]` inclusive.
    pub fn reset_between(&mut self, n1: u64, n2: u64) -> Result<(), FilterError> {
        debug_assert!(n1 <= n2 && n2 < self.num_objects());
        let (b1, p1) = self.decompose(n1);
        let (b2, p2) = self.decompose(n2);
        if b1 == b2 {
            return self.reset_range_in_block(b1, p1, p2);
        }
        if p1 == 0 {
            self.reset_block(b1);
        } else {
            self.reset_range_in_block(b1, p1, self.block_size - 1)?;
        }
        for b in b1 + 1..b2 {
            self.reset_block(b);
        }
        self.reset_range_in_block(b2, 0, p2)
    }

    /// Single-block set of `[n1, n2]`: the per-status dispatch every range
    /// and point mutation funnels through.
    fn set_range_in_block(&mut self, b: usize, n1: u32, n2: u32) -> Result<(), FilterError> {
        let width = self.block_width(b);
        debug_assert!(n1 <= n2 && n2 < width);
        match &mut self.states[b] {
            BlockState::Full { last_one } => {
                let last = u32::from(*last_one);
                if n1 <= last + 1 {
                    // The range touches or overlaps the prefix: extend it.
                    if n2 > last {
                        *last_one = n2 as u16;
                    }
                    return Ok(());
                }
                // A gap before n1: fall through and materialize.
            }
            BlockState::Empty => {
                if n1 == 0 {
                    self.states[b] = BlockState::Full {
                        last_one: n2 as u16,
                    };
                    return Ok(());
                }
            }
            BlockState::Mixed(block) => {
                let full = block.set_range(n1, n2)?;
                if full {
                    self.set_block(b);
                }
                return Ok(());
            }
        }
        let prefix = match &self.states[b] {
            BlockState::Full { last_one } => Some(u32::from(*last_one)),
            _ => None,
        };
        let mut block = Block::new(&self.alloc, width, false)?;
        if let Some(p) = prefix {
            block.set_range(0, p)?;
        }
        let full = block.set_range(n1, n2)?;
        if full {
            self.set_block(b);
        } else {
            self.states[b] = BlockState::Mixed(block);
        }
        Ok(())
    }

    /// Single-block clear of `[n1, n2]`.
    fn reset_range_in_block(&mut self, b: usize, n1: u32, n2: u32) -> Result<(), FilterError> {
        let width = self.block_width(b);
        debug_assert!(n1 <= n2 && n2 < width);
        match &mut self.states[b] {
            BlockState::Empty => Ok(()),
            BlockState::Full { last_one } => {
                let last = u32::from(*last_one);
                if n2 >= last {
                    if n1 == 0 {
                        self.states[b] = BlockState::Empty;
                    } else if n1 <= last {
                        *last_one = (n1 - 1) as u16;
                    }
                    // n1 > last: those bits are already clear.
                    return Ok(());
                }
                // Punch a hole inside the prefix: materialize first.
                let mut block = if last == width - 1 {
                    Block::new(&self.alloc, width, true)?
                } else {
                    let mut block = Block::new(&self.alloc, width, false)?;
                    block.set_range(0, last)?;
                    block
                };
                let empty = block.reset_range(n1, n2)?;
                self.states[b] = if empty {
                    BlockState::Empty
                } else {
                    BlockState::Mixed(block)
                };
                Ok(())
            }
            BlockState::Mixed(block) => {
                let empty = block.reset_range(n1, n2)?;
                if empty {
                    self.reset_block(b);
                }
                Ok(())
            }
        }
    }

    // --- queries ------------------------------------------------------------

    /// State of bit `pos` in block `b`.
    pub fn get(&self, b: usize, pos: u32) -> bool {
        debug_assert!(b < self.num_blocks);
        debug_assert!(pos < self.block_width(b));
        match &self.states[b] {
            BlockState::Empty => false,
            BlockState::Full { last_one } => pos <= u32::from(*last_one),
            BlockState::Mixed(block) => block.get(pos),
        }
    }

    /// State of the bit for global row `n`.
    pub fn get_at(&self, n: u64) -> bool {
        let (b, pos) = self.decompose(n);
        self.get(b, pos)
    }

    pub fn is_empty(&self) -> bool {
        self.states
            .iter()
            .all(|s| matches!(s, BlockState::Empty))
    }

    /// Whether every addressable row is included.
    pub fn is_full(&self) -> bool {
        (0..self.num_blocks).all(|b| self.is_block_full(b))
    }

    pub fn is_block_empty(&self, b: usize) -> bool {
        debug_assert!(b < self.num_blocks);
        matches!(self.states[b], BlockState::Empty)
    }

    /// Whether block `b` is truly full, i.e. its prefix covers the block's
    /// whole logical width.
    pub fn is_block_full(&self, b: usize) -> bool {
        debug_assert!(b < self.num_blocks);
        match self.states[b] {
            BlockState::Full { last_one } => u32::from(last_one) == self.block_width(b) - 1,
            _ => false,
        }
    }

    fn block_empty_between(&self, b: usize, n1: u32, n2: u32) -> bool {
        match &self.states[b] {
            BlockState::Empty => true,
            BlockState::Full { last_one } => n1 > u32::from(*last_one),
            BlockState::Mixed(block) => block.is_empty_between(n1, n2),
        }
    }

    fn block_full_between(&self, b: usize, n1: u32, n2: u32) -> bool {
        match &self.states[b] {
            BlockState::Empty => false,
            BlockState::Full { last_one } => n2 <= u32::from(*last_one),
            BlockState::Mixed(block) => block.is_full_between(n1, n2),
        }
    }

    fn block_count_between(&self, b: usize, n1: u32, n2: u32) -> u64 {
        match &self.states[b] {
            BlockState::Empty => 0,
            BlockState::Full { last_one } => {
                let last = u32::from(*last_one);
                if n1 > last {
                    0
                } else {
                    u64::from(n2.min(last) - n1 + 1)
                }
            }
            BlockState::Mixed(block) => u64::from(block.count_ones_between(n1, n2)),
        }
    }

    /// True if every bit in global rows `[n1, n2]` is clear.
    pub fn is_empty_between(&self, n1: u64, n2: u64) -> bool {
        debug_assert!(n1 <= n2 && n2 < self.num_objects());
        if n1 == n2 {
            return !self.get_at(n1);
        }
        let (b1, p1) = self.decompose(n1);
        let (b2, p2) = self.decompose(n2);
        if b1 == b2 {
            return self.block_empty_between(b1, p1, p2);
        }
        let start = if p1 == 0 { b1 } else { b1 + 1 };
        let stop = if p2 == self.block_width(b2) - 1 { b2 } else { b2 - 1 };
        if !(start..=stop).all(|b| self.is_block_empty(b)) {
            return false;
        }
        if b1 < start && !self.block_empty_between(b1, p1, self.block_size - 1) {
            return false;
        }
        if b2 > stop && !self.block_empty_between(b2, 0, p2) {
            return false;
        }
        true
    }

    /// True if every bit in global rows `[n1, n2]` is set.
    pub fn is_full_between(&self, n1: u64, n2: u64) -> bool {
        debug_assert!(n1 <= n2 && n2 < self.num_objects());
        if n1 == n2 {
            return self.get_at(n1);
        }
        let (b1, p1) = self.decompose(n1);
        let (b2, p2) = self.decompose(n2);
        if b1 == b2 {
            return self.block_full_between(b1, p1, p2);
        }
        let start = if p1 == 0 { b1 } else { b1 + 1 };
        let stop = if p2 == self.block_width(b2) - 1 { b2 } else { b2 - 1 };
        if !(start..=stop).all(|b| self.is_block_full(b)) {
            return false;
        }
        if b1 < start && !self.block_full_between(b1, p1, self.block_size - 1) {
            return false;
        }
        if b2 > stop && !self.block_full_between(b2, 0, p2) {
            return false;
        }
        true
    }

    /// Included rows over the whole filter.
    pub fn count_ones(&self) -> u64 {
        self.states
            .iter()
            .map(|s| match s {
                BlockState::Empty => 0,
                BlockState::Full { last_one } => u64::from(*last_one) + 1,
                BlockState::Mixed(block) => u64::from(block.count_ones()),
            })
            .sum()
    }

    /// Included rows in block `b`.
    pub fn count_ones_in_block(&self, b: usize) -> u32 {
        debug_assert!(b < self.num_blocks);
        match &self.states[b] {
            BlockState::Empty => 0,
            BlockState::Full { last_one } => u32::from(*last_one) + 1,
            BlockState::Mixed(block) => block.count_ones(),
        }
    }

    /// Included rows in block `b`, with any open delayed run folded in.
    pub fn count_ones_uncommitted(&self, b: usize) -> u32 {
        debug_assert!(b < self.num_blocks);
        let mut count = self.count_ones_in_block(b);
        match self.delay {
            Delay::Set {
                block,
                cursor: DelayCursor::At(p),
            } if block == b => {
                if matches!(self.states[b], BlockState::Empty) {
                    count += u32::from(p) + 1;
                }
            }
            Delay::Reset {
                block,
                cursor: DelayCursor::At(p),
            } if block == b => {
                if matches!(self.states[b], BlockState::Full { .. }) {
                    count = count.saturating_sub(u32::from(p) + 1);
                }
            }
            _ => {}
        }
        count
    }

    /// Included rows in global rows `[n1, n2]` inclusive.
    pub fn count_ones_between(&self, n1: u64, n2: u64) -> u64 {
        debug_assert!(n1 <= n2 && n2 < self.num_objects());
        if n1 == n2 {
            return u64::from(self.get_at(n1));
        }
        let (b1, p1) = self.decompose(n1);
        let (b2, p2) = self.decompose(n2);
        if b1 == b2 {
            return self.block_count_between(b1, p1, p2);
        }
        let start = if p1 == 0 { b1 } else { b1 + 1 };
        let stop = if p2 == self.block_width(b2) - 1 { b2 } else { b2 - 1 };
        let mut count: u64 = (start..=stop)
            .map(|b| u64::from(self.count_ones_in_block(b)))
            .sum();
        if b1 < start {
            count += self.block_count_between(b1, p1, self.block_size - 1);
        }
        if b2 > stop {
            count += self.block_count_between(b2, 0, p2);
        }
        count
    }

    /// Average population across nonempty blocks, or
    /// [`NO_DENSITY_ESTIMATE`] when fewer than two blocks are nonempty.
    pub fn density_weight(&self) -> u32 {
        let mut count: u64 = 0;
        let mut nonempty: u64 = 0;
        for b in 0..self.num_blocks {
            let ones = self.count_ones_in_block(b);
            if ones > 0 {
                count += u64::from(ones);
                nonempty += 1;
            }
        }
        if nonempty < 2 {
            return NO_DENSITY_ESTIMATE;
        }
        (count as f64 / nonempty as f64) as u32
    }

    /// Dirty flag for external incremental bookkeeping; raised by single-bit
    /// mutations, exchanged by [`Filter::swap_block`].
    pub fn block_changed(&self, b: usize) -> bool {
        debug_assert!(b < self.num_blocks);
        self.block_changed[b]
    }

    pub fn clear_block_changed(&mut self, b: usize) {
        debug_assert!(b < self.num_blocks);
        self.block_changed[b] = false;
    }

    // --- boolean algebra ----------------------------------------------------

    /// Narrows `self` to rows present in both filters, block by block over
    /// the common prefix of blocks.
    pub fn and(&mut self, rhs: &Filter) -> Result<(), FilterError> {
        let mb = self.num_blocks.min(rhs.num_blocks);
        for b in 0..mb {
            let end = self.block_width(b) - 1;
            match &rhs.states[b] {
                BlockState::Empty => self.reset_block(b),
                BlockState::Full { last_one } => {
                    let q = u32::from(*last_one);
                    if q < end {
                        self.reset_range_in_block(b, q + 1, end)?;
                    }
                }
                BlockState::Mixed(rblock) => {
                    if let BlockState::Full { last_one } = &self.states[b] {
                        let p = u32::from(*last_one);
                        let copy = Block::copy_of(rblock, &self.alloc)?;
                        self.states[b] = BlockState::Mixed(copy);
                        if p < end {
                            self.reset_range_in_block(b, p + 1, end)?;
                        }
                    } else if let BlockState::Mixed(sblock) = &mut self.states[b] {
                        let empty = sblock.and(rblock)?;
                        if empty {
                            self.reset_block(b);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Widens `self` to rows present in either filter.
    pub fn or(&mut self, rhs: &Filter) -> Result<(), FilterError> {
        let mb = self.num_blocks.min(rhs.num_blocks);
        for b in 0..mb {
            self.or_one_block(rhs, b)?;
        }
        Ok(())
    }

    /// OR restricted to one block; used when merging per-pack results.
    pub fn or_block(&mut self, rhs: &Filter, b: usize) -> Result<(), FilterError> {
        debug_assert!(b < self.num_blocks && b < rhs.num_blocks);
        self.or_one_block(rhs, b)
    }

    fn or_one_block(&mut self, rhs: &Filter, b: usize) -> Result<(), FilterError> {
        let end = self.block_width(b) - 1;
        match &rhs.states[b] {
            BlockState::Empty => Ok(()),
            BlockState::Full { last_one } => {
                let q = u32::from(*last_one);
                self.set_range_in_block(b, 0, q)
            }
            BlockState::Mixed(rblock) => match &mut self.states[b] {
                BlockState::Empty => {
                    let copy = Block::copy_of(rblock, &self.alloc)?;
                    self.states[b] = BlockState::Mixed(copy);
                    Ok(())
                }
                BlockState::Mixed(sblock) => {
                    let full = sblock.or(rblock)?;
                    if full {
                        self.set_block(b);
                    }
                    Ok(())
                }
                BlockState::Full { last_one } => {
                    let p = u32::from(*last_one);
                    if p < end {
                        let copy = Block::copy_of(rblock, &self.alloc)?;
                        self.states[b] = BlockState::Mixed(copy);
                        self.set_range_in_block(b, 0, p)?;
                    }
                    Ok(())
                }
            },
        }
    }

    /// Complements every addressable row in place.
    pub fn not(&mut self) -> Result<(), FilterError> {
        for b in 0..self.num_blocks {
            let end = self.block_width(b) - 1;
            match &mut self.states[b] {
                BlockState::Full { last_one } => {
                    let old = u32::from(*last_one);
                    if old < end {
                        // New prefix is the erased old suffix: widen to truly
                        // full, then clear the old prefix.
                        *last_one = end as u16;
                        self.reset_range_in_block(b, 0, old)?;
                    } else {
                        self.states[b] = BlockState::Empty;
                    }
                }
                BlockState::Empty => {
                    self.states[b] = BlockState::Full {
                        last_one: end as u16,
                    };
                }
                BlockState::Mixed(block) => block.not()?,
            }
        }
        Ok(())
    }

    /// Clears every row of `self` that is set in `rhs`.
    pub fn and_not(&mut self, rhs: &Filter) -> Result<(), FilterError> {
        let mb = self.num_blocks.min(rhs.num_blocks);
        for b in 0..mb {
            let end = self.block_width(b) - 1;
            match &rhs.states[b] {
                BlockState::Empty => {}
                BlockState::Full { last_one } => {
                    let q = u32::from(*last_one);
                    self.reset_range_in_block(b, 0, q)?;
                }
                BlockState::Mixed(rblock) => match &mut self.states[b] {
                    BlockState::Empty => {}
                    BlockState::Full { last_one } => {
                        let p = u32::from(*last_one);
                        let mut copy = Block::copy_of(rblock, &self.alloc)?;
                        copy.not()?;
                        self.states[b] = BlockState::Mixed(copy);
                        if p < end {
                            self.reset_range_in_block(b, p + 1, end)?;
                        }
                    }
                    BlockState::Mixed(sblock) => {
                        let empty = sblock.and_not(rblock)?;
                        if empty {
                            self.reset_block(b);
                        }
                    }
                },
            }
        }
        Ok(())
    }

    // --- block exchange -----------------------------------------------------

    /// Exchanges one block's logical contents with `other`. The two filters
    /// keep private pools, so contents are copied across, never swapped as
    /// raw handles.
    pub fn swap_block(&mut self, other: &mut Filter, b: usize) -> Result<(), FilterError> {
        debug_assert!(b < self.num_blocks && b < other.num_blocks);
        debug_assert_eq!(self.block_width(b), other.block_width(b));
        let for_self = match &other.states[b] {
            BlockState::Empty => BlockState::Empty,
            BlockState::Full { last_one } => BlockState::Full {
                last_one: *last_one,
            },
            BlockState::Mixed(block) => BlockState::Mixed(Block::copy_of(block, &self.alloc)?),
        };
        let for_other = match &self.states[b] {
            BlockState::Empty => BlockState::Empty,
            BlockState::Full { last_one } => BlockState::Full {
                last_one: *last_one,
            },
            BlockState::Mixed(block) => BlockState::Mixed(Block::copy_of(block, &other.alloc)?),
        };
        self.states[b] = for_self;
        other.states[b] = for_other;
        std::mem::swap(&mut self.block_changed[b], &mut other.block_changed[b]);
        Ok(())
    }

    /// Takes block `b`'s contents from `donor`. When the two filters share a
    /// pool (one is a shallow copy of the other), ownership is transferred
    /// and the donor's slot is left empty; otherwise a physical copy is made
    /// into `self`'s pool.
    pub fn copy_block_from(&mut self, donor: &mut Filter, b: usize) -> Result<(), FilterError> {
        debug_assert!(b < self.num_blocks && b < donor.num_blocks);
        if self.alloc.shares_pool_with(&donor.alloc) {
            self.states[b] = std::mem::replace(&mut donor.states[b], BlockState::Empty);
        } else {
            self.states[b] = match &donor.states[b] {
                BlockState::Empty => BlockState::Empty,
                BlockState::Full { last_one } => BlockState::Full {
                    last_one: *last_one,
                },
                BlockState::Mixed(block) => BlockState::Mixed(Block::copy_of(block, &self.alloc)?),
            };
        }
        Ok(())
    }

    /// Appends `new_blocks` blocks (the table grew during a scan), each fully
    /// included or excluded per `value`. `new_last_bits` is the logical width
    /// of the new final block.
    pub fn add_new_blocks(&mut self, new_blocks: usize, value: bool, new_last_bits: u32) {
        if new_blocks == 0 {
            return;
        }
        debug_assert!(self.num_blocks == 0 || self.last_block_bits == self.block_size);
        debug_assert!(new_last_bits >= 1 && new_last_bits <= self.block_size);
        let total = self.num_blocks + new_blocks;
        for b in self.num_blocks..total {
            self.states.push(if value {
                let width = if b + 1 == total {
                    new_last_bits
                } else {
                    self.block_size
                };
                BlockState::Full {
                    last_one: (width - 1) as u16,
                }
            } else {
                BlockState::Empty
            });
        }
        self.block_changed.resize(total, false);
        self.num_blocks = total;
        self.last_block_bits = new_last_bits;
    }

    // --- delayed batched mutation -------------------------------------------

    /// Delayed variant of [`Filter::set`] for monotonic scan-order fills of a
    /// block that is still empty: consecutive positions extend an open run
    /// without touching block state until [`Filter::commit`] (or a skip, or a
    /// block switch) flushes it. Falls back to a direct `set` on materialized
    /// blocks. Must not be interleaved with [`Filter::reset_delayed`].
    pub fn set_delayed(&mut self, b: usize, pos: u32) -> Result<(), FilterError> {
        debug_assert!(b < self.num_blocks);
        debug_assert!(
            !matches!(self.delay, Delay::Reset { .. }),
            "cannot mix delayed set and reset channels"
        );
        if matches!(self.states[b], BlockState::Mixed(_)) {
            return self.set(b, pos);
        }
        if !matches!(self.states[b], BlockState::Empty) {
            // Prefix-full block: delayed positions are assumed already set.
            return Ok(());
        }
        let cursor = match self.delay {
            Delay::Set { block, cursor } if block == b => cursor,
            _ => {
                // Switching blocks flushes the previous run.
                self.commit()?;
                self.delay = Delay::Set {
                    block: b,
                    cursor: DelayCursor::NotStarted,
                };
                DelayCursor::NotStarted
            }
        };
        let expected = match cursor {
            DelayCursor::NotStarted => 0,
            DelayCursor::At(p) => u32::from(p) + 1,
            DelayCursor::Spent => return self.set(b, pos),
        };
        if pos == expected {
            self.delay = Delay::Set {
                block: b,
                cursor: DelayCursor::At(pos as u16),
            };
        } else if pos > expected {
            // The run is broken: flush it and stop delaying on this block.
            if let DelayCursor::At(p) = cursor {
                self.set_range_in_block(b, 0, u32::from(p))?;
            }
            self.set(b, pos)?;
            self.delay = Delay::Set {
                block: b,
                cursor: DelayCursor::Spent,
            };
        }
        // pos < expected: already inside the pending run.
        Ok(())
    }

    /// Mirror of [`Filter::set_delayed`] shrinking a believed-full prefix:
    /// consecutive positions accumulate a pending clear of `[0, pos]` on a
    /// prefix-full block. Must not be interleaved with [`Filter::set_delayed`].
    pub fn reset_delayed(&mut self, b: usize, pos: u32) -> Result<(), FilterError> {
        debug_assert!(b < self.num_blocks);
        debug_assert!(
            !matches!(self.delay, Delay::Set { .. }),
            "cannot mix delayed set and reset channels"
        );
        if matches!(self.states[b], BlockState::Mixed(_)) {
            return self.reset(b, pos);
        }
        if !matches!(self.states[b], BlockState::Full { .. }) {
            return Ok(());
        }
        let cursor = match self.delay {
            Delay::Reset { block, cursor } if block == b => cursor,
            _ => {
                self.commit()?;
                self.delay = Delay::Reset {
                    block: b,
                    cursor: DelayCursor::NotStarted,
                };
                DelayCursor::NotStarted
            }
        };
        let expected = match cursor {
            DelayCursor::NotStarted => 0,
            DelayCursor::At(p) => u32::from(p) + 1,
            DelayCursor::Spent => return self.reset(b, pos),
        };
        if pos == expected {
            self.delay = Delay::Reset {
                block: b,
                cursor: DelayCursor::At(pos as u16),
            };
        } else if pos > expected {
            if let DelayCursor::At(p) = cursor {
                self.reset_range_in_block(b, 0, u32::from(p))?;
            }
            self.reset(b, pos)?;
            self.delay = Delay::Reset {
                block: b,
                cursor: DelayCursor::Spent,
            };
        }
        Ok(())
    }

    /// Delayed set addressed by global row index.
    pub fn set_delayed_at(&mut self, n: u64) -> Result<(), FilterError> {
        let (b, pos) = self.decompose(n);
        self.set_delayed(b, pos)
    }

    /// Delayed reset addressed by global row index.
    pub fn reset_delayed_at(&mut self, n: u64) -> Result<(), FilterError> {
        let (b, pos) = self.decompose(n);
        self.reset_delayed(b, pos)
    }

    /// Flushes whichever delay channel is open and clears the cursor. Must
    /// run before any operation that is not itself delay-aware.
    pub fn commit(&mut self) -> Result<(), FilterError> {
        match std::mem::replace(&mut self.delay, Delay::None) {
            Delay::None => Ok(()),
            Delay::Set { block, cursor } => {
                if let DelayCursor::At(p) = cursor {
                    if matches!(self.states[block], BlockState::Empty) {
                        self.set_range_in_block(block, 0, u32::from(p))?;
                    }
                }
                Ok(())
            }
            Delay::Reset { block, cursor } => {
                if let DelayCursor::At(p) = cursor {
                    if matches!(self.states[block], BlockState::Full { .. }) {
                        self.reset_range_in_block(block, 0, u32::from(p))?;
                    }
                }
                Ok(())
            }
        }
    }

    // --- lifecycle ----------------------------------------------------------

    /// Registers a hook run at most once when the filter is released,
    /// letting an external lifecycle manager drop any weak registration.
    pub fn set_release_hook(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.release_hook = Some(Box::new(hook));
    }

    /// Fires the release hook if it has not fired yet. Invoked by `Drop` if
    /// not called explicitly.
    pub fn release(&mut self) {
        if let Some(hook) = self.release_hook.take() {
            hook();
        }
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        self.release();
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Filter) -> bool {
        if self.num_blocks != other.num_blocks
            || self.last_block_bits != other.last_block_bits
            || self.block_power != other.block_power
        {
            return false;
        }
        for b in 0..self.num_blocks {
            match (&self.states[b], &other.states[b]) {
                (BlockState::Empty, BlockState::Empty) => {}
                (BlockState::Full { last_one: p }, BlockState::Full { last_one: q }) => {
                    if p != q {
                        return false;
                    }
                }
                (BlockState::Mixed(x), BlockState::Mixed(y)) => {
                    if !x.is_equal(y) {
                        return false;
                    }
                }
                // A prefix-full block may equal a materialized one holding
                // the same prefix pattern; check from the full side.
                (BlockState::Full { last_one }, BlockState::Mixed(m))
                | (BlockState::Mixed(m), BlockState::Full { last_one }) => {
                    let p = u32::from(*last_one);
                    let width = self.block_width(b);
                    if !m.is_full_between(0, p) {
                        return false;
                    }
                    if p + 1 < width && !m.is_empty_between(p + 1, width - 1) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }
}

impl Eq for Filter {}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut empty = 0;
        let mut full = 0;
        let mut mixed = 0;
        for state in &self.states {
            match state {
                BlockState::Empty => empty += 1,
                BlockState::Full { .. } => full += 1,
                BlockState::Mixed(_) => mixed += 1,
            }
        }
        f.debug_struct("Filter")
            .field("num_objects", &self.num_objects())
            .field("block_size", &self.block_size)
            .field("empty_blocks", &empty)
            .field("full_blocks", &full)
            .field("mixed_blocks", &mixed)
            .field("ones", &self.count_ones())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "cannot mix delayed set and reset channels")]
    fn delayed_channels_are_mutually_exclusive() {
        let mut f = Filter::all_zeros(64, 4).unwrap();
        f.set_delayed(0, 0).unwrap();
        let _ = f.reset_delayed(1, 0);
    }

    #[test]
    fn delayed_set_skip_spends_the_channel() {
        let mut f = Filter::all_zeros(32, 4).unwrap();
        f.set_delayed(0, 0).unwrap();
        f.set_delayed(0, 1).unwrap();
        // Nothing visible before the flush.
        assert_eq!(f.count_ones(), 0);
        assert_eq!(f.count_ones_uncommitted(0), 2);

        // Skipping ahead flushes the run and applies the new bit directly.
        f.set_delayed(0, 7).unwrap();
        assert_eq!(f.count_ones(), 3);
        assert!(f.get(0, 0) && f.get(0, 1) && f.get(0, 7));

        f.commit().unwrap();
        assert_eq!(f.count_ones(), 3);
    }

    #[test]
    fn delayed_set_switching_blocks_flushes() {
        let mut f = Filter::all_zeros(64, 4).unwrap();
        for pos in 0..5 {
            f.set_delayed(0, pos).unwrap();
        }
        f.set_delayed(2, 0).unwrap();
        // Block 0 flushed into the prefix representation.
        assert_eq!(f.count_ones_in_block(0), 5);
        assert_eq!(f.count_ones_uncommitted(2), 1);
        f.commit().unwrap();
        assert_eq!(f.count_ones(), 6);
    }

    #[test]
    fn delayed_reset_shrinks_a_full_prefix() {
        let mut f = Filter::all_ones(32, 4).unwrap();
        for pos in 0..6 {
            f.reset_delayed(0, pos).unwrap();
        }
        assert_eq!(f.count_ones_uncommitted(0), 10);
        assert_eq!(f.count_ones_in_block(0), 16);
        f.commit().unwrap();
        assert_eq!(f.count_ones_in_block(0), 10);
        assert!(!f.get(0, 5) && f.get(0, 6));
    }

    #[test]
    fn commit_is_idempotent() {
        let mut f = Filter::all_zeros(32, 4).unwrap();
        for pos in 0..4 {
            f.set_delayed(0, pos).unwrap();
        }
        f.commit().unwrap();
        f.commit().unwrap();
        assert_eq!(f.count_ones(), 4);
    }

    #[test]
    fn release_hook_fires_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let fired = Arc::new(AtomicUsize::new(0));
        let mut f = Filter::all_zeros(16, 4).unwrap();
        let hook = Arc::clone(&fired);
        f.set_release_hook(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });
        f.release();
        drop(f);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debug_summarizes_block_mix() {
        let mut f = Filter::all_zeros(64, 4).unwrap();
        f.set_between(0, 15).unwrap();
        f.set(1, 3).unwrap();
        let rendered = format!("{f:?}");
        assert!(rendered.contains("full_blocks: 1"));
        assert!(rendered.contains("mixed_blocks: 1"));
    }
}
