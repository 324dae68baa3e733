#![forbid(unsafe_code)]

use crate::filter::{BlockState, Filter};

/// Iterator over the global indexes of all set rows, in ascending order.
///
/// Uniform blocks advance arithmetically without touching word storage;
/// materialized blocks scan word-at-a-time. Construct with
/// [`Filter::iter_ones`].
pub struct FilterOnesIterator<'a> {
    filter: &'a Filter,
    block: usize,
    /// Next in-block position to examine.
    pos: u32,
}

impl Filter {
    /// Iterates the set rows in ascending order. Any pending delayed run
    /// must be committed first; the filter must not be mutated while the
    /// iterator is live (the borrow enforces this).
    pub fn iter_ones(&self) -> FilterOnesIterator<'_> {
        FilterOnesIterator {
            filter: self,
            block: 0,
            pos: 0,
        }
    }
}

impl Iterator for FilterOnesIterator<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.block < self.filter.num_blocks {
            let from = self.pos;
            let width = self.filter.block_width(self.block);
            let found = match &self.filter.states[self.block] {
                BlockState::Empty => None,
                BlockState::Full { last_one } => {
                    let last = u32::from(*last_one);
                    (from <= last).then_some(from)
                }
                BlockState::Mixed(block) => block.next_one_at_or_after(from),
            };
            match found {
                Some(p) => {
                    let row = ((self.block as u64) << self.filter.block_power) + u64::from(p);
                    if p + 1 < width {
                        self.pos = p + 1;
                    } else {
                        self.block += 1;
                        self.pos = 0;
                    }
                    return Some(row);
                }
                None => {
                    self.block += 1;
                    self.pos = 0;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_across_block_representations() {
        let mut f = Filter::all_zeros(48, 4).unwrap();
        f.set_between(0, 4).unwrap(); // block 0 prefix-full
        f.set(1, 3).unwrap(); // block 1 materialized
        f.set(1, 9).unwrap();
        f.set(2, 15).unwrap(); // last bit overall
        let rows: Vec<u64> = f.iter_ones().collect();
        assert_eq!(rows, vec![0, 1, 2, 3, 4, 19, 25, 47]);
    }

    #[test]
    fn empty_filter_yields_nothing() {
        let f = Filter::all_zeros(100, 4).unwrap();
        assert_eq!(f.iter_ones().next(), None);
    }

    #[test]
    fn full_filter_yields_every_row() {
        let f = Filter::all_ones(37, 5).unwrap();
        let rows: Vec<u64> = f.iter_ones().collect();
        assert_eq!(rows, (0..37).collect::<Vec<u64>>());
    }
}
