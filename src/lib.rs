#![forbid(unsafe_code)]

//! Pack-aligned row-membership bitmaps for progressive predicate narrowing.
//!
//! A [`Filter`] tracks which rows of a columnar table survive the predicates
//! evaluated so far. Rows are grouped into power-of-two blocks matching the
//! engine's pack size, and each block independently collapses into one of
//! three representations so that uniform regions cost no word storage:
//!
//! - empty (every bit clear),
//! - prefix-full (bits `[0, last_one]` set, the rest clear),
//! - materialized (an explicit bitmap drawn from a shared word pool).
//!
//! Key properties:
//!
//! - Whole-pack operations (`set_block`, `set_between` over aligned runs,
//!   block-level AND/OR) run in O(1) per block.
//! - Word buffers are recycled through a per-filter pool rather than
//!   round-tripping the global allocator on every materialize/collapse.
//! - `shallow_copy` produces a zero-copy transient view sharing word
//!   buffers; mutation on either side diverges onto private storage.
//! - A delayed-mutation channel batches monotonic scan-order writes into a
//!   single range operation at [`Filter::commit`] time.

mod block;
mod error;
mod filter;
mod iter;
mod pool;

pub use error::FilterError;
pub use filter::{Filter, MAX_ROW_NUMBER, NO_DENSITY_ESTIMATE};
pub use iter::FilterOnesIterator;
