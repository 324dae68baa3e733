#![forbid(unsafe_code)]

use thiserror::Error;

/// Failures surfaced by filter construction and block materialization.
///
/// Programmer errors (out-of-range block indices, mixing the two delayed
/// mutation channels, swapping blocks of mismatched widths) are debug
/// assertions, not error values: they indicate a caller bug, not a data
/// condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("filter capacity exceeded: {requested} rows (maximum {max})")]
    CapacityExceeded { requested: u64, max: u64 },
    #[error("bit-block pool could not grow")]
    OutOfMemory,
}
