//! Error types for the metadata layer.
//!
//! These never reach the instrumented program. Index and region errors are
//! turned into violation records by the pool; page errors are fatal at the
//! point where no fallback exists.

use thiserror::Error;

use crate::region::MemoryRegion;

/// A byte range that cannot describe an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("empty or inverted range [{begin:#x}, {end:#x})")]
    Empty { begin: usize, end: usize },
    #[error("range at {begin:#x} with length {len} overflows the address space")]
    Overflow { begin: usize, len: usize },
}

/// Inconsistencies detected by the interval index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("range {requested} overlaps registered range {existing}")]
    Overlap {
        requested: MemoryRegion,
        existing: MemoryRegion,
    },
    #[error("no range covers {addr:#x}")]
    NotFound { addr: usize },
    #[error("{addr:#x} is interior to {existing}, not its base")]
    NotBase {
        addr: usize,
        existing: MemoryRegion,
    },
    #[error("range {requested} does not match registered range {existing}")]
    RangeMismatch {
        requested: MemoryRegion,
        existing: MemoryRegion,
    },
}

/// Failures of the OS page supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("page request of zero pages")]
    EmptyRequest,
    #[error("invalid page range: {0}")]
    InvalidRange(#[from] RegionError),
    #[error("os refused {pages} pages (errno {errno})")]
    Exhausted { pages: usize, errno: i32 },
    #[error("{op} failed at {addr:#x} (errno {errno})")]
    Os {
        op: &'static str,
        addr: usize,
        errno: i32,
    },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// An environment variable that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid value")]
    InvalidValue { var: &'static str, value: String },
}
