//! Tooling around the poolguard runtime.
//!
//! This crate provides:
//! - Trace replay: drive a fresh runtime from a JSON list of operations and
//!   summarize every violation it reports
//! - Structured logging: JSONL records for each replayed operation
//! - Taxonomy export: the violation codes, symbols and weakness ids

#![forbid(unsafe_code)]

pub mod error;
pub mod replay;
pub mod structured_log;
pub mod taxonomy;

pub use error::HarnessError;
pub use replay::{ReplaySummary, Trace, TraceOp, replay, replay_file};
pub use taxonomy::{TaxonomyEntry, taxonomy};
