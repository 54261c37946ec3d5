// All extern "C" exports accept raw pointers from instrumented code; the
// runtime validates what it can, so per-function safety docs would repeat
// the same sentence.
#![allow(clippy::missing_safety_doc)]
//! # poolguard-abi
//!
//! C calling-convention boundary for the poolguard runtime.
//!
//! This crate produces a `cdylib` linked into instrumented programs. The
//! compiler pass inserts calls to these symbols around allocations, frees,
//! loads, stores and pointer arithmetic; each entry point resolves the pool
//! descriptor and forwards to the process-wide [`Runtime`].
//!
//! ```text
//! instrumented code -> pool_* entry (this crate) -> Runtime -> Pool / Reporter
//! ```
//!
//! [`Runtime`]: poolguard_membrane::Runtime

pub mod pool_abi;
pub mod runtime_state;
