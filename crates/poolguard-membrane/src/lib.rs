//! Object metadata runtime for pool-based memory safety checking.
//!
//! Instrumented programs register every object they create with a pool and
//! ask the runtime, before each risky access, whether a pointer still lies
//! inside a live object. This crate holds the metadata and answers those
//! questions; `poolguard-abi` exposes it over the C calling convention.
//!
//! # Architecture
//!
//! - **Page supplier** (`page_supplier`): page-granular memory for the
//!   runtime's own bookkeeping, plus remap and protect for shadow pages
//! - **Interval index** (`interval_index`): splay tree of disjoint regions,
//!   with nodes in a page-backed slab (`node_arena`)
//! - **Pool** (`pool`): live and retired objects, bounds, alignment and
//!   temporal checks
//! - **Exact checks** (`checks`): checks that need no lookup
//! - **Allocator adapters** (`allocator`): recognize allocation calls and
//!   derive object sizes
//! - **Violations** (`violation`): the fault taxonomy and alert format
//! - **Reporter** (`report`): log sink and termination policy
//! - **Runtime** (`runtime`): pool registry and composition root
//! - **Configuration** (`config`) and **metrics** (`metrics`)

#![deny(unsafe_code)]

pub mod allocator;
pub mod checks;
pub mod config;
pub mod error;
pub mod interval_index;
pub mod metrics;
mod node_arena;
pub mod page_supplier;
pub mod pool;
pub mod region;
pub mod report;
pub mod runtime;
pub mod violation;

pub use allocator::{AllocatorAdapter, AllocatorRegistry, CallSite};
pub use config::{LogFormat, RetentionPolicy, RuntimeConfig};
pub use error::{ConfigError, IndexError, PageError, RegionError};
pub use interval_index::IntervalIndex;
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use pool::{AccessKind, CheckMode, CheckOutcome, Pool, PoolStats, Provenance, Registration};
pub use region::{AllocKind, AllocSite, MemoryRegion, ObjectRecord, ObjectState, intern_source};
pub use report::{ReportOutcome, Reporter, ReporterState, SharedBuffer};
pub use runtime::{PoolId, Runtime, ShadowMapping};
pub use violation::{Cwe, ViolationKind, ViolationRecord};
