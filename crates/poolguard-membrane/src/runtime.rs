//! The runtime: every piece of process-wide state behind one value.
//!
//! Pools are addressed by opaque [`PoolId`]s handed to the instrumentation.
//! Objects the program received from outside (argv, environment, errno) live
//! in a separate external pool that every check falls back to. Violations
//! are resolved here into records, reported, and returned to the caller for
//! inspection; they never unwind into the instrumented program.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::allocator::{AllocatorAdapter, AllocatorRegistry, CallSite};
use crate::checks;
use crate::config::{RetentionPolicy, RuntimeConfig};
use crate::error::PageError;
use crate::metrics::{MetricsSnapshot, RuntimeMetrics};
use crate::page_supplier::{PageSupplier, global_page_supplier};
use crate::pool::{CheckMode, CheckOutcome, Pool, PoolStats, Provenance, Registration};
use crate::region::{AllocKind, AllocSite, MemoryRegion, ObjectRecord};
use crate::report::{ReportOutcome, Reporter};
use crate::violation::{ViolationKind, ViolationRecord};

/// Opaque handle naming one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

impl PoolId {
    /// Never handed out; marks an uninitialized descriptor.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// A second virtual mapping of an object's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMapping {
    /// Page-aligned base of the original mapping.
    pub canonical: usize,
    /// Page-aligned base of the alias.
    pub shadow: usize,
    pub pages: usize,
}

pub struct Runtime {
    config: RuntimeConfig,
    pools: RwLock<HashMap<PoolId, Arc<Pool>>>,
    next_pool: AtomicU64,
    external: Pool,
    /// Keyed by shadow base.
    shadows: Mutex<HashMap<usize, ShadowMapping>>,
    allocators: RwLock<AllocatorRegistry>,
    pages: &'static PageSupplier,
    reporter: Reporter,
    metrics: RuntimeMetrics,
}

impl Runtime {
    /// Runtime reporting to the sink named by `config`.
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let reporter = Reporter::from_config(&config)?;
        Ok(Self::with_reporter(config, reporter))
    }

    #[must_use]
    pub fn with_reporter(config: RuntimeConfig, reporter: Reporter) -> Self {
        Self {
            external: Pool::new(RetentionPolicy::Immediate),
            pools: RwLock::new(HashMap::new()),
            next_pool: AtomicU64::new(1),
            shadows: Mutex::new(HashMap::new()),
            allocators: RwLock::new(AllocatorRegistry::with_defaults()),
            pages: global_page_supplier(),
            reporter,
            metrics: RuntimeMetrics::new(),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub const fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // -- pool lifecycle ----------------------------------------------------

    pub fn create_pool(&self) -> PoolId {
        let id = PoolId(self.next_pool.fetch_add(1, Ordering::Relaxed));
        let pool = Arc::new(Pool::new(self.config.retention));
        self.pools.write().insert(id, pool);
        RuntimeMetrics::inc(&self.metrics.pools_created);
        id
    }

    /// Drop a pool and all its records. Returns false for unknown ids.
    pub fn destroy_pool(&self, id: PoolId) -> bool {
        let Some(pool) = self.pools.write().remove(&id) else {
            return false;
        };
        pool.destroy();
        RuntimeMetrics::inc(&self.metrics.pools_destroyed);
        true
    }

    #[must_use]
    pub fn pool(&self, id: PoolId) -> Option<Arc<Pool>> {
        self.pools.read().get(&id).cloned()
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    #[must_use]
    pub fn pool_stats(&self, id: PoolId) -> Option<PoolStats> {
        self.pool(id).map(|pool| pool.stats())
    }

    // -- reporting ---------------------------------------------------------

    /// Hand a violation to the reporter.
    pub fn report(&self, violation: &ViolationRecord) -> ReportOutcome {
        if violation.is_warning() {
            RuntimeMetrics::inc(&self.metrics.warnings);
        } else {
            RuntimeMetrics::inc(&self.metrics.faults);
        }
        self.reporter.report(violation)
    }

    fn reported<T>(
        &self,
        result: Result<T, ViolationRecord>,
        site: Option<AllocSite>,
    ) -> Result<T, ViolationRecord> {
        result.map_err(|violation| {
            let violation = match site {
                Some(site) => violation.with_site(site),
                None => violation,
            };
            self.report(&violation);
            violation
        })
    }

    // -- registration ------------------------------------------------------

    /// Record a live object. Null pointers, zero sizes and unknown pools are
    /// ignored.
    pub fn register(
        &self,
        id: PoolId,
        addr: usize,
        size: usize,
        kind: AllocKind,
        site: Option<AllocSite>,
    ) -> Option<Registration> {
        let registration = self.pool(id)?.register_raw(addr, size, kind, site)?;
        RuntimeMetrics::inc(&self.metrics.registrations);
        Some(registration)
    }

    /// Record memory the program received from outside (argv, environment).
    pub fn register_external(
        &self,
        addr: usize,
        size: usize,
        site: Option<AllocSite>,
    ) -> Option<Registration> {
        let registration = self.external.register_raw(addr, size, AllocKind::External, site)?;
        RuntimeMetrics::inc(&self.metrics.registrations);
        Some(registration)
    }

    /// External object covering `addr`.
    #[must_use]
    pub fn external_object_at(&self, addr: usize) -> Option<ObjectRecord> {
        self.external.object_at(addr)
    }

    /// Deallocate a heap object; free violations are reported.
    pub fn unregister(
        &self,
        id: PoolId,
        ptr: usize,
        site: Option<AllocSite>,
    ) -> Result<Option<ObjectRecord>, ViolationRecord> {
        let Some(pool) = self.pool(id) else {
            return Ok(None);
        };
        let freed = self.reported(pool.unregister_object(ptr, site), site)?;
        if freed.is_some() {
            RuntimeMetrics::inc(&self.metrics.unregistrations);
        }
        Ok(freed)
    }

    pub fn unregister_stack(&self, id: PoolId, ptr: usize) -> Option<ObjectRecord> {
        let record = self.pool(id)?.unregister_stack(ptr)?;
        RuntimeMetrics::inc(&self.metrics.unregistrations);
        Some(record)
    }

    pub fn reregister(
        &self,
        id: PoolId,
        new_ptr: usize,
        old_ptr: usize,
        size: usize,
        site: Option<AllocSite>,
    ) -> Result<Option<Registration>, ViolationRecord> {
        self.reregister_as(id, new_ptr, old_ptr, size, AllocKind::Heap, site)
    }

    fn reregister_as(
        &self,
        id: PoolId,
        new_ptr: usize,
        old_ptr: usize,
        size: usize,
        kind: AllocKind,
        site: Option<AllocSite>,
    ) -> Result<Option<Registration>, ViolationRecord> {
        let Some(pool) = self.pool(id) else {
            return Ok(None);
        };
        let registration =
            self.reported(pool.reregister(new_ptr, old_ptr, size, kind, site), site)?;
        if registration.is_some() {
            RuntimeMetrics::inc(&self.metrics.registrations);
        }
        Ok(registration)
    }

    // -- checks ------------------------------------------------------------

    /// Bounds check. A pointer the pool does not know is looked up among the
    /// external objects before the miss is judged.
    pub fn check(
        &self,
        id: PoolId,
        ptr: usize,
        len: usize,
        mode: CheckMode,
        site: Option<AllocSite>,
    ) -> Result<CheckOutcome, ViolationRecord> {
        RuntimeMetrics::inc(&self.metrics.checks);
        let result = match self.pool(id) {
            Some(pool) => pool.check_bounds(ptr, len, mode),
            None => Ok(CheckOutcome::Unknown),
        };
        let result = self.fall_back_to_external(ptr, result, |ext| {
            ext.check_bounds(ptr, len, CheckMode::new(Provenance::Incomplete, mode.access))
        });
        self.reported(result, site)
    }

    /// Pointer arithmetic check: `dest` must stay within (or one past) the
    /// object `source` points into.
    pub fn check_arithmetic(
        &self,
        id: PoolId,
        source: usize,
        dest: usize,
        mode: CheckMode,
        site: Option<AllocSite>,
    ) -> Result<CheckOutcome, ViolationRecord> {
        RuntimeMetrics::inc(&self.metrics.checks);
        let result = match self.pool(id) {
            Some(pool) => pool.check_arithmetic(source, dest, mode),
            None => Ok(CheckOutcome::Unknown),
        };
        let result = self.fall_back_to_external(source, result, |ext| {
            ext.check_arithmetic(source, dest, CheckMode::default())
        });
        self.reported(result, site)
    }

    fn fall_back_to_external(
        &self,
        ptr: usize,
        result: Result<CheckOutcome, ViolationRecord>,
        check: impl FnOnce(&Pool) -> Result<CheckOutcome, ViolationRecord>,
    ) -> Result<CheckOutcome, ViolationRecord> {
        let missed = match &result {
            Ok(CheckOutcome::Unknown) => true,
            // A complete-provenance miss with nothing known about the address.
            Err(v) => ptr != 0 && v.object.is_none() && v.history.is_none(),
            Ok(_) => false,
        };
        if !missed {
            return result;
        }
        match check(&self.external) {
            Ok(CheckOutcome::Unknown) => {
                if matches!(result, Ok(CheckOutcome::Unknown)) {
                    RuntimeMetrics::inc(&self.metrics.incomplete_passes);
                }
                result
            }
            external => {
                RuntimeMetrics::inc(&self.metrics.external_hits);
                external
            }
        }
    }

    pub fn check_align(
        &self,
        id: PoolId,
        ptr: usize,
        element_size: usize,
        site: Option<AllocSite>,
    ) -> Result<(), ViolationRecord> {
        RuntimeMetrics::inc(&self.metrics.checks);
        let Some(pool) = self.pool(id) else {
            return Ok(());
        };
        self.reported(pool.check_align(ptr, element_size), site)
    }

    pub fn exact_check(
        &self,
        base: usize,
        result: usize,
        size: usize,
        site: Option<AllocSite>,
    ) -> Result<usize, ViolationRecord> {
        RuntimeMetrics::inc(&self.metrics.checks);
        self.reported(checks::exact_check(base, result, size), site)
    }

    pub fn fast_ls_check(
        &self,
        base: usize,
        result: usize,
        size: usize,
        len: usize,
        site: Option<AllocSite>,
    ) -> Result<(), ViolationRecord> {
        RuntimeMetrics::inc(&self.metrics.checks);
        self.reported(checks::fast_ls_check(base, result, size, len), site)
    }

    /// Indirect call check. An incomplete target list can not prove a call
    /// wrong, so it always passes.
    pub fn check_call_target(
        &self,
        target: usize,
        targets: &[usize],
        provenance: Provenance,
        site: Option<AllocSite>,
    ) -> Result<(), ViolationRecord> {
        RuntimeMetrics::inc(&self.metrics.checks);
        if provenance == Provenance::Incomplete {
            return Ok(());
        }
        self.reported(checks::check_call_target(target, targets), site)
    }

    /// Verify that the C string at `ptr` is terminated inside its object.
    /// Returns the string length when it is, or `None` when no registered
    /// object covers `ptr`.
    ///
    /// # Safety
    ///
    /// Every object registered in pool `id` and in the external pool must be
    /// readable for its whole registered extent.
    pub unsafe fn check_cstring(
        &self,
        id: PoolId,
        ptr: usize,
        function: &str,
        site: Option<AllocSite>,
    ) -> Result<Option<usize>, ViolationRecord> {
        RuntimeMetrics::inc(&self.metrics.checks);
        if ptr == 0 {
            return Ok(None);
        }
        let record = self
            .pool(id)
            .and_then(|pool| pool.object_at(ptr))
            .or_else(|| self.external.object_at(ptr));
        let Some(record) = record else {
            RuntimeMetrics::inc(&self.metrics.incomplete_passes);
            return Ok(None);
        };
        let avail = record.region.end() - ptr;
        // SAFETY: [ptr, end) lies inside a registered object, which the
        // caller guarantees is readable.
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, avail) };
        let result = match bytes.iter().position(|&b| b == 0) {
            Some(len) => Ok(Some(len)),
            None => Err(ViolationRecord::new(ViolationKind::CLibrary, ptr)
                .with_record(record)
                .with_function(function)),
        };
        self.reported(result, site)
    }

    // -- shadow pages ------------------------------------------------------

    /// Alias the pages holding `[ptr, ptr + len)` at a fresh address and
    /// return the aliased `ptr`. The memory must be a shared mapping.
    pub fn shadow(&self, ptr: usize, len: usize) -> Result<usize, PageError> {
        if ptr == 0 || len == 0 {
            return Err(PageError::EmptyRequest);
        }
        let page = self.pages.page_size();
        let canonical = ptr & !(page - 1);
        let region = MemoryRegion::with_len(ptr, len)?;
        let pages = (region.end() - canonical).div_ceil(page);
        let shadow = self.pages.remap(canonical, pages)?;
        self.shadows.lock().insert(
            shadow,
            ShadowMapping {
                canonical,
                shadow,
                pages,
            },
        );
        Ok(shadow + (ptr - canonical))
    }

    /// Revoke access through a shadow so any later use traps. Returns the
    /// mapping, or `None` if `shadow_ptr` was not produced by [`Self::shadow`].
    pub fn unshadow(&self, shadow_ptr: usize) -> Result<Option<ShadowMapping>, PageError> {
        let base = shadow_ptr & !(self.pages.page_size() - 1);
        let Some(mapping) = self.shadows.lock().remove(&base) else {
            return Ok(None);
        };
        self.pages.protect(mapping.shadow, mapping.pages)?;
        Ok(Some(mapping))
    }

    /// Canonical address behind a shadowed pointer.
    #[must_use]
    pub fn canonical_of(&self, ptr: usize) -> Option<usize> {
        let shadows = self.shadows.lock();
        shadows.values().find_map(|m| {
            let len = m.pages * self.pages.page_size();
            MemoryRegion::with_len(m.shadow, len)
                .ok()
                .filter(|r| r.contains(ptr))
                .map(|_| m.canonical + (ptr - m.shadow))
        })
    }

    // -- allocator adapters ------------------------------------------------

    /// Append a custom allocator; earlier adapters keep priority.
    pub fn register_allocator(&self, adapter: AllocatorAdapter) {
        self.allocators.write().register(adapter);
    }

    /// Register the object an allocation call produced.
    ///
    /// `measure` returns the length of the string at an address and is only
    /// used by string allocators. Calls no adapter recognizes, failed
    /// allocations and unknown sizes register nothing. Objects from adapters
    /// added with [`Self::register_allocator`] are recorded as custom.
    pub fn on_allocation(
        &self,
        id: PoolId,
        call: &CallSite<'_>,
        measure: impl FnOnce(usize) -> Option<usize>,
        site: Option<AllocSite>,
    ) -> Result<Option<Registration>, ViolationRecord> {
        let allocators = self.allocators.read();
        let Some((adapter, kind)) = allocators.find_alloc(call) else {
            return Ok(None);
        };
        let Some(size) = adapter.size_of(call, measure) else {
            return Ok(None);
        };
        let new_ptr = adapter.allocated_pointer_of(call);
        match adapter.reallocated_pointer_of(call) {
            Some(old_ptr) => self.reregister_as(id, new_ptr, old_ptr, size, kind, site),
            None => Ok(self.register(id, new_ptr, size, kind, site)),
        }
    }

    /// Unregister the object a deallocation call releases.
    pub fn on_deallocation(
        &self,
        id: PoolId,
        call: &CallSite<'_>,
        site: Option<AllocSite>,
    ) -> Result<Option<ObjectRecord>, ViolationRecord> {
        let freed = {
            let allocators = self.allocators.read();
            allocators
                .find_free(call)
                .and_then(|adapter| adapter.freed_pointer_of(call))
        };
        match freed {
            Some(ptr) => self.unregister(id, ptr, site),
            None => Ok(None),
        }
    }
}
