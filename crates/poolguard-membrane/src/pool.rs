//! A pool: the set of objects the instrumentation proved a group of pointers
//! may refer to, and the checks answered against it.
//!
//! Each pool keeps two indexes behind one lock: live objects, and freed
//! objects retained for temporal checks. Splay lookups restructure the tree,
//! so every operation (checks included) takes the lock exclusively.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::RetentionPolicy;
use crate::interval_index::IntervalIndex;
use crate::page_supplier::PageSupplier;
use crate::region::{AllocKind, AllocSite, MemoryRegion, ObjectRecord};
use crate::violation::{Cwe, ViolationKind, ViolationRecord};

static NEXT_ALLOC_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_FREE_ID: AtomicU64 = AtomicU64::new(1);

/// Whether static analysis proved the checked pointer belongs to this pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Every object the pointer may target is registered here. A miss is a
    /// definite error.
    Complete,
    /// The pointer may target memory the runtime never saw. A miss passes.
    #[default]
    Incomplete,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    #[default]
    Read,
    Write,
}

/// How a bounds check interprets a miss and reports an overflow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckMode {
    pub provenance: Provenance,
    pub access: AccessKind,
}

impl CheckMode {
    /// Bit set in the C-level mode word for complete provenance.
    pub const COMPLETE_BIT: u32 = 1 << 0;
    /// Bit set in the C-level mode word for stores.
    pub const WRITE_BIT: u32 = 1 << 1;

    #[must_use]
    pub const fn new(provenance: Provenance, access: AccessKind) -> Self {
        Self { provenance, access }
    }

    #[must_use]
    pub const fn complete_read() -> Self {
        Self::new(Provenance::Complete, AccessKind::Read)
    }

    #[must_use]
    pub const fn complete_write() -> Self {
        Self::new(Provenance::Complete, AccessKind::Write)
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            provenance: if bits & Self::COMPLETE_BIT != 0 {
                Provenance::Complete
            } else {
                Provenance::Incomplete
            },
            access: if bits & Self::WRITE_BIT != 0 {
                AccessKind::Write
            } else {
                AccessKind::Read
            },
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        let mut bits = 0;
        if matches!(self.provenance, Provenance::Complete) {
            bits |= Self::COMPLETE_BIT;
        }
        if matches!(self.access, AccessKind::Write) {
            bits |= Self::WRITE_BIT;
        }
        bits
    }
}

/// Successful outcome of a bounds check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The access lies inside a live object of this pool.
    InBounds(MemoryRegion),
    /// Nothing to check (zero-length access).
    Empty,
    /// No object of this pool covers the pointer and provenance is
    /// incomplete; the caller may consult other sources.
    Unknown,
}

/// What a registration did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted(MemoryRegion),
    /// Overlapped a global or stack object; both were widened into one.
    Merged(MemoryRegion),
    /// Overlapped a stale record, which was dropped.
    Replaced {
        region: MemoryRegion,
        previous: ObjectRecord,
    },
}

impl Registration {
    #[must_use]
    pub const fn region(&self) -> MemoryRegion {
        match *self {
            Self::Inserted(region) | Self::Merged(region) | Self::Replaced { region, .. } => region,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub retained: usize,
    pub cache_hits: u64,
}

struct PoolState {
    live: IntervalIndex<ObjectRecord>,
    freed: IntervalIndex<ObjectRecord>,
    /// Retained frees in FIFO order, identified by (base, alloc id) so a
    /// stale entry never evicts a newer record at the same address.
    quarantine: VecDeque<(usize, u64)>,
    /// Two most recently found live objects.
    recent: [Option<ObjectRecord>; 2],
    cache_hits: u64,
}

impl PoolState {
    fn new(live: IntervalIndex<ObjectRecord>, freed: IntervalIndex<ObjectRecord>) -> Self {
        Self {
            live,
            freed,
            quarantine: VecDeque::new(),
            recent: [None; 2],
            cache_hits: 0,
        }
    }

    fn find_live(&mut self, addr: usize) -> Option<ObjectRecord> {
        for slot in 0..self.recent.len() {
            if let Some(rec) = self.recent[slot] {
                if rec.region.contains(addr) {
                    self.cache_hits += 1;
                    self.recent.swap(0, slot);
                    return Some(rec);
                }
            }
        }
        let (_, rec) = self.live.lookup(addr)?;
        self.recent[1] = self.recent[0];
        self.recent[0] = Some(rec);
        Some(rec)
    }

    fn find_freed(&mut self, addr: usize) -> Option<ObjectRecord> {
        self.freed.lookup(addr).map(|(_, rec)| rec)
    }

    fn invalidate_cache(&mut self) {
        self.recent = [None; 2];
    }

    fn evict_freed_overlapping(&mut self, region: MemoryRegion) {
        while let Some((stale, rec)) = self.freed.first_overlapping(region) {
            if self.freed.remove(stale).is_err() {
                break;
            }
            self.quarantine
                .retain(|&(base, alloc_id)| base != stale.begin() || alloc_id != rec.alloc_id);
        }
    }

    fn retire(
        &mut self,
        rec: ObjectRecord,
        site: Option<AllocSite>,
        retention: RetentionPolicy,
    ) -> ObjectRecord {
        let retired = rec.retire(NEXT_FREE_ID.fetch_add(1, Ordering::Relaxed), site);
        let RetentionPolicy::Retain { max_entries } = retention else {
            return retired;
        };
        if max_entries == 0 {
            return retired;
        }
        self.evict_freed_overlapping(retired.region);
        if self.freed.insert(retired.region, retired).is_ok() {
            self.quarantine
                .push_back((retired.region.begin(), retired.alloc_id));
        }
        while self.freed.len() > max_entries {
            let Some((base, alloc_id)) = self.quarantine.pop_front() else {
                break;
            };
            let current = self.freed.lookup(base);
            if matches!(current, Some((r, old)) if r.begin() == base && old.alloc_id == alloc_id) {
                let _ = self.freed.remove_at(base);
            }
        }
        retired
    }

    fn clear(&mut self) {
        self.live.clear();
        self.freed.clear();
        self.quarantine.clear();
        self.invalidate_cache();
    }
}

/// Object registry with bounds and temporal checks.
pub struct Pool {
    retention: RetentionPolicy,
    state: Mutex<PoolState>,
}

impl Pool {
    #[must_use]
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            retention,
            state: Mutex::new(PoolState::new(IntervalIndex::new(), IntervalIndex::new())),
        }
    }

    /// Pool whose index nodes come from `supplier`.
    #[must_use]
    pub fn with_supplier(retention: RetentionPolicy, supplier: &'static PageSupplier) -> Self {
        Self {
            retention,
            state: Mutex::new(PoolState::new(
                IntervalIndex::with_supplier(supplier),
                IntervalIndex::with_supplier(supplier),
            )),
        }
    }

    #[must_use]
    pub const fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Record a live object.
    ///
    /// Freed records the new object overlaps are forgotten (the address was
    /// reused). An overlapping global or stack object is widened to cover
    /// both; any other overlapping record is stale and replaced.
    pub fn register_object(
        &self,
        region: MemoryRegion,
        kind: AllocKind,
        site: Option<AllocSite>,
    ) -> Registration {
        let alloc_id = NEXT_ALLOC_ID.fetch_add(1, Ordering::Relaxed);
        let mut st = self.state.lock();
        st.invalidate_cache();
        st.evict_freed_overlapping(region);

        let mut record = ObjectRecord::live(region, kind, alloc_id, site);
        let mut merged = false;
        let mut previous = None;
        while let Some((existing_region, existing)) = st.live.first_overlapping(record.region) {
            if st.live.remove(existing_region).is_err() {
                break;
            }
            if kind.merges_on_overlap() && existing.kind.merges_on_overlap() {
                let widened = record.region.union(existing_region);
                record = ObjectRecord {
                    region: widened,
                    ..existing
                };
                merged = true;
            } else {
                previous = Some(existing);
            }
        }
        st.evict_freed_overlapping(record.region);
        let inserted = st.live.insert(record.region, record);
        debug_assert!(inserted.is_ok(), "overlaps were removed above");

        match (merged, previous) {
            (true, _) => Registration::Merged(record.region),
            (false, Some(previous)) => Registration::Replaced {
                region: record.region,
                previous,
            },
            (false, None) => Registration::Inserted(record.region),
        }
    }

    /// Register `size` bytes at `addr`; null pointers and zero sizes are ignored.
    pub fn register_raw(
        &self,
        addr: usize,
        size: usize,
        kind: AllocKind,
        site: Option<AllocSite>,
    ) -> Option<Registration> {
        if addr == 0 {
            return None;
        }
        let region = MemoryRegion::with_len(addr, size).ok()?;
        Some(self.register_object(region, kind, site))
    }

    /// Deallocate the heap object starting at `ptr`.
    ///
    /// Freeing null is a no-op. Anything other than the base of a live heap
    /// object yields a free violation and leaves the pool unchanged.
    pub fn unregister_object(
        &self,
        ptr: usize,
        site: Option<AllocSite>,
    ) -> Result<Option<ObjectRecord>, ViolationRecord> {
        if ptr == 0 {
            return Ok(None);
        }
        let mut st = self.state.lock();

        if let Some(rec) = st.find_live(ptr) {
            if !rec.kind.is_heap() {
                return Err(ViolationRecord::new(ViolationKind::NotHeapFree, ptr).with_record(rec));
            }
            if rec.region.begin() != ptr {
                return Err(ViolationRecord::new(ViolationKind::InvalidFree, ptr).with_record(rec));
            }
            st.invalidate_cache();
            let _ = st.live.remove_at(ptr);
            return Ok(Some(st.retire(rec, site, self.retention)));
        }

        if let Some(rec) = st.find_freed(ptr) {
            let kind = if rec.region.begin() == ptr {
                ViolationKind::DoubleFree
            } else {
                ViolationKind::InvalidFree
            };
            return Err(ViolationRecord::new(kind, ptr).with_record(rec));
        }

        Err(ViolationRecord::new(ViolationKind::NotHeapFree, ptr))
    }

    /// Drop a stack object at scope exit. Stack records are never retained.
    pub fn unregister_stack(&self, ptr: usize) -> Option<ObjectRecord> {
        let mut st = self.state.lock();
        st.invalidate_cache();
        st.live.remove_at(ptr).ok().map(|(_, rec)| rec)
    }

    /// Move a heap object after a reallocation.
    ///
    /// A null `old_ptr` is a plain allocation and a zero `size` a plain free.
    /// A null `new_ptr` with nonzero size means the reallocation failed and
    /// the old object stays live.
    pub fn reregister(
        &self,
        new_ptr: usize,
        old_ptr: usize,
        size: usize,
        kind: AllocKind,
        site: Option<AllocSite>,
    ) -> Result<Option<Registration>, ViolationRecord> {
        if old_ptr == 0 {
            return Ok(self.register_raw(new_ptr, size, kind, site));
        }
        if size == 0 {
            self.unregister_object(old_ptr, site)?;
            return Ok(None);
        }
        if new_ptr == 0 {
            return Ok(None);
        }
        self.unregister_object(old_ptr, site)?;
        Ok(self.register_raw(new_ptr, size, kind, site))
    }

    /// Verify a `len`-byte access at `ptr`.
    pub fn check_bounds(
        &self,
        ptr: usize,
        len: usize,
        mode: CheckMode,
    ) -> Result<CheckOutcome, ViolationRecord> {
        if len == 0 {
            return Ok(CheckOutcome::Empty);
        }
        let mut st = self.state.lock();

        if let Some(rec) = st.find_live(ptr) {
            if rec.region.contains_span(ptr, len) {
                return Ok(CheckOutcome::InBounds(rec.region));
            }
            let kind = match mode.access {
                AccessKind::Read => ViolationKind::OutOfBounds,
                AccessKind::Write => ViolationKind::WriteOutOfBounds,
            };
            let last_byte = ptr.saturating_add(len - 1);
            return Err(ViolationRecord::new(kind, last_byte)
                .with_record(rec)
                .with_cwe(Cwe::overflow_for(rec.kind)));
        }

        let freed = st.find_freed(ptr);
        match (mode.provenance, freed) {
            (Provenance::Complete, _) if ptr == 0 => {
                Err(ViolationRecord::new(ViolationKind::Uninitialized, ptr))
            }
            (Provenance::Complete, Some(rec)) => {
                Err(ViolationRecord::new(ViolationKind::DanglingPointer, ptr).with_record(rec))
            }
            (Provenance::Complete, None) => Err(ViolationRecord::new(ViolationKind::OutOfBounds, ptr)),
            (Provenance::Incomplete, Some(rec)) => {
                Err(ViolationRecord::new(ViolationKind::WarnLoadStore, ptr).with_record(rec))
            }
            (Provenance::Incomplete, None) => Ok(CheckOutcome::Unknown),
        }
    }

    /// Verify that `ptr` sits on an element boundary of its object.
    pub fn check_align(&self, ptr: usize, element_size: usize) -> Result<(), ViolationRecord> {
        if ptr == 0 || element_size == 0 {
            return Ok(());
        }
        let mut st = self.state.lock();
        match st.find_live(ptr) {
            Some(rec) if (ptr - rec.region.begin()) % element_size == 0 => Ok(()),
            Some(rec) => Err(ViolationRecord::new(ViolationKind::Alignment, ptr)
                .with_record(rec)
                .with_alignment(element_size)),
            None => Err(ViolationRecord::new(ViolationKind::Alignment, ptr).with_alignment(element_size)),
        }
    }

    /// Verify that pointer arithmetic from `source` produced `dest` inside
    /// the same object. One past the end is allowed.
    pub fn check_arithmetic(
        &self,
        source: usize,
        dest: usize,
        mode: CheckMode,
    ) -> Result<CheckOutcome, ViolationRecord> {
        let mut st = self.state.lock();
        if let Some(rec) = st.find_live(source) {
            if rec.region.begin() <= dest && dest <= rec.region.end() {
                return Ok(CheckOutcome::InBounds(rec.region));
            }
            return Err(ViolationRecord::new(ViolationKind::OutOfBounds, dest)
                .with_record(rec)
                .with_cwe(Cwe::overflow_for(rec.kind)));
        }
        // Indexing off a null pointer stays in the unmapped first page and
        // faults on use.
        if source < NULL_PAGE && dest < NULL_PAGE {
            return Ok(CheckOutcome::Empty);
        }
        let freed = st.find_freed(source);
        match (mode.provenance, freed) {
            (Provenance::Complete, Some(rec)) => {
                Err(ViolationRecord::new(ViolationKind::DanglingPointer, source).with_record(rec))
            }
            (Provenance::Complete, None) => Err(ViolationRecord::new(ViolationKind::OutOfBounds, dest)),
            (Provenance::Incomplete, _) => Ok(CheckOutcome::Unknown),
        }
    }

    /// Live object covering `addr`.
    pub fn object_at(&self, addr: usize) -> Option<ObjectRecord> {
        self.state.lock().find_live(addr)
    }

    /// Retained freed object covering `addr`.
    pub fn freed_object_at(&self, addr: usize) -> Option<ObjectRecord> {
        self.state.lock().find_freed(addr)
    }

    /// Live objects in address order.
    pub fn objects(&self) -> Vec<ObjectRecord> {
        self.state.lock().live.iter().map(|(_, rec)| rec).collect()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            live: st.live.len(),
            retained: st.freed.len(),
            cache_hits: st.cache_hits,
        }
    }

    /// Forget every record.
    pub fn destroy(&self) {
        self.state.lock().clear();
    }
}

/// Addresses below this are in the never-mapped first page.
const NULL_PAGE: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    fn region(begin: usize, len: usize) -> MemoryRegion {
        MemoryRegion::with_len(begin, len).unwrap()
    }

    fn retaining() -> Pool {
        Pool::new(RetentionPolicy::default())
    }

    #[test]
    fn register_then_check_every_offset() {
        let pool = retaining();
        pool.register_object(region(0x1000, 0x40), AllocKind::Heap, None);
        for p in 0x1000..0x1040 {
            assert!(matches!(
                pool.check_bounds(p, 1, CheckMode::complete_read()),
                Ok(CheckOutcome::InBounds(_))
            ));
        }
        let err = pool
            .check_bounds(0x1040 - 4 + 1, 4, CheckMode::complete_read())
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::OutOfBounds);
        assert_eq!(err.fault_ptr, 0x1040);
        assert_eq!(err.cwe, Some(Cwe::HeapOverflow));
    }

    #[test]
    fn write_overflow_has_its_own_kind() {
        let pool = retaining();
        pool.register_object(region(0x1000, 8), AllocKind::Stack, None);
        let err = pool
            .check_bounds(0x1004, 8, CheckMode::complete_write())
            .unwrap_err();
        assert_eq!(err.kind, ViolationKind::WriteOutOfBounds);
        assert_eq!(err.cwe, Some(Cwe::StackOverflow));
        assert_eq!(err.object, Some(region(0x1000, 8)));
    }

    #[test]
    fn zero_length_access_always_passes() {
        let pool = retaining();
        assert_eq!(
            pool.check_bounds(0xdead, 0, CheckMode::complete_read()),
            Ok(CheckOutcome::Empty)
        );
    }

    #[test]
    fn miss_depends_on_provenance() {
        let pool = retaining();
        assert_eq!(
            pool.check_bounds(0x5000, 4, CheckMode::default()),
            Ok(CheckOutcome::Unknown)
        );
        let err = pool.check_bounds(0x5000, 4, CheckMode::complete_read()).unwrap_err();
        assert_eq!(err.kind, ViolationKind::OutOfBounds);
        let err = pool.check_bounds(0, 4, CheckMode::complete_read()).unwrap_err();
        assert_eq!(err.kind, ViolationKind::Uninitialized);
        assert_eq!(err.cwe, Some(Cwe::NullDereference));
    }

    #[test]
    fn freed_object_access_is_dangling_or_warning() {
        let pool = retaining();
        pool.register_object(region(0x2000, 0x20), AllocKind::Heap, None);
        pool.unregister_object(0x2000, None).unwrap();

        let err = pool.check_bounds(0x2008, 4, CheckMode::complete_read()).unwrap_err();
        assert_eq!(err.kind, ViolationKind::DanglingPointer);
        assert!(err.history.is_some_and(|h| h.free_id != 0));

        let warn = pool.check_bounds(0x2008, 4, CheckMode::default()).unwrap_err();
        assert_eq!(warn.kind, ViolationKind::WarnLoadStore);
        assert!(warn.is_warning());
    }

    #[test]
    fn free_classification() {
        let pool = retaining();
        pool.register_object(region(0x2000, 0x10), AllocKind::Heap, None);
        pool.register_object(region(0x3000, 0x10), AllocKind::Global, None);

        let err = pool.unregister_object(0x2004, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::InvalidFree);
        assert_eq!(err.cwe, Some(Cwe::FreeNotStart));

        let err = pool.unregister_object(0x3000, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::NotHeapFree);
        assert!(pool.object_at(0x3000).is_some(), "global stays registered");

        assert!(pool.unregister_object(0x2000, None).unwrap().is_some());
        let err = pool.unregister_object(0x2000, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::DoubleFree);
        let err = pool.unregister_object(0x2008, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::InvalidFree);

        let err = pool.unregister_object(0x9000, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::NotHeapFree);
        assert_eq!(pool.unregister_object(0, None), Ok(None));
    }

    #[test]
    fn immediate_retention_forgets_frees() {
        let pool = Pool::new(RetentionPolicy::Immediate);
        pool.register_object(region(0x2000, 0x10), AllocKind::Heap, None);
        pool.unregister_object(0x2000, None).unwrap();
        assert_eq!(pool.stats().retained, 0);
        let err = pool.unregister_object(0x2000, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::NotHeapFree);
        let err = pool.check_bounds(0x2000, 1, CheckMode::complete_read()).unwrap_err();
        assert_eq!(err.kind, ViolationKind::OutOfBounds);
    }

    #[test]
    fn quarantine_evicts_oldest_first() {
        let pool = Pool::new(RetentionPolicy::Retain { max_entries: 2 });
        for base in [0x1000, 0x2000, 0x3000] {
            pool.register_object(region(base, 0x10), AllocKind::Heap, None);
            pool.unregister_object(base, None).unwrap();
        }
        assert_eq!(pool.stats().retained, 2);
        assert!(pool.freed_object_at(0x1000).is_none());
        assert!(pool.freed_object_at(0x3000).is_some());
    }

    #[test]
    fn address_reuse_evicts_freed_record() {
        let pool = retaining();
        pool.register_object(region(0x4000, 0x20), AllocKind::Heap, None);
        pool.unregister_object(0x4000, None).unwrap();
        pool.register_object(region(0x4010, 0x20), AllocKind::Heap, None);
        assert!(pool.freed_object_at(0x4000).is_none());
        assert_eq!(
            pool.check_bounds(0x4000, 1, CheckMode::default()),
            Ok(CheckOutcome::Unknown)
        );
    }

    #[test]
    fn reused_freed_record_does_not_count_against_quarantine() {
        let pool = Pool::new(RetentionPolicy::Retain { max_entries: 2 });
        for base in [0x1000, 0x2000] {
            pool.register_object(region(base, 0x10), AllocKind::Heap, None);
            pool.unregister_object(base, None).unwrap();
        }
        pool.register_object(region(0x2000, 0x10), AllocKind::Heap, None);
        assert_eq!(pool.stats().retained, 1);

        pool.register_object(region(0x3000, 0x10), AllocKind::Heap, None);
        pool.unregister_object(0x3000, None).unwrap();
        assert_eq!(pool.stats().retained, 2);
        assert!(pool.freed_object_at(0x1000).is_some());
        assert!(pool.freed_object_at(0x3000).is_some());

        pool.register_object(region(0x4000, 0x10), AllocKind::Heap, None);
        pool.unregister_object(0x4000, None).unwrap();
        assert_eq!(pool.stats().retained, 2);
        assert!(pool.freed_object_at(0x1000).is_none());
    }

    #[test]
    fn overlapping_globals_merge_and_heap_replaces() {
        let pool = retaining();
        pool.register_object(region(0x100, 0x10), AllocKind::Global, None);
        let reg = pool.register_object(region(0x108, 0x10), AllocKind::Global, None);
        assert_eq!(reg, Registration::Merged(MemoryRegion::new(0x100, 0x118).unwrap()));
        assert_eq!(pool.stats().live, 1);

        pool.register_object(region(0x800, 0x10), AllocKind::Heap, None);
        let reg = pool.register_object(region(0x800, 0x40), AllocKind::Heap, None);
        assert!(matches!(reg, Registration::Replaced { previous, .. } if previous.region == region(0x800, 0x10)));
        assert_eq!(pool.object_at(0x830).map(|r| r.size()), Some(0x40));
    }

    #[test]
    fn stack_unregister_is_not_retained() {
        let pool = retaining();
        pool.register_object(region(0x7000, 0x40), AllocKind::Stack, None);
        assert!(pool.unregister_stack(0x7000).is_some());
        assert!(pool.freed_object_at(0x7000).is_none());
        assert_eq!(
            pool.check_bounds(0x7000, 1, CheckMode::default()),
            Ok(CheckOutcome::Unknown)
        );
    }

    #[test]
    fn reregister_moves_the_object() {
        let pool = retaining();
        pool.reregister(0x1000, 0, 0x10, AllocKind::Heap, None).unwrap();
        assert!(pool.object_at(0x1000).is_some());
        pool.reregister(0x2000, 0x1000, 0x40, AllocKind::Heap, None).unwrap();
        assert!(pool.object_at(0x1000).is_none());
        assert_eq!(pool.object_at(0x2000).map(|r| r.size()), Some(0x40));
        pool.reregister(0, 0x2000, 0x80, AllocKind::Heap, None).unwrap();
        assert!(pool.object_at(0x2000).is_some(), "failed realloc keeps the object");
        pool.reregister(0, 0x2000, 0, AllocKind::Heap, None).unwrap();
        assert!(pool.object_at(0x2000).is_none());
        let err = pool.reregister(0x3000, 0x2000, 8, AllocKind::Heap, None).unwrap_err();
        assert_eq!(err.kind, ViolationKind::DoubleFree);
    }

    #[test]
    fn alignment_check() {
        let pool = retaining();
        pool.register_object(region(0x1000, 0x40), AllocKind::Heap, None);
        assert!(pool.check_align(0x1008, 4).is_ok());
        let err = pool.check_align(0x1003, 4).unwrap_err();
        assert_eq!(err.kind, ViolationKind::Alignment);
        assert_eq!(err.cwe, Some(Cwe::BufferOverflow));
        assert_eq!(err.alignment, Some(4));
        assert!(pool.check_align(0, 4).is_ok());
        assert!(pool.check_align(0x1003, 0).is_ok());
        let err = pool.check_align(0x9000, 8).unwrap_err();
        assert_eq!(err.object, None);
    }

    #[test]
    fn arithmetic_allows_one_past_end() {
        let pool = retaining();
        pool.register_object(region(0x1000, 0x10), AllocKind::Heap, None);
        assert!(pool.check_arithmetic(0x1000, 0x1010, CheckMode::complete_read()).is_ok());
        let err = pool
            .check_arithmetic(0x1000, 0x1011, CheckMode::complete_read())
            .unwrap_err();
        assert_eq!(err.fault_ptr, 0x1011);
        assert!(pool.check_arithmetic(0, 0x20, CheckMode::complete_read()).is_ok());
        assert!(pool.check_arithmetic(0x9000, 0x9004, CheckMode::default()).is_ok());
        assert!(pool.check_arithmetic(0x9000, 0x9004, CheckMode::complete_read()).is_err());
    }

    #[test]
    fn recent_cache_counts_hits_and_is_invalidated() {
        let pool = retaining();
        pool.register_object(region(0x1000, 0x10), AllocKind::Heap, None);
        pool.check_bounds(0x1000, 1, CheckMode::default()).unwrap();
        pool.check_bounds(0x1004, 1, CheckMode::default()).unwrap();
        assert_eq!(pool.stats().cache_hits, 1);
        pool.unregister_object(0x1000, None).unwrap();
        assert!(pool.check_bounds(0x1004, 1, CheckMode::complete_read()).is_err());
    }

    #[test]
    fn mode_bits_round_trip() {
        for bits in 0..4 {
            assert_eq!(CheckMode::from_bits(bits).bits(), bits);
        }
        assert_eq!(CheckMode::from_bits(0), CheckMode::default());
    }

    #[test]
    fn destroy_forgets_everything() {
        let pool = retaining();
        pool.register_object(region(0x1000, 0x10), AllocKind::Heap, None);
        pool.register_object(region(0x2000, 0x10), AllocKind::Heap, None);
        pool.unregister_object(0x2000, None).unwrap();
        pool.destroy();
        let stats = pool.stats();
        assert_eq!((stats.live, stats.retained), (0, 0));
        assert!(pool.object_at(0x1000).is_none());
    }
}
