//! Object regions and the per-object metadata stored in a pool.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::RegionError;

/// Half-open byte range `[begin, end)` with `begin < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MemoryRegion {
    begin: usize,
    end: usize,
}

impl MemoryRegion {
    /// Build a region from its bounds. Empty and inverted ranges are rejected.
    pub const fn new(begin: usize, end: usize) -> Result<Self, RegionError> {
        if begin >= end {
            return Err(RegionError::Empty { begin, end });
        }
        Ok(Self { begin, end })
    }

    /// Build a region from a start address and a byte length.
    pub const fn with_len(begin: usize, len: usize) -> Result<Self, RegionError> {
        match begin.checked_add(len) {
            Some(end) => Self::new(begin, end),
            None => Err(RegionError::Overflow { begin, len }),
        }
    }

    #[must_use]
    pub const fn begin(self) -> usize {
        self.begin
    }

    #[must_use]
    pub const fn end(self) -> usize {
        self.end
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.end - self.begin
    }

    /// Address of the last byte of the object.
    #[must_use]
    pub const fn last(self) -> usize {
        self.end - 1
    }

    #[must_use]
    pub const fn contains(self, addr: usize) -> bool {
        self.begin <= addr && addr < self.end
    }

    /// True when `[addr, addr + len)` lies entirely inside the region.
    #[must_use]
    pub const fn contains_span(self, addr: usize, len: usize) -> bool {
        if addr < self.begin {
            return false;
        }
        match addr.checked_add(len) {
            Some(end) => end <= self.end,
            None => false,
        }
    }

    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Smallest region covering both `self` and `other`.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.begin, self.end)
    }
}

/// How an object came to be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocKind {
    Global,
    Stack,
    Heap,
    /// Copy of an argument passed by value.
    ByVal,
    /// Returned by an allocator known only through an adapter.
    Custom,
    /// Memory the program did not allocate itself (argv, environ, errno).
    External,
}

impl AllocKind {
    /// Kinds that may legitimately be handed to a deallocator.
    #[must_use]
    pub const fn is_heap(self) -> bool {
        matches!(self, Self::Heap | Self::Custom)
    }

    /// Kinds whose overlapping re-registration widens the existing record
    /// (linker-merged constants, re-entered frames) instead of replacing it.
    #[must_use]
    pub const fn merges_on_overlap(self) -> bool {
        matches!(self, Self::Global | Self::Stack | Self::External)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Stack => "stack",
            Self::Heap => "heap",
            Self::ByVal => "byval",
            Self::Custom => "custom",
            Self::External => "external",
        }
    }
}

/// Where an allocation, deallocation or check happened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct AllocSite {
    /// Opaque tag chosen by the instrumentation.
    pub tag: u32,
    /// Program counter of the call, 0 when unknown.
    pub pc: usize,
    pub source: Option<&'static str>,
    pub line: u32,
}

impl AllocSite {
    #[must_use]
    pub const fn tagged(tag: u32) -> Self {
        Self {
            tag,
            pc: 0,
            source: None,
            line: 0,
        }
    }

    #[must_use]
    pub const fn with_pc(mut self, pc: usize) -> Self {
        self.pc = pc;
        self
    }

    /// Attach a source location. The file name is interned.
    #[must_use]
    pub fn with_source(mut self, source: &str, line: u32) -> Self {
        self.source = Some(intern_source(source));
        self.line = line;
        self
    }
}

static SOURCE_NAMES: Mutex<Option<HashSet<&'static str>>> = Mutex::new(None);

/// Return a process-lifetime copy of a source file name.
///
/// Each distinct name is leaked once; instrumented programs name a bounded
/// set of translation units.
pub fn intern_source(name: &str) -> &'static str {
    let mut guard = SOURCE_NAMES.lock();
    let names = guard.get_or_insert_with(HashSet::new);
    if let Some(existing) = names.get(name) {
        return existing;
    }
    let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
    names.insert(leaked);
    leaked
}

/// Liveness of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Live,
    /// Deallocated but kept for use-after-free and double-free detection.
    Retired,
}

/// Metadata for one registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectRecord {
    pub region: MemoryRegion,
    pub kind: AllocKind,
    pub state: ObjectState,
    /// Process-wide allocation sequence number.
    pub alloc_id: u64,
    pub alloc_site: Option<AllocSite>,
    /// Process-wide free sequence number, 0 while live.
    pub free_id: u64,
    pub free_site: Option<AllocSite>,
}

impl ObjectRecord {
    #[must_use]
    pub const fn live(
        region: MemoryRegion,
        kind: AllocKind,
        alloc_id: u64,
        alloc_site: Option<AllocSite>,
    ) -> Self {
        Self {
            region,
            kind,
            state: ObjectState::Live,
            alloc_id,
            alloc_site,
            free_id: 0,
            free_site: None,
        }
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.region.len()
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.state, ObjectState::Live)
    }

    /// Mark the record as deallocated.
    #[must_use]
    pub const fn retire(mut self, free_id: u64, free_site: Option<AllocSite>) -> Self {
        self.state = ObjectState::Retired;
        self.free_id = free_id;
        self.free_site = free_site;
        self
    }
}
