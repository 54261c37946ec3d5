//! Violation taxonomy and the record handed to the reporter.
//!
//! Numeric codes are part of the log format and are stable: the one-line
//! summary prints them and test tooling matches on them.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::region::{AllocKind, AllocSite, MemoryRegion, ObjectRecord};

/// Kind of detected violation, in log-code order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ViolationKind {
    /// Access through a pointer of unproven provenance into freed memory.
    WarnLoadStore = 0,
    DanglingPointer = 1,
    DoubleFree = 2,
    InvalidFree = 3,
    NotHeapFree = 4,
    OutOfBounds = 5,
    LoadStore = 6,
    Alignment = 7,
    WriteOutOfBounds = 8,
    Uninitialized = 9,
    CLibrary = 10,
    InvalidCall = 11,
}

impl ViolationKind {
    pub const ALL: [Self; 12] = [
        Self::WarnLoadStore,
        Self::DanglingPointer,
        Self::DoubleFree,
        Self::InvalidFree,
        Self::NotHeapFree,
        Self::OutOfBounds,
        Self::LoadStore,
        Self::Alignment,
        Self::WriteOutOfBounds,
        Self::Uninitialized,
        Self::CLibrary,
        Self::InvalidCall,
    ];

    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        if (code as usize) < Self::ALL.len() {
            Some(Self::ALL[code as usize])
        } else {
            None
        }
    }

    /// Warnings are logged but never count against the error budget.
    #[must_use]
    pub const fn is_warning(self) -> bool {
        matches!(self, Self::WarnLoadStore)
    }

    /// Symbolic name used in traces and JSON output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::WarnLoadStore => "WARN_LOAD_STORE",
            Self::DanglingPointer => "FAULT_DANGLING_PTR",
            Self::DoubleFree => "FAULT_DOUBLE_FREE",
            Self::InvalidFree => "FAULT_INVALID_FREE",
            Self::NotHeapFree => "FAULT_NOTHEAP_FREE",
            Self::OutOfBounds => "FAULT_OUT_OF_BOUNDS",
            Self::LoadStore => "FAULT_LOAD_STORE",
            Self::Alignment => "FAULT_ALIGN",
            Self::WriteOutOfBounds => "FAULT_WRITE_OUT_OF_BOUNDS",
            Self::Uninitialized => "FAULT_UNINIT",
            Self::CLibrary => "FAULT_CSTDLIB",
            Self::InvalidCall => "FAULT_CALL",
        }
    }

    #[must_use]
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.symbol() == symbol)
    }

    /// Human-readable error type printed in the alert block.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::WarnLoadStore => "Potential Load/Store Error",
            Self::DanglingPointer => "Use After Free Error",
            Self::DoubleFree => "Double Free Error",
            Self::InvalidFree => "Invalid Free Error",
            Self::NotHeapFree => "Freeing Non-Heap Object Error",
            Self::OutOfBounds => "Out of Bounds Error",
            Self::LoadStore => "Load/Store Error",
            Self::Alignment => "Alignment Error",
            Self::WriteOutOfBounds => "Writing Out of Bounds Error",
            Self::Uninitialized => "Uninitialized/NULL Pointer Error",
            Self::CLibrary => "C Library Undefined Behavior",
            Self::InvalidCall => "Invalid Call Target Error",
        }
    }

    /// Weakness id attached when the detecting check has no better one.
    #[must_use]
    pub const fn default_cwe(self) -> Option<Cwe> {
        match self {
            Self::WarnLoadStore | Self::DanglingPointer => Some(Cwe::UseAfterFree),
            Self::DoubleFree => Some(Cwe::DoubleFree),
            Self::InvalidFree => Some(Cwe::FreeNotStart),
            Self::NotHeapFree => Some(Cwe::FreeNotHeap),
            Self::OutOfBounds
            | Self::LoadStore
            | Self::Alignment
            | Self::WriteOutOfBounds
            | Self::CLibrary => Some(Cwe::BufferOverflow),
            Self::Uninitialized => Some(Cwe::NullDereference),
            Self::InvalidCall => None,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Serialized as its log symbol, e.g. `FAULT_OUT_OF_BOUNDS`.
impl Serialize for ViolationKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

/// Common Weakness Enumeration ids the runtime can attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Cwe {
    BufferOverflow = 120,
    StackOverflow = 121,
    HeapOverflow = 122,
    DoubleFree = 415,
    UseAfterFree = 416,
    NullDereference = 476,
    FreeNotHeap = 590,
    FreeNotStart = 761,
}

impl Cwe {
    #[must_use]
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Refine a generic overflow by where the overflowed object lives.
    #[must_use]
    pub const fn overflow_for(kind: AllocKind) -> Self {
        match kind {
            AllocKind::Heap | AllocKind::Custom => Self::HeapOverflow,
            AllocKind::Stack | AllocKind::ByVal => Self::StackOverflow,
            AllocKind::Global | AllocKind::External => Self::BufferOverflow,
        }
    }
}

/// Serialized as the numeric CWE id.
impl Serialize for Cwe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.id())
    }
}

/// A detected violation, built at check-failure time and consumed by the
/// reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    pub kind: ViolationKind,
    pub fault_ptr: usize,
    pub pc: usize,
    pub cwe: Option<Cwe>,
    /// Source location of the failing check.
    pub site: Option<AllocSite>,
    /// Bounds of the object the pointer was checked against.
    pub object: Option<MemoryRegion>,
    /// Required alignment for alignment faults.
    pub alignment: Option<usize>,
    /// Library function for C library faults.
    pub function: Option<String>,
    /// Allocation and free history of the object involved.
    pub history: Option<ObjectRecord>,
}

impl ViolationRecord {
    #[must_use]
    pub fn new(kind: ViolationKind, fault_ptr: usize) -> Self {
        Self {
            kind,
            fault_ptr,
            pc: 0,
            cwe: kind.default_cwe(),
            site: None,
            object: None,
            alignment: None,
            function: None,
            history: None,
        }
    }

    #[must_use]
    pub fn with_pc(mut self, pc: usize) -> Self {
        self.pc = pc;
        self
    }

    #[must_use]
    pub fn with_cwe(mut self, cwe: Cwe) -> Self {
        self.cwe = Some(cwe);
        self
    }

    /// Attach the check site. Its program counter fills in `pc` when unset.
    #[must_use]
    pub fn with_site(mut self, site: AllocSite) -> Self {
        if self.pc == 0 {
            self.pc = site.pc;
        }
        self.site = Some(site);
        self
    }

    #[must_use]
    pub fn with_object(mut self, region: MemoryRegion) -> Self {
        self.object = Some(region);
        self
    }

    /// Attach an object's bounds and history in one step.
    #[must_use]
    pub fn with_record(mut self, record: ObjectRecord) -> Self {
        self.object = Some(record.region);
        self.history = Some(record);
        self
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    #[must_use]
    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.kind.is_warning()
    }

    /// The one-line summary that precedes the alert block.
    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "Violation Type {:#x} when accessing {:#x} at IP={:#x}",
            self.kind.code(),
            self.fault_ptr,
            self.pc
        )
    }
}

const RULE: &str = "=======+++++++    POOLGUARD RUNTIME ALERT +++++++=======";

fn field(f: &mut fmt::Formatter<'_>, label: &str, value: impl fmt::Display) -> fmt::Result {
    writeln!(f, "= {label:<38}:\t{value}")
}

fn location(site: Option<AllocSite>) -> String {
    match site {
        Some(AllocSite {
            source: Some(source),
            line,
            ..
        }) => format!("{source}:{line}"),
        Some(AllocSite { line, .. }) => format!("UNKNOWN:{line}"),
        None => "UNKNOWN:0".to_owned(),
    }
}

impl fmt::Display for ViolationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary_line())?;
        writeln!(f)?;
        writeln!(f, "{RULE}")?;
        field(f, "Error type", self.kind.description())?;
        match self.cwe {
            Some(cwe) => field(f, "CWE ID", cwe.id())?,
            None => field(f, "CWE ID", "none")?,
        }
        field(f, "Faulting pointer", format_args!("{:#x}", self.fault_ptr))?;
        field(f, "Program counter", format_args!("{:#x}", self.pc))?;
        if self.site.is_some() {
            field(f, "Fault PC Source", location(self.site))?;
        }
        if let Some(object) = self.object {
            field(f, "Object start", format_args!("{:#x}", object.begin()))?;
            field(f, "Object length", format_args!("{:#x}", object.len()))?;
        }
        if let Some(alignment) = self.alignment {
            field(f, "Alignment", format_args!("{alignment:#x}"))?;
        }
        if let Some(function) = &self.function {
            field(f, "Library function", function)?;
        }
        if let Some(history) = &self.history {
            writeln!(f, "=")?;
            field(f, "Object allocation kind", history.kind.as_str())?;
            field(
                f,
                "Object allocated at PC",
                format_args!("{:#x}", history.alloc_site.map_or(0, |s| s.pc)),
            )?;
            field(f, "Allocated in Source File", location(history.alloc_site))?;
            if history.alloc_id != 0 {
                field(f, "Object allocation sequence number", history.alloc_id)?;
            }
            if history.free_id != 0 {
                writeln!(f, "=")?;
                field(
                    f,
                    "Object freed at PC",
                    format_args!("{:#x}", history.free_site.map_or(0, |s| s.pc)),
                )?;
                field(f, "Freed in Source File", location(history.free_site))?;
                field(f, "Object free sequence number", history.free_id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy_order() {
        for (i, kind) in ViolationKind::ALL.iter().enumerate() {
            assert_eq!(kind.code() as usize, i);
            assert_eq!(ViolationKind::from_code(i as u32), Some(*kind));
        }
        assert_eq!(ViolationKind::from_code(12), None);
        assert_eq!(ViolationKind::DoubleFree.code(), 2);
        assert_eq!(ViolationKind::InvalidCall.code(), 11);
    }

    #[test]
    fn only_load_store_warning_is_a_warning() {
        let warnings: Vec<_> = ViolationKind::ALL
            .into_iter()
            .filter(|k| k.is_warning())
            .collect();
        assert_eq!(warnings, vec![ViolationKind::WarnLoadStore]);
    }

    #[test]
    fn symbols_round_trip() {
        for kind in ViolationKind::ALL {
            assert_eq!(ViolationKind::from_symbol(kind.symbol()), Some(kind));
        }
        assert_eq!(ViolationKind::from_symbol("FAULT_BOGUS"), None);
    }

    #[test]
    fn cwe_ids_match_catalog() {
        assert_eq!(Cwe::BufferOverflow.id(), 120);
        assert_eq!(Cwe::DoubleFree.id(), 415);
        assert_eq!(Cwe::UseAfterFree.id(), 416);
        assert_eq!(Cwe::NullDereference.id(), 476);
        assert_eq!(Cwe::FreeNotHeap.id(), 590);
        assert_eq!(Cwe::FreeNotStart.id(), 761);
        assert_eq!(Cwe::overflow_for(AllocKind::Heap), Cwe::HeapOverflow);
        assert_eq!(Cwe::overflow_for(AllocKind::Custom), Cwe::HeapOverflow);
        assert_eq!(Cwe::overflow_for(AllocKind::ByVal), Cwe::StackOverflow);
        assert_eq!(Cwe::overflow_for(AllocKind::External), Cwe::BufferOverflow);
    }

    #[test]
    fn summary_line_format() {
        let v = ViolationRecord::new(ViolationKind::OutOfBounds, 0x1400).with_pc(0x4011a0);
        assert_eq!(
            v.summary_line(),
            "Violation Type 0x5 when accessing 0x1400 at IP=0x4011a0"
        );
    }

    #[test]
    fn alert_block_lists_object_and_history() {
        let region = MemoryRegion::with_len(0x2000, 0x10).unwrap();
        let site = AllocSite::tagged(1).with_pc(0x400500).with_source("list.c", 42);
        let rec = ObjectRecord::live(region, AllocKind::Heap, 5, Some(site)).retire(6, None);
        let v = ViolationRecord::new(ViolationKind::DoubleFree, 0x2000).with_record(rec);
        let text = v.to_string();
        assert!(text.starts_with("Violation Type 0x2 when accessing 0x2000 at IP=0x0\n\n"));
        assert!(text.contains("POOLGUARD RUNTIME ALERT"));
        assert!(text.contains("= Error type                            :\tDouble Free Error\n"));
        assert!(text.contains("= CWE ID                                :\t415\n"));
        assert!(text.contains("= Object length                         :\t0x10\n"));
        assert!(text.contains("Allocated in Source File              :\tlist.c:42"));
        assert!(text.contains("Object free sequence number           :\t6"));
    }

    #[test]
    fn site_pc_fills_missing_pc() {
        let v = ViolationRecord::new(ViolationKind::OutOfBounds, 1)
            .with_site(AllocSite::tagged(0).with_pc(0x99));
        assert_eq!(v.pc, 0x99);
        let v = ViolationRecord::new(ViolationKind::OutOfBounds, 1)
            .with_pc(0x11)
            .with_site(AllocSite::tagged(0).with_pc(0x99));
        assert_eq!(v.pc, 0x11);
    }

    #[test]
    fn serializes_to_json() {
        let v = ViolationRecord::new(ViolationKind::Alignment, 0x1003).with_alignment(4);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "FAULT_ALIGN");
        assert_eq!(json["alignment"], 4);
        assert_eq!(json["cwe"], 120);

        let v = ViolationRecord::new(ViolationKind::OutOfBounds, 0x1010).with_cwe(Cwe::HeapOverflow);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "FAULT_OUT_OF_BOUNDS");
        assert_eq!(json["cwe"], 122);
        let json = serde_json::to_value(ViolationRecord::new(ViolationKind::InvalidCall, 1)).unwrap();
        assert!(json["cwe"].is_null());
    }
}
