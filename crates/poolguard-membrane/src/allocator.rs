//! Allocator adapters: recognize allocation and deallocation calls and say
//! where the object and its size come from.
//!
//! Argument positions are 1-based, matching how call sites are described by
//! the instrumentation.

use crate::region::AllocKind;

/// One observed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite<'a> {
    pub callee: &'a str,
    pub args: &'a [usize],
    pub ret: usize,
}

impl<'a> CallSite<'a> {
    #[must_use]
    pub const fn new(callee: &'a str, args: &'a [usize], ret: usize) -> Self {
        Self { callee, args, ret }
    }

    /// The `n`th argument, counting from 1.
    #[must_use]
    pub fn arg(&self, n: usize) -> Option<usize> {
        n.checked_sub(1).and_then(|i| self.args.get(i).copied())
    }
}

/// How an allocator communicates object size and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorAdapter {
    /// Size is one argument.
    Simple {
        alloc: String,
        free: String,
        size_arg: usize,
        free_ptr_arg: usize,
    },
    /// Size is element size times element count.
    Array {
        alloc: String,
        free: String,
        count_arg: usize,
        size_arg: usize,
        free_ptr_arg: usize,
    },
    /// Returns a string; size is its measured length plus the terminator.
    String {
        alloc: String,
        free: String,
        free_ptr_arg: usize,
    },
    /// Resizes an existing object passed as an argument.
    Reallocating {
        alloc: String,
        free: String,
        old_ptr_arg: usize,
        size_arg: usize,
        free_ptr_arg: usize,
    },
}

impl AllocatorAdapter {
    #[must_use]
    pub fn simple(alloc: &str, free: &str) -> Self {
        Self::Simple {
            alloc: alloc.to_owned(),
            free: free.to_owned(),
            size_arg: 1,
            free_ptr_arg: 1,
        }
    }

    #[must_use]
    pub fn array(alloc: &str, free: &str, count_arg: usize, size_arg: usize) -> Self {
        Self::Array {
            alloc: alloc.to_owned(),
            free: free.to_owned(),
            count_arg,
            size_arg,
            free_ptr_arg: 1,
        }
    }

    #[must_use]
    pub fn string(alloc: &str, free: &str) -> Self {
        Self::String {
            alloc: alloc.to_owned(),
            free: free.to_owned(),
            free_ptr_arg: 1,
        }
    }

    #[must_use]
    pub fn reallocating(alloc: &str, free: &str, old_ptr_arg: usize, size_arg: usize) -> Self {
        Self::Reallocating {
            alloc: alloc.to_owned(),
            free: free.to_owned(),
            old_ptr_arg,
            size_arg,
            free_ptr_arg: 1,
        }
    }

    #[must_use]
    pub fn alloc_name(&self) -> &str {
        match self {
            Self::Simple { alloc, .. }
            | Self::Array { alloc, .. }
            | Self::String { alloc, .. }
            | Self::Reallocating { alloc, .. } => alloc,
        }
    }

    #[must_use]
    pub fn free_name(&self) -> &str {
        match self {
            Self::Simple { free, .. }
            | Self::Array { free, .. }
            | Self::String { free, .. }
            | Self::Reallocating { free, .. } => free,
        }
    }

    const fn free_ptr_arg(&self) -> usize {
        match *self {
            Self::Simple { free_ptr_arg, .. }
            | Self::Array { free_ptr_arg, .. }
            | Self::String { free_ptr_arg, .. }
            | Self::Reallocating { free_ptr_arg, .. } => free_ptr_arg,
        }
    }

    /// True when `call` allocates through this adapter.
    ///
    /// String allocators called with no arguments are only probing whether
    /// the function exists and allocate nothing.
    #[must_use]
    pub fn recognizes_alloc(&self, call: &CallSite<'_>) -> bool {
        if call.callee != self.alloc_name() {
            return false;
        }
        !matches!(self, Self::String { .. }) || !call.args.is_empty()
    }

    #[must_use]
    pub fn recognizes_free(&self, call: &CallSite<'_>) -> bool {
        call.callee == self.free_name()
    }

    /// Size of the object `call` allocated.
    ///
    /// `measure` returns the length of the string at an address; only the
    /// string adapter calls it. `None` means the size is unknown (for example
    /// the element count multiplication overflowed).
    pub fn size_of(
        &self,
        call: &CallSite<'_>,
        measure: impl FnOnce(usize) -> Option<usize>,
    ) -> Option<usize> {
        match *self {
            Self::Simple { size_arg, .. } | Self::Reallocating { size_arg, .. } => call.arg(size_arg),
            Self::Array {
                count_arg,
                size_arg,
                ..
            } => call.arg(count_arg)?.checked_mul(call.arg(size_arg)?),
            Self::String { .. } => {
                if call.ret == 0 {
                    return None;
                }
                measure(call.ret)?.checked_add(1)
            }
        }
    }

    /// Address of the object `call` allocated.
    #[must_use]
    pub fn allocated_pointer_of(&self, call: &CallSite<'_>) -> usize {
        call.ret
    }

    /// For reallocators, the object being resized.
    #[must_use]
    pub fn reallocated_pointer_of(&self, call: &CallSite<'_>) -> Option<usize> {
        match *self {
            Self::Reallocating { old_ptr_arg, .. } => call.arg(old_ptr_arg),
            _ => None,
        }
    }

    /// Address `call` deallocates.
    #[must_use]
    pub fn freed_pointer_of(&self, call: &CallSite<'_>) -> Option<usize> {
        call.arg(self.free_ptr_arg())
    }
}

/// Ordered adapter list. The first adapter that recognizes a call wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorRegistry {
    adapters: Vec<AllocatorAdapter>,
    /// Leading adapters that are standard allocators.
    builtin: usize,
}

impl AllocatorRegistry {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            adapters: Vec::new(),
            builtin: 0,
        }
    }

    /// The C library and C++ operator new/delete families.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(AllocatorAdapter::simple("malloc", "free"));
        registry.register(AllocatorAdapter::array("calloc", "free", 1, 2));
        registry.register(AllocatorAdapter::reallocating("realloc", "free", 1, 2));
        registry.register(AllocatorAdapter::string("strdup", "free"));
        registry.register(AllocatorAdapter::string("strndup", "free"));
        // operator new / delete, 64-bit then 32-bit size_t manglings
        registry.register(AllocatorAdapter::simple("_Znwm", "_ZdlPv"));
        registry.register(AllocatorAdapter::simple("_Znam", "_ZdaPv"));
        registry.register(AllocatorAdapter::simple("_Znwj", "_ZdlPv"));
        registry.register(AllocatorAdapter::simple("_Znaj", "_ZdaPv"));
        registry.builtin = registry.adapters.len();
        registry
    }

    pub fn register(&mut self, adapter: AllocatorAdapter) {
        self.adapters.push(adapter);
    }

    /// Adapter for an allocation call and the kind of object it yields:
    /// standard allocators produce heap objects, later additions custom ones.
    #[must_use]
    pub fn find_alloc(&self, call: &CallSite<'_>) -> Option<(&AllocatorAdapter, AllocKind)> {
        let (i, adapter) = self
            .adapters
            .iter()
            .enumerate()
            .find(|(_, a)| a.recognizes_alloc(call))?;
        let kind = if i < self.builtin {
            AllocKind::Heap
        } else {
            AllocKind::Custom
        };
        Some((adapter, kind))
    }

    #[must_use]
    pub fn find_free(&self, call: &CallSite<'_>) -> Option<&AllocatorAdapter> {
        self.adapters.iter().find(|a| a.recognizes_free(call))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocatorAdapter> {
        self.adapters.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_strings(_: usize) -> Option<usize> {
        None
    }

    #[test]
    fn array_size_is_count_times_element() {
        let calloc = AllocatorAdapter::array("calloc", "free", 1, 2);
        let args = [10, 4];
        let call = CallSite::new("calloc", &args, 0x1000);
        assert!(calloc.recognizes_alloc(&call));
        assert_eq!(calloc.size_of(&call, no_strings), Some(40));
    }

    #[test]
    fn array_overflow_is_unknown() {
        let calloc = AllocatorAdapter::array("calloc", "free", 1, 2);
        let args = [usize::MAX, 2];
        let call = CallSite::new("calloc", &args, 0x1000);
        assert_eq!(calloc.size_of(&call, no_strings), None);
    }

    #[test]
    fn string_adapter_needs_a_source_argument() {
        let strdup = AllocatorAdapter::string("strdup", "free");
        let bare = CallSite::new("strdup", &[], 0);
        assert!(!strdup.recognizes_alloc(&bare));
        let args = [0x500];
        let call = CallSite::new("strdup", &args, 0x2000);
        assert!(strdup.recognizes_alloc(&call));
        let size = strdup.size_of(&call, |p| (p == 0x2000).then_some(5));
        assert_eq!(size, Some(6));
    }

    #[test]
    fn reallocating_reads_pointer_and_size_from_arguments() {
        let realloc = AllocatorAdapter::reallocating("realloc", "free", 1, 2);
        let args = [0x3000, 128];
        let call = CallSite::new("realloc", &args, 0x4000);
        assert_eq!(realloc.reallocated_pointer_of(&call), Some(0x3000));
        assert_eq!(realloc.size_of(&call, no_strings), Some(128));
        assert_eq!(realloc.allocated_pointer_of(&call), 0x4000);
    }

    #[test]
    fn missing_argument_is_unknown() {
        let malloc = AllocatorAdapter::simple("malloc", "free");
        let call = CallSite::new("malloc", &[], 0x1000);
        assert_eq!(malloc.size_of(&call, no_strings), None);
        assert_eq!(call.arg(0), None);
    }

    #[test]
    fn registry_matches_first_registered() {
        let mut registry = AllocatorRegistry::with_defaults();
        registry.register(AllocatorAdapter::simple("pool_alloc", "free"));
        let args = [0x1000];
        let free_call = CallSite::new("free", &args, 0);
        assert_eq!(
            registry.find_free(&free_call).map(AllocatorAdapter::alloc_name),
            Some("malloc")
        );
        let args = [64];
        let custom = CallSite::new("pool_alloc", &args, 0x9000);
        let (adapter, kind) = registry.find_alloc(&custom).unwrap();
        assert_eq!(adapter.alloc_name(), "pool_alloc");
        assert_eq!(kind, AllocKind::Custom);
        let malloc_args = [16];
        let malloc = CallSite::new("malloc", &malloc_args, 0x9000);
        assert_eq!(registry.find_alloc(&malloc).map(|(_, k)| k), Some(AllocKind::Heap));
        assert!(registry.find_alloc(&CallSite::new("mmap", &args, 0)).is_none());
    }

    #[test]
    fn defaults_cover_cxx_operators() {
        let registry = AllocatorRegistry::with_defaults();
        for name in ["_Znwm", "_Znam", "_Znwj", "_Znaj"] {
            let args = [16];
            assert!(registry.find_alloc(&CallSite::new(name, &args, 0x10)).is_some(), "{name}");
        }
        let args = [0x10];
        assert!(registry.find_free(&CallSite::new("_ZdaPv", &args, 0)).is_some());
        assert_eq!(registry.len(), 9);
    }
}
