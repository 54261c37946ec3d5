//! Checks that need no pool lookup.
//!
//! The instrumentation emits these when it already knows the object the
//! pointer was derived from (a fixed-size array, a global), or the full set
//! of legal indirect call targets.

use crate::violation::{ViolationKind, ViolationRecord};
use crate::region::MemoryRegion;

/// Verify that `result` still points into `[base, base + size)`.
pub fn exact_check(base: usize, result: usize, size: usize) -> Result<usize, ViolationRecord> {
    let Ok(object) = MemoryRegion::with_len(base, size) else {
        return Err(ViolationRecord::new(ViolationKind::OutOfBounds, result));
    };
    if object.contains(result) {
        return Ok(result);
    }
    Err(ViolationRecord::new(ViolationKind::OutOfBounds, result).with_object(object))
}

/// Verify that a `len`-byte access at `result` stays inside `[base, base + size)`.
pub fn fast_ls_check(
    base: usize,
    result: usize,
    size: usize,
    len: usize,
) -> Result<(), ViolationRecord> {
    let Ok(object) = MemoryRegion::with_len(base, size) else {
        return Err(ViolationRecord::new(ViolationKind::LoadStore, result));
    };
    if len == 0 || object.contains_span(result, len) {
        return Ok(());
    }
    Err(ViolationRecord::new(ViolationKind::LoadStore, result).with_object(object))
}

/// Verify that an indirect call goes to one of `targets`.
pub fn check_call_target(target: usize, targets: &[usize]) -> Result<(), ViolationRecord> {
    if targets.contains(&target) {
        return Ok(());
    }
    Err(ViolationRecord::new(ViolationKind::InvalidCall, target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_check_accepts_interior_and_rejects_one_past_end() {
        assert_eq!(exact_check(0x100, 0x100, 16), Ok(0x100));
        assert_eq!(exact_check(0x100, 0x10f, 16), Ok(0x10f));
        let err = exact_check(0x100, 0x110, 16).unwrap_err();
        assert_eq!(err.kind, ViolationKind::OutOfBounds);
        assert_eq!(err.object, Some(MemoryRegion::with_len(0x100, 16).unwrap()));
        assert!(exact_check(0x100, 0xff, 16).is_err());
    }

    #[test]
    fn fast_ls_check_bounds_whole_access() {
        assert!(fast_ls_check(0x100, 0x10c, 16, 4).is_ok());
        let err = fast_ls_check(0x100, 0x10d, 16, 4).unwrap_err();
        assert_eq!(err.kind, ViolationKind::LoadStore);
        assert!(fast_ls_check(0x100, 0x200, 16, 0).is_ok());
    }

    #[test]
    fn zero_sized_object_never_passes() {
        assert!(exact_check(0x100, 0x100, 0).is_err());
        assert!(fast_ls_check(0x100, 0x100, 0, 1).is_err());
    }

    #[test]
    fn call_target_must_be_listed() {
        let targets = [0x4000, 0x4100];
        assert!(check_call_target(0x4100, &targets).is_ok());
        let err = check_call_target(0x4200, &targets).unwrap_err();
        assert_eq!(err.kind, ViolationKind::InvalidCall);
        assert_eq!(err.fault_ptr, 0x4200);
        assert_eq!(err.cwe, None);
    }
}
