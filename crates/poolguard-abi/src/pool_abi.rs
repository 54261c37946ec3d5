//! Pool entry points inserted by the instrumentation.
//!
//! Every entry point tolerates an uninitialized runtime (re-entry during
//! startup) and unknown pool descriptors by doing nothing. Violations are
//! reported by the runtime; the return values here only carry what the
//! instrumented code needs to continue (the checked pointer, a shadow
//! address).

use std::borrow::Cow;
use std::ffi::{CStr, c_char, c_int, c_uint, c_void};

use poolguard_membrane::{
    AllocKind, AllocSite, CallSite, CheckMode, PoolId, Provenance, Runtime,
};

use crate::runtime_state::runtime;

/// Caller-owned pool handle, one per pool the compiler inferred.
#[repr(C)]
#[derive(Debug, Default)]
pub struct PoolDescriptor {
    /// Opaque id assigned by `pool_init`; zero while uninitialized.
    pub id: u64,
}

unsafe fn pool_id(pool: *const PoolDescriptor) -> Option<PoolId> {
    if pool.is_null() {
        return None;
    }
    // SAFETY: non-null descriptors point at caller-owned PoolDescriptor storage.
    let raw = unsafe { (*pool).id };
    (raw != 0).then(|| PoolId::from_raw(raw))
}

/// Runtime and pool for an entry point, or `None` to pass through.
unsafe fn resolve(pool: *const PoolDescriptor) -> Option<(&'static Runtime, PoolId)> {
    let rt = runtime()?;
    // SAFETY: forwarded caller contract.
    let id = unsafe { pool_id(pool) }?;
    Some((rt, id))
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<Cow<'a, str>> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller passes a NUL-terminated string.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy())
}

fn site(tag: c_uint) -> Option<AllocSite> {
    Some(AllocSite::tagged(tag))
}

unsafe fn debug_site(tag: c_uint, source: *const c_char, line: c_uint) -> Option<AllocSite> {
    let site = AllocSite::tagged(tag);
    // SAFETY: forwarded caller contract.
    Some(match unsafe { c_str(source) } {
        Some(source) => site.with_source(&source, line),
        None => AllocSite { line, ..site },
    })
}

// -- lifecycle ---------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_init(pool: *mut PoolDescriptor) {
    if pool.is_null() {
        return;
    }
    let Some(rt) = runtime() else {
        return;
    };
    let id = rt.create_pool();
    // SAFETY: non-null caller-owned descriptor.
    unsafe { (*pool).id = id.raw() };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_destroy(pool: *mut PoolDescriptor) {
    // SAFETY: forwarded caller contract.
    let Some((rt, id)) = (unsafe { resolve(pool) }) else {
        return;
    };
    rt.destroy_pool(id);
    // SAFETY: resolve only succeeds for non-null descriptors.
    unsafe { (*pool).id = 0 };
}

// -- registration ------------------------------------------------------------

unsafe fn register_kind(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    size: usize,
    kind: AllocKind,
    site: Option<AllocSite>,
) {
    // SAFETY: forwarded caller contract.
    if let Some((rt, id)) = unsafe { resolve(pool) } {
        rt.register(id, ptr as usize, size, kind, site);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    size: usize,
    tag: c_uint,
) {
    unsafe { register_kind(pool, ptr, size, AllocKind::Heap, site(tag)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register_debug(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    size: usize,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    unsafe { register_kind(pool, ptr, size, AllocKind::Heap, debug_site(tag, source, line)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register_stack(pool: *mut PoolDescriptor, ptr: *mut c_void, size: usize) {
    unsafe { register_kind(pool, ptr, size, AllocKind::Stack, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register_stack_debug(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    size: usize,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    unsafe { register_kind(pool, ptr, size, AllocKind::Stack, debug_site(tag, source, line)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register_global(pool: *mut PoolDescriptor, ptr: *mut c_void, size: usize) {
    unsafe { register_kind(pool, ptr, size, AllocKind::Global, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register_global_debug(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    size: usize,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    unsafe { register_kind(pool, ptr, size, AllocKind::Global, debug_site(tag, source, line)) }
}

/// Register the callee's copy of an argument passed by value.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register_byval(pool: *mut PoolDescriptor, ptr: *mut c_void, size: usize) {
    unsafe { register_kind(pool, ptr, size, AllocKind::ByVal, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register_byval_debug(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    size: usize,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    unsafe { register_kind(pool, ptr, size, AllocKind::ByVal, debug_site(tag, source, line)) }
}

/// Register memory created outside instrumented code, checked by every pool.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_register_external(ptr: *mut c_void, size: usize) {
    if let Some(rt) = runtime() {
        rt.register_external(ptr as usize, size, None);
    }
}

unsafe extern "C" {
    static mut environ: *mut *mut c_char;
}

/// Register each non-null string of `vector[..count]` and the vector itself,
/// including its terminating null slot.
unsafe fn register_string_vector(rt: &Runtime, vector: *mut *mut c_char, count: usize) {
    for i in 0..count {
        // SAFETY: the caller guarantees `count` readable slots.
        let s = unsafe { *vector.add(i) };
        if s.is_null() {
            continue;
        }
        // SAFETY: each entry is NUL-terminated.
        let len = unsafe { libc::strlen(s) };
        rt.register_external(s as usize, len + 1, None);
    }
    rt.register_external(vector as usize, (count + 1) * size_of::<*mut c_char>(), None);
}

/// Register the argument vector, the environment and `errno` as external
/// objects; returns `argv`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn poolargvregister(argc: c_int, argv: *mut *mut c_char) -> *mut *mut c_char {
    let Some(rt) = runtime() else {
        return argv;
    };
    if !argv.is_null() && argc >= 0 {
        // SAFETY: argv holds argc string pointers followed by a null.
        unsafe { register_string_vector(rt, argv, argc as usize) };
    }

    // SAFETY: environ is only read here; the loader null-terminates it.
    let env = unsafe { environ };
    if !env.is_null() {
        let mut count = 0;
        // SAFETY: walk up to the terminating null entry.
        while !unsafe { *env.add(count) }.is_null() {
            count += 1;
        }
        // SAFETY: count entries precede the null.
        unsafe { register_string_vector(rt, env, count) };
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: returns the calling thread's errno slot.
        let errno = unsafe { libc::__errno_location() };
        rt.register_external(errno as usize, size_of::<c_int>(), None);
    }
    argv
}

unsafe fn unregister_heap(pool: *mut PoolDescriptor, ptr: *mut c_void, site: Option<AllocSite>) {
    // SAFETY: forwarded caller contract.
    if let Some((rt, id)) = unsafe { resolve(pool) } {
        let _ = rt.unregister(id, ptr as usize, site);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_unregister(pool: *mut PoolDescriptor, ptr: *mut c_void) {
    unsafe { unregister_heap(pool, ptr, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_unregister_debug(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    unsafe { unregister_heap(pool, ptr, debug_site(tag, source, line)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_unregister_stack(pool: *mut PoolDescriptor, ptr: *mut c_void) {
    // SAFETY: forwarded caller contract.
    if let Some((rt, id)) = unsafe { resolve(pool) } {
        rt.unregister_stack(id, ptr as usize);
    }
}

/// Stack records are dropped outright, so the site is not kept.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_unregister_stack_debug(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    _tag: c_uint,
    _source: *const c_char,
    _line: c_uint,
) {
    unsafe { pool_unregister_stack(pool, ptr) }
}

unsafe fn reregister_heap(
    pool: *mut PoolDescriptor,
    new_ptr: *mut c_void,
    old_ptr: *mut c_void,
    size: usize,
    site: Option<AllocSite>,
) {
    // SAFETY: forwarded caller contract.
    if let Some((rt, id)) = unsafe { resolve(pool) } {
        let _ = rt.reregister(id, new_ptr as usize, old_ptr as usize, size, site);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_reregister(
    pool: *mut PoolDescriptor,
    new_ptr: *mut c_void,
    old_ptr: *mut c_void,
    size: usize,
) {
    unsafe { reregister_heap(pool, new_ptr, old_ptr, size, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_reregister_debug(
    pool: *mut PoolDescriptor,
    new_ptr: *mut c_void,
    old_ptr: *mut c_void,
    size: usize,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    unsafe { reregister_heap(pool, new_ptr, old_ptr, size, debug_site(tag, source, line)) }
}

// -- checks ------------------------------------------------------------------

unsafe fn check_access(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    len: usize,
    mode: c_uint,
    site: Option<AllocSite>,
) {
    // SAFETY: forwarded caller contract.
    if let Some((rt, id)) = unsafe { resolve(pool) } {
        let _ = rt.check(id, ptr as usize, len, CheckMode::from_bits(mode), site);
    }
}

/// Bounds check of a `len`-byte load or store. `mode` bit 0 marks complete
/// provenance, bit 1 a store.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_check(pool: *mut PoolDescriptor, ptr: *mut c_void, len: usize, mode: c_uint) {
    unsafe { check_access(pool, ptr, len, mode, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_check_debug(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    len: usize,
    mode: c_uint,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    unsafe { check_access(pool, ptr, len, mode, debug_site(tag, source, line)) }
}

unsafe fn check_alignment(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    element_size: usize,
    site: Option<AllocSite>,
) {
    // SAFETY: forwarded caller contract.
    if let Some((rt, id)) = unsafe { resolve(pool) } {
        let _ = rt.check_align(id, ptr as usize, element_size, site);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_check_align(pool: *mut PoolDescriptor, ptr: *mut c_void, element_size: usize) {
    unsafe { check_alignment(pool, ptr, element_size, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_check_align_debug(
    pool: *mut PoolDescriptor,
    ptr: *mut c_void,
    element_size: usize,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    unsafe { check_alignment(pool, ptr, element_size, debug_site(tag, source, line)) }
}

unsafe fn check_indexing(
    pool: *mut PoolDescriptor,
    source: *mut c_void,
    dest: *mut c_void,
    mode: c_uint,
    site: Option<AllocSite>,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    if let Some((rt, id)) = unsafe { resolve(pool) } {
        let _ = rt.check_arithmetic(id, source as usize, dest as usize, CheckMode::from_bits(mode), site);
    }
    dest
}

/// Pointer arithmetic check; returns `dest`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_boundscheck(
    pool: *mut PoolDescriptor,
    source: *mut c_void,
    dest: *mut c_void,
    mode: c_uint,
) -> *mut c_void {
    unsafe { check_indexing(pool, source, dest, mode, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_boundscheck_debug(
    pool: *mut PoolDescriptor,
    source: *mut c_void,
    dest: *mut c_void,
    mode: c_uint,
    tag: c_uint,
    src_file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    unsafe { check_indexing(pool, source, dest, mode, debug_site(tag, src_file, line)) }
}

/// Check that `result` lies in `[base, base + size)`; returns `result`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn exactcheck2(base: *const c_void, result: *const c_void, size: usize) -> *mut c_void {
    if let Some(rt) = runtime() {
        let _ = rt.exact_check(base as usize, result as usize, size, None);
    }
    result.cast_mut()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn exactcheck2_debug(
    base: *const c_void,
    result: *const c_void,
    size: usize,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) -> *mut c_void {
    if let Some(rt) = runtime() {
        // SAFETY: forwarded caller contract.
        let site = unsafe { debug_site(tag, source, line) };
        let _ = rt.exact_check(base as usize, result as usize, size, site);
    }
    result.cast_mut()
}

/// Check a `len`-byte access at `result` against a known object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fastlscheck(base: *const c_void, result: *const c_void, size: usize, len: usize) {
    if let Some(rt) = runtime() {
        let _ = rt.fast_ls_check(base as usize, result as usize, size, len, None);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn fastlscheck_debug(
    base: *const c_void,
    result: *const c_void,
    size: usize,
    len: usize,
    tag: c_uint,
    source: *const c_char,
    line: c_uint,
) {
    if let Some(rt) = runtime() {
        // SAFETY: forwarded caller contract.
        let site = unsafe { debug_site(tag, source, line) };
        let _ = rt.fast_ls_check(base as usize, result as usize, size, len, site);
    }
}

unsafe fn check_call(f: *const c_void, targets: *const *const c_void, count: usize, provenance: Provenance) {
    let Some(rt) = runtime() else {
        return;
    };
    let targets: Vec<usize> = if targets.is_null() {
        Vec::new()
    } else {
        // SAFETY: caller passes `count` target pointers.
        unsafe { std::slice::from_raw_parts(targets, count) }
            .iter()
            .map(|&t| t as usize)
            .collect()
    };
    let _ = rt.check_call_target(f as usize, &targets, provenance, None);
}

/// Indirect call through `f`, whose full target set is `targets`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn funccheck(f: *const c_void, targets: *const *const c_void, count: usize) {
    unsafe { check_call(f, targets, count, Provenance::Complete) }
}

/// Indirect call whose target set may be incomplete; never faults.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn funccheckui(f: *const c_void, targets: *const *const c_void, count: usize) {
    unsafe { check_call(f, targets, count, Provenance::Incomplete) }
}

/// Check that a string passed to a C library function is terminated inside
/// its object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_check_string(pool: *mut PoolDescriptor, s: *const c_char, function: *const c_char) {
    // SAFETY: forwarded caller contract.
    let Some((rt, id)) = (unsafe { resolve(pool) }) else {
        return;
    };
    // SAFETY: function names are NUL-terminated literals from the compiler.
    let function = unsafe { c_str(function) }.unwrap_or(Cow::Borrowed("unknown"));
    // SAFETY: registered objects are live program memory.
    let _ = unsafe { rt.check_cstring(id, s as usize, &function, None) };
}

// -- shadow pages ------------------------------------------------------------

/// Alias the pages of an object; returns the aliased pointer, or `ptr` when
/// the memory cannot be remapped.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_shadow(ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(rt) = runtime() else {
        return ptr;
    };
    match rt.shadow(ptr as usize, size) {
        Ok(shadow) => shadow as *mut c_void,
        Err(_) => ptr,
    }
}

/// Make a shadow inaccessible so a dangling use traps.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_unshadow(ptr: *mut c_void) {
    if let Some(rt) = runtime() {
        if let Err(err) = rt.unshadow(ptr as usize) {
            eprintln!("poolguard: cannot protect shadow at {:#x}: {err}", ptr as usize);
        }
    }
}

// -- allocator call sites ----------------------------------------------------

unsafe fn call_site<'a>(callee: &'a str, args: *const usize, nargs: usize, ret: usize) -> CallSite<'a> {
    let args: &'a [usize] = if args.is_null() || nargs == 0 {
        &[]
    } else {
        // SAFETY: caller passes `nargs` argument words.
        unsafe { std::slice::from_raw_parts(args, nargs) }
    };
    CallSite::new(callee, args, ret)
}

/// Report a call to a possible allocator; recognized allocations are
/// registered in `pool`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_alloc_site(
    pool: *mut PoolDescriptor,
    callee: *const c_char,
    args: *const usize,
    nargs: usize,
    ret: *mut c_void,
) {
    // SAFETY: forwarded caller contract.
    let Some((rt, id)) = (unsafe { resolve(pool) }) else {
        return;
    };
    // SAFETY: callee names are NUL-terminated.
    let Some(callee) = (unsafe { c_str(callee) }) else {
        return;
    };
    // SAFETY: forwarded caller contract.
    let call = unsafe { call_site(&callee, args, nargs, ret as usize) };
    let measure = |addr: usize| {
        // SAFETY: string allocators return NUL-terminated strings.
        Some(unsafe { libc::strlen(addr as *const c_char) })
    };
    let _ = rt.on_allocation(id, &call, measure, None);
}

/// Report a call to a possible deallocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pool_free_site(
    pool: *mut PoolDescriptor,
    callee: *const c_char,
    args: *const usize,
    nargs: usize,
) {
    // SAFETY: forwarded caller contract.
    let Some((rt, id)) = (unsafe { resolve(pool) }) else {
        return;
    };
    // SAFETY: callee names are NUL-terminated.
    let Some(callee) = (unsafe { c_str(callee) }) else {
        return;
    };
    // SAFETY: forwarded caller contract.
    let call = unsafe { call_site(&callee, args, nargs, 0) };
    let _ = rt.on_deallocation(id, &call, None);
}
