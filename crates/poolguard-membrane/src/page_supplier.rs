//! OS page supplier for runtime bookkeeping.
//!
//! Index nodes never come from the general-purpose heap: the program under
//! test may corrupt it, and the runtime must not corrupt it either. Pages are
//! mapped anonymously and *shared* so that a second virtual mapping of the
//! same physical pages can be produced with `remap`.
//!
//! Released pages go to a process-wide free list and are handed out again
//! before new pages are mapped. Pages are never unmapped.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::PageError;

/// Pages mapped at once when a single page is requested and the cache is empty.
const FRESH_BATCH_PAGES: usize = 8;

/// Used until the OS reports its page size.
const FALLBACK_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageRun {
    addr: usize,
    pages: usize,
}

/// Process-wide source of page-aligned memory.
pub struct PageSupplier {
    free: Mutex<Vec<PageRun>>,
    page_size: AtomicUsize,
    mapped_pages: AtomicU64,
    reused_pages: AtomicU64,
    released_pages: AtomicU64,
}

/// Counters of a [`PageSupplier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub mapped_pages: u64,
    pub reused_pages: u64,
    pub released_pages: u64,
    pub cached_pages: usize,
}

impl PageSupplier {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            page_size: AtomicUsize::new(0),
            mapped_pages: AtomicU64::new(0),
            reused_pages: AtomicU64::new(0),
            released_pages: AtomicU64::new(0),
        }
    }

    /// Physical page size, queried from the OS once.
    pub fn page_size(&self) -> usize {
        let cached = self.page_size.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        // SAFETY: sysconf has no memory-safety preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let size = if raw > 0 {
            raw as usize
        } else {
            FALLBACK_PAGE_SIZE
        };
        self.page_size.store(size, Ordering::Relaxed);
        size
    }

    /// Hand out `n` contiguous pages. Contents are unspecified.
    pub fn acquire_pages(&self, n: usize) -> Result<usize, PageError> {
        if n == 0 {
            return Err(PageError::EmptyRequest);
        }
        let page = self.page_size();

        {
            let mut free = self.free.lock();
            if let Some(idx) = free.iter().position(|run| run.pages >= n) {
                let run = free.swap_remove(idx);
                if run.pages > n {
                    free.push(PageRun {
                        addr: run.addr + n * page,
                        pages: run.pages - n,
                    });
                }
                self.reused_pages.fetch_add(n as u64, Ordering::Relaxed);
                return Ok(run.addr);
            }
        }

        let batch = if n == 1 { FRESH_BATCH_PAGES } else { n };
        let bytes = batch.checked_mul(page).ok_or(PageError::Exhausted {
            pages: batch,
            errno: libc::ENOMEM,
        })?;
        let addr = map_shared_anonymous(bytes).map_err(|errno| PageError::Exhausted {
            pages: batch,
            errno,
        })?;
        self.mapped_pages
            .fetch_add(batch as u64, Ordering::Relaxed);

        if batch > n {
            self.free.lock().push(PageRun {
                addr: addr + n * page,
                pages: batch - n,
            });
        }
        Ok(addr)
    }

    /// Return pages to the free list. The mapping stays in place.
    pub fn release_pages(&self, addr: usize, n: usize) {
        if addr == 0 || n == 0 {
            return;
        }
        self.free.lock().push(PageRun { addr, pages: n });
        self.released_pages.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Map the physical pages behind `[addr, addr + n pages)` a second time.
    ///
    /// Writes through either mapping are visible through the other.
    pub fn remap(&self, addr: usize, n: usize) -> Result<usize, PageError> {
        if n == 0 {
            return Err(PageError::EmptyRequest);
        }
        let len = n * self.page_size();
        remap_shared(addr, len)
    }

    /// Revoke all access to the pages so any touch traps.
    pub fn protect(&self, addr: usize, n: usize) -> Result<(), PageError> {
        self.set_protection(addr, n, libc::PROT_NONE, "protect")
    }

    /// Restore read/write access.
    pub fn unprotect(&self, addr: usize, n: usize) -> Result<(), PageError> {
        self.set_protection(addr, n, libc::PROT_READ | libc::PROT_WRITE, "unprotect")
    }

    fn set_protection(
        &self,
        addr: usize,
        n: usize,
        prot: libc::c_int,
        op: &'static str,
    ) -> Result<(), PageError> {
        if n == 0 {
            return Err(PageError::EmptyRequest);
        }
        let page = self.page_size();
        let base = addr & !(page - 1);
        // SAFETY: mprotect only changes permissions; an unmapped or foreign
        // range is rejected by the kernel with an errno.
        let rc = unsafe { libc::mprotect(base as *mut libc::c_void, n * page, prot) };
        if rc != 0 {
            return Err(PageError::Os {
                op,
                addr: base,
                errno: last_errno(),
            });
        }
        Ok(())
    }

    /// Pages currently parked in the free list.
    pub fn cached_pages(&self) -> usize {
        self.free.lock().iter().map(|run| run.pages).sum()
    }

    #[must_use]
    pub fn stats(&self) -> PageStats {
        PageStats {
            mapped_pages: self.mapped_pages.load(Ordering::Relaxed),
            reused_pages: self.reused_pages.load(Ordering::Relaxed),
            released_pages: self.released_pages.load(Ordering::Relaxed),
            cached_pages: self.cached_pages(),
        }
    }
}

impl Default for PageSupplier {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_PAGES: PageSupplier = PageSupplier::new();

/// The process-wide page supplier.
#[must_use]
pub fn global_page_supplier() -> &'static PageSupplier {
    &GLOBAL_PAGES
}

/// Terminate after the OS refused memory for runtime bookkeeping.
///
/// This is not a safety violation of the program under test and is never
/// routed through the reporter.
pub fn fatal_page_error(err: &PageError) -> ! {
    eprintln!("poolguard: fatal: cannot obtain bookkeeping memory: {err}");
    std::process::abort()
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::ENOMEM)
}

fn map_shared_anonymous(len: usize) -> Result<usize, i32> {
    // SAFETY: anonymous mapping with a null hint; no existing memory is touched.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(last_errno());
    }
    Ok(ptr as usize)
}

#[cfg(target_os = "linux")]
fn remap_shared(addr: usize, len: usize) -> Result<usize, PageError> {
    // SAFETY: an old size of zero asks the kernel for a new mapping of the
    // same shared pages; the original mapping is left untouched.
    let ptr = unsafe { libc::mremap(addr as *mut libc::c_void, 0, len, libc::MREMAP_MAYMOVE) };
    if ptr == libc::MAP_FAILED {
        return Err(PageError::Os {
            op: "remap",
            addr,
            errno: last_errno(),
        });
    }
    Ok(ptr as usize)
}

#[cfg(not(target_os = "linux"))]
fn remap_shared(_addr: usize, _len: usize) -> Result<usize, PageError> {
    Err(PageError::Unsupported("remap"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_page_request_is_rejected() {
        let supplier = PageSupplier::new();
        assert_eq!(supplier.acquire_pages(0), Err(PageError::EmptyRequest));
    }

    #[test]
    fn pages_are_aligned_and_writable() {
        let supplier = PageSupplier::new();
        let page = supplier.page_size();
        let addr = supplier.acquire_pages(2).unwrap();
        assert_eq!(addr % page, 0);
        // SAFETY: the two pages were just mapped read/write.
        unsafe {
            let p = addr as *mut u8;
            p.write(0xAB);
            p.add(2 * page - 1).write(0xCD);
            assert_eq!(p.read(), 0xAB);
        }
    }

    #[test]
    fn single_page_requests_are_batched() {
        let supplier = PageSupplier::new();
        let first = supplier.acquire_pages(1).unwrap();
        assert_eq!(supplier.stats().mapped_pages, FRESH_BATCH_PAGES as u64);
        assert_eq!(supplier.cached_pages(), FRESH_BATCH_PAGES - 1);
        let second = supplier.acquire_pages(1).unwrap();
        assert_ne!(first, second);
        assert_eq!(
            supplier.stats().mapped_pages,
            FRESH_BATCH_PAGES as u64,
            "second page must come from the cache"
        );
    }

    #[test]
    fn released_pages_are_reused_first() {
        let supplier = PageSupplier::new();
        let addr = supplier.acquire_pages(3).unwrap();
        supplier.release_pages(addr, 3);
        let again = supplier.acquire_pages(2).unwrap();
        assert_eq!(again, addr);
        assert_eq!(supplier.cached_pages(), 1, "remainder of the run stays cached");
        let stats = supplier.stats();
        assert_eq!(stats.released_pages, 3);
        assert_eq!(stats.reused_pages, 2);
    }

    #[test]
    fn protect_round_trip() {
        let supplier = PageSupplier::new();
        let addr = supplier.acquire_pages(1).unwrap();
        supplier.protect(addr, 1).unwrap();
        supplier.unprotect(addr, 1).unwrap();
        // SAFETY: access was restored above.
        unsafe { (addr as *mut u8).write(1) };
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn remap_aliases_the_same_pages() {
        let supplier = PageSupplier::new();
        let addr = supplier.acquire_pages(1).unwrap();
        let shadow = supplier.remap(addr, 1).unwrap();
        assert_ne!(addr, shadow);
        // SAFETY: both mappings are live and writable.
        unsafe {
            (addr as *mut u32).write(0xDEAD_BEEF);
            assert_eq!((shadow as *const u32).read(), 0xDEAD_BEEF);
        }
    }
}
