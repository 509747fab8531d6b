//! Whole-page supplier behind the pool.
//!
//! [`PageProvider`] is the seam the allocator draws pages through; the pool
//! never second-guesses its bookkeeping. [`SystemPages`] is the default
//! implementation: one address-space reservation per base pool type, carved
//! into page runs tracked by a bitset, committed on allocation and handed
//! back to the host on free.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::PoisonError;

use fixedbitset::FixedBitSet;

use super::error::{PoolError, VmError};
use super::stats::Gauge;
use super::types::BasePoolType;
use crate::sync::Mutex;

/// Supplier and sink of whole pages.
///
/// Pages given back through `free_pages` must stay mapped and readable for
/// as long as the provider lives. A lookaside pop can still be reading the
/// link word of a block whose page was released a moment earlier; it
/// discards what it read, but the read itself must not fault.
pub trait PageProvider: Send + Sync {
    /// Page size in bytes. A power of two.
    fn page_size(&self) -> usize;

    /// Allocate `bytes` (a multiple of the page size) of committed,
    /// page-aligned memory for `pool`, or `None` when exhausted.
    fn allocate_pages(&self, pool: BasePoolType, bytes: usize) -> Option<NonNull<u8>>;

    /// Release a run previously returned by `allocate_pages`. Returns the
    /// number of pages freed, or `None` if `page` does not start a live run.
    ///
    /// # Safety
    /// No reference into the run may be used after this call.
    unsafe fn free_pages(&self, page: NonNull<u8>) -> Option<usize>;

    /// Which pool an address belongs to, if it is inside this provider.
    fn pool_type_of(&self, addr: usize) -> Option<BasePoolType>;

    /// Length in pages of the live run starting at `addr`.
    fn pages_of(&self, addr: usize) -> Option<usize>;

    /// Bytes `pool` could still hand out, or `None` if unbounded or unknown.
    fn available_bytes(&self, pool: BasePoolType) -> Option<usize> {
        let _ = pool;
        None
    }
}

impl<T: PageProvider + ?Sized> PageProvider for std::sync::Arc<T> {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn allocate_pages(&self, pool: BasePoolType, bytes: usize) -> Option<NonNull<u8>> {
        (**self).allocate_pages(pool, bytes)
    }

    unsafe fn free_pages(&self, page: NonNull<u8>) -> Option<usize> {
        // Safety: forwarded from caller.
        unsafe { (**self).free_pages(page) }
    }

    fn pool_type_of(&self, addr: usize) -> Option<BasePoolType> {
        (**self).pool_type_of(addr)
    }

    fn pages_of(&self, addr: usize) -> Option<usize> {
        (**self).pages_of(addr)
    }

    fn available_bytes(&self, pool: BasePoolType) -> Option<usize> {
        (**self).available_bytes(pool)
    }
}

// ---------------------------------------------------------------------------
// Reservation
//
// An address range reserved inaccessible, made read/write page run by page
// run. Giving a run back drops its physical pages but leaves it mapped: it
// reads as zeros until committed again.
// ---------------------------------------------------------------------------

struct Reservation {
    base: NonNull<u8>,
    bytes: usize,
}

// Safety: a reservation is an address range; nothing in it is shared through
// the struct itself.
unsafe impl Send for Reservation {}
// Safety: see above.
unsafe impl Sync for Reservation {}

impl Reservation {
    #[inline]
    fn at(&self, offset: usize) -> *mut std::ffi::c_void {
        // Safety: callers pass offsets inside the reservation.
        unsafe { self.base.as_ptr().add(offset).cast() }
    }
}

#[cfg(all(unix, not(any(loom, miri))))]
impl Reservation {
    fn new(bytes: usize) -> Result<Self, VmError> {
        // Safety: anonymous mapping at a kernel-chosen address.
        let ptr = unsafe {
            libc::mmap(std::ptr::null_mut(), bytes, libc::PROT_NONE, libc::MAP_PRIVATE | libc::MAP_ANON, -1, 0)
        };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::Reserve { bytes, source: std::io::Error::last_os_error() });
        }
        NonNull::new(ptr.cast::<u8>())
            .map(|base| Self { base, bytes })
            .ok_or_else(|| VmError::Reserve { bytes, source: std::io::Error::other("mmap returned null") })
    }

    fn commit(&self, offset: usize, len: usize) -> Result<(), VmError> {
        // Safety: the range lies inside our mapping.
        if unsafe { libc::mprotect(self.at(offset), len, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
            return Err(VmError::Commit {
                address: self.at(offset) as usize,
                bytes: len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn decommit(&self, offset: usize, len: usize) -> Result<(), VmError> {
        // Safety: the range lies inside our mapping and holds no live block.
        if unsafe { libc::madvise(self.at(offset), len, libc::MADV_DONTNEED) } != 0 {
            return Err(VmError::Decommit {
                address: self.at(offset) as usize,
                bytes: len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn host_page_size() -> usize {
        static PAGE: crate::sync::OnceLock<usize> = crate::sync::OnceLock::new();
        *PAGE.get_or_init(|| {
            // Safety: sysconf has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(raw).ok().filter(|p| p.is_power_of_two()).unwrap_or(4096)
        })
    }
}

#[cfg(all(unix, not(any(loom, miri))))]
impl Drop for Reservation {
    fn drop(&mut self) {
        // Safety: we own the mapping and nothing in it outlives us.
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.bytes) } != 0 {
            let e = VmError::Release { address: self.base.as_ptr() as usize, source: std::io::Error::last_os_error() };
            log::error!("{e}");
        }
    }
}

// Under loom and Miri, and off unix, a reservation is one zeroed heap block
// that is always accessible.
#[cfg(any(loom, miri, not(unix)))]
impl Reservation {
    const HEAP_PAGE: usize = 4096;

    fn layout(bytes: usize) -> Result<std::alloc::Layout, VmError> {
        std::alloc::Layout::from_size_align(bytes, Self::HEAP_PAGE)
            .map_err(|e| VmError::Reserve { bytes, source: std::io::Error::other(e) })
    }

    fn new(bytes: usize) -> Result<Self, VmError> {
        let layout = Self::layout(bytes)?;
        // Safety: `SystemPages` never reserves zero bytes.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|base| Self { base, bytes }).ok_or_else(|| VmError::Reserve {
            bytes,
            source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        })
    }

    fn commit(&self, _offset: usize, _len: usize) -> Result<(), VmError> {
        Ok(())
    }

    fn decommit(&self, offset: usize, len: usize) -> Result<(), VmError> {
        // Safety: the range lies inside the block and holds no live block.
        unsafe { std::ptr::write_bytes(self.at(offset).cast::<u8>(), 0, len) };
        Ok(())
    }

    fn host_page_size() -> usize {
        Self::HEAP_PAGE
    }
}

#[cfg(any(loom, miri, not(unix)))]
impl Drop for Reservation {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.bytes) {
            // Safety: allocated in `new` with this layout.
            unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

/// Address space reserved per pool type by [`SystemPages`].
#[derive(Clone, Debug)]
pub struct SystemPagesConfig {
    /// Default: 256 MiB.
    pub nonpaged_bytes: usize,
    /// Default: 512 MiB.
    pub paged_bytes: usize,
}

impl Default for SystemPagesConfig {
    fn default() -> Self {
        Self {
            nonpaged_bytes: 256 * 1024 * 1024,
            paged_bytes: 512 * 1024 * 1024,
        }
    }
}

struct ArenaState {
    used: FixedBitSet,
    /// Run start page -> run length.
    runs: HashMap<usize, usize>,
    /// Next-fit cursor.
    hint: usize,
}

/// One reservation, handed out in page runs.
struct PageArena {
    reservation: Reservation,
    pages: usize,
    page_size: usize,
    state: Mutex<ArenaState>,
    committed: Gauge,
}

impl PageArena {
    fn new(bytes: usize, page_size: usize) -> Result<Self, VmError> {
        let pages = bytes / page_size;
        Ok(Self {
            reservation: Reservation::new(pages * page_size)?,
            pages,
            page_size,
            state: Mutex::new(ArenaState {
                used: FixedBitSet::with_capacity(pages),
                runs: HashMap::new(),
                hint: 0,
            }),
            committed: Gauge::new(),
        })
    }

    fn start(&self) -> usize {
        self.reservation.base.as_ptr() as usize
    }

    fn contains(&self, addr: usize) -> bool {
        (self.start()..self.start() + self.pages * self.page_size).contains(&addr)
    }

    /// Page index of `addr` if it is a page boundary inside the arena.
    fn page_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.start())?;
        (offset.is_multiple_of(self.page_size) && offset < self.pages * self.page_size)
            .then_some(offset / self.page_size)
    }

    fn find_run(state: &ArenaState, total: usize, count: usize) -> Option<usize> {
        let mut scanned = 0;
        let mut start = state.hint % total.max(1);
        while scanned < total {
            if start + count > total {
                scanned += total - start;
                start = 0;
                continue;
            }
            match (start..start + count).find(|&p| state.used.contains(p)) {
                None => return Some(start),
                Some(taken) => {
                    scanned += taken + 1 - start;
                    start = taken + 1;
                    if start >= total {
                        start = 0;
                    }
                }
            }
        }
        None
    }

    fn allocate(&self, count: usize) -> Option<NonNull<u8>> {
        if count > self.pages {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let first = Self::find_run(&state, self.pages, count)?;
        let (offset, bytes) = (first * self.page_size, count * self.page_size);
        if let Err(e) = self.reservation.commit(offset, bytes) {
            log::warn!("{e}");
            return None;
        }
        state.used.insert_range(first..first + count);
        state.runs.insert(first, count);
        state.hint = first + count;
        self.committed.raise(count);
        NonNull::new(self.reservation.at(offset).cast())
    }

    fn free(&self, page: NonNull<u8>) -> Option<usize> {
        let first = self.page_index(page.as_ptr() as usize)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let count = state.runs.remove(&first)?;
        state.used.remove_range(first..first + count);
        self.committed.lower(count);
        if let Err(e) = self.reservation.decommit(first * self.page_size, count * self.page_size) {
            log::warn!("{e}");
        }
        Some(count)
    }

    fn run_length(&self, addr: usize) -> Option<usize> {
        let first = self.page_index(addr)?;
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.runs.get(&first).copied()
    }

    fn available_bytes(&self) -> usize {
        self.pages.saturating_sub(self.committed.level()) * self.page_size
    }
}

/// Default page provider: a nonpaged and a paged arena over the host VM.
pub struct SystemPages {
    arenas: [PageArena; 2],
    page_size: usize,
}

impl SystemPages {
    /// Reserve both arenas with the default sizes.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Vm` if a reservation fails.
    pub fn new() -> Result<Self, PoolError> {
        Self::with_config(&SystemPagesConfig::default())
    }

    /// # Errors
    ///
    /// Returns `PoolError::Vm` if a reservation fails, or
    /// `PoolError::InvalidConfig` for an arena smaller than one page.
    pub fn with_config(config: &SystemPagesConfig) -> Result<Self, PoolError> {
        let page_size = Self::host_page_size();
        if config.nonpaged_bytes < page_size || config.paged_bytes < page_size {
            return Err(PoolError::InvalidConfig(format!(
                "each arena needs at least one {page_size}-byte page"
            )));
        }
        let nonpaged = PageArena::new(config.nonpaged_bytes, page_size)?;
        let paged = PageArena::new(config.paged_bytes, page_size)?;
        log::debug!(
            "reserved {} nonpaged and {} paged pages of {page_size} bytes",
            nonpaged.pages,
            paged.pages
        );
        Ok(Self { arenas: [nonpaged, paged], page_size })
    }

    /// Page size of the host, which every `SystemPages` uses.
    pub fn host_page_size() -> usize {
        Reservation::host_page_size()
    }

    /// Pages currently committed for `pool`.
    pub fn committed_pages(&self, pool: BasePoolType) -> usize {
        self.arenas[pool.index()].committed.level()
    }
}

impl PageProvider for SystemPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate_pages(&self, pool: BasePoolType, bytes: usize) -> Option<NonNull<u8>> {
        let count = bytes.div_ceil(self.page_size).max(1);
        self.arenas[pool.index()].allocate(count)
    }

    unsafe fn free_pages(&self, page: NonNull<u8>) -> Option<usize> {
        let addr = page.as_ptr() as usize;
        self.arenas.iter().find(|a| a.contains(addr))?.free(page)
    }

    fn pool_type_of(&self, addr: usize) -> Option<BasePoolType> {
        BasePoolType::ALL.into_iter().find(|t| self.arenas[t.index()].contains(addr))
    }

    fn pages_of(&self, addr: usize) -> Option<usize> {
        self.arenas.iter().find(|a| a.contains(addr))?.run_length(addr)
    }

    fn available_bytes(&self, pool: BasePoolType) -> Option<usize> {
        Some(self.arenas[pool.index()].available_bytes())
    }
}
