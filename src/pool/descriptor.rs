//! Pool descriptors: size-classed free lists for one (base type, node) pair.
//!
//! Free blocks are threaded through an intrusive doubly-linked list stored
//! in their payload, one list per size in units. A two-level bitmap over the
//! list heads finds the first non-empty class at or above a request in a
//! couple of `trailing_zeros`. Every list mutation, split and merge happens
//! under the descriptor lock: a spin lock for nonpaged pools, a blocking
//! mutex for paged ones.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::PoisonError;

use super::deferred::PendingFrees;
use super::error::{BugCheck, bug_check};
use super::header::{BlockPtr, BlockState, CACHE_LINE, UNIT, UNIT_SHIFT};
use super::page::PageProvider;
use super::stats::PoolCounters;
use super::types::BasePoolType;
use crate::sync::{Mutex, MutexGuard, SpinMutex, SpinMutexGuard};

/// Extra units requested so a cache-line-aligned payload fits anywhere in
/// the chosen block.
pub(crate) const ALIGN_SLACK: usize = CACHE_LINE / UNIT - 1;

/// Two-level bitmap of non-empty list heads. Indexes up to 64 * 64 classes.
struct ListMap {
    summary: u64,
    words: Box<[u64]>,
}

impl ListMap {
    fn new(lists: usize) -> Self {
        let words = lists.div_ceil(64);
        debug_assert!(words <= 64);
        Self { summary: 0, words: vec![0; words].into_boxed_slice() }
    }

    fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1 << (index % 64);
        self.summary |= 1 << (index / 64);
    }

    fn clear(&mut self, index: usize) {
        let word = index / 64;
        self.words[word] &= !(1 << (index % 64));
        if self.words[word] == 0 {
            self.summary &= !(1 << word);
        }
    }

    /// First set index `>= from`.
    fn first_from(&self, from: usize) -> Option<usize> {
        let word = from / 64;
        if word >= self.words.len() {
            return None;
        }
        let bits = self.words[word] & (!0u64 << (from % 64));
        if bits != 0 {
            return Some(word * 64 + bits.trailing_zeros() as usize);
        }
        let higher = self.summary & (!0u64).checked_shl(word as u32 + 1).unwrap_or(0);
        if higher == 0 {
            return None;
        }
        let word = higher.trailing_zeros() as usize;
        Some(word * 64 + self.words[word].trailing_zeros() as usize)
    }
}

/// Intrusive links at the start of a free block's payload. Both point at
/// headers.
#[repr(C)]
struct FreeLink {
    next: *mut u8,
    prev: *mut u8,
}

#[inline]
fn link_of(header: *mut u8) -> *mut FreeLink {
    // Safety of use: every listed block has at least one unit of payload.
    header.wrapping_add(UNIT).cast()
}

pub(crate) struct FreeLists {
    heads: Box<[*mut u8]>,
    map: ListMap,
}

// Safety: the raw heads point into pool pages owned by the descriptor and
// are only touched under its lock.
unsafe impl Send for FreeLists {}

impl FreeLists {
    fn new(page_units: usize) -> Self {
        Self {
            heads: vec![std::ptr::null_mut(); page_units].into_boxed_slice(),
            map: ListMap::new(page_units),
        }
    }

    /// Head-insert a free block. Header-only fragments stay unlisted.
    pub(crate) fn insert(&mut self, block: BlockPtr) {
        let units = block.units();
        if units < 2 {
            return;
        }
        let head = self.heads[units];
        // Safety: block is free and ours under the lock; head, if any, is a
        // listed block of the same page pool.
        unsafe {
            link_of(block.as_ptr()).write(FreeLink { next: head, prev: std::ptr::null_mut() });
            if !head.is_null() {
                (*link_of(head)).prev = block.as_ptr();
            }
        }
        self.heads[units] = block.as_ptr();
        self.map.set(units);
    }

    /// Unlink a listed free block, validating both neighbours' links.
    pub(crate) fn remove(&mut self, block: BlockPtr) {
        let units = block.units();
        if units < 2 {
            return;
        }
        let address = block.addr();
        // Safety: block is listed, so its link is initialised; its
        // neighbours are listed blocks of the same class.
        unsafe {
            let FreeLink { next, prev } = link_of(block.as_ptr()).read();
            if prev.is_null() {
                if self.heads[units] != block.as_ptr() {
                    bug_check(BugCheck::CorruptedFreeList { check: "list head mismatch", address });
                }
                self.heads[units] = next;
            } else {
                if (*link_of(prev)).next != block.as_ptr() {
                    bug_check(BugCheck::CorruptedFreeList { check: "previous link mismatch", address });
                }
                (*link_of(prev)).next = next;
            }
            if !next.is_null() {
                if (*link_of(next)).prev != block.as_ptr() {
                    bug_check(BugCheck::CorruptedFreeList { check: "next link mismatch", address });
                }
                (*link_of(next)).prev = prev;
            }
        }
        if self.heads[units].is_null() {
            self.map.clear(units);
        }
    }

    /// First-fit upward: head of the smallest non-empty class `>= units`.
    fn pop_first_fit(&mut self, units: usize) -> Option<BlockPtr> {
        let class = self.map.first_from(units)?;
        let head = NonNull::new(self.heads[class])?;
        // Safety: listed heads are free headers in mapped pool pages.
        let block = unsafe { BlockPtr::from_raw(head) };
        self.remove(block);
        Some(block)
    }

    #[cfg(test)]
    pub(crate) fn listed(&self, units: usize) -> usize {
        let mut n = 0;
        let mut cur = self.heads[units];
        while !cur.is_null() {
            n += 1;
            // Safety: Test code walking a consistent list.
            cur = unsafe { (*link_of(cur)).next };
        }
        n
    }
}

enum DescriptorLock {
    Spin(SpinMutex<FreeLists>),
    Blocking(Mutex<FreeLists>),
}

pub(crate) enum PoolGuard<'a> {
    Spin(SpinMutexGuard<'a, FreeLists>),
    Blocking(MutexGuard<'a, FreeLists>),
}

impl Deref for PoolGuard<'_> {
    type Target = FreeLists;

    fn deref(&self) -> &FreeLists {
        match self {
            Self::Spin(g) => &**g,
            Self::Blocking(g) => &**g,
        }
    }
}

impl DerefMut for PoolGuard<'_> {
    fn deref_mut(&mut self) -> &mut FreeLists {
        match self {
            Self::Spin(g) => &mut **g,
            Self::Blocking(g) => &mut **g,
        }
    }
}

pub(crate) struct PoolDescriptor {
    base: BasePoolType,
    session: bool,
    index: usize,
    page_size: usize,
    lock: DescriptorLock,
    pub(crate) pending: PendingFrees,
    pub(crate) counters: PoolCounters,
}

impl PoolDescriptor {
    pub(crate) fn new(base: BasePoolType, index: usize, session: bool, page_size: usize) -> Self {
        let lists = FreeLists::new(page_size >> UNIT_SHIFT);
        let lock = match base {
            BasePoolType::NonPaged => DescriptorLock::Spin(SpinMutex::new(lists)),
            BasePoolType::Paged => DescriptorLock::Blocking(Mutex::new(lists)),
        };
        Self {
            base,
            session,
            index,
            page_size,
            lock,
            pending: PendingFrees::new(),
            counters: PoolCounters::new(),
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> BasePoolType {
        self.base
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub(crate) fn page_units(&self) -> usize {
        self.page_size >> UNIT_SHIFT
    }

    pub(crate) fn lock(&self) -> PoolGuard<'_> {
        match &self.lock {
            DescriptorLock::Spin(m) => PoolGuard::Spin(m.lock()),
            DescriptorLock::Blocking(m) => {
                PoolGuard::Blocking(m.lock().unwrap_or_else(PoisonError::into_inner))
            }
        }
    }

    pub(crate) fn try_lock(&self) -> Option<PoolGuard<'_>> {
        match &self.lock {
            DescriptorLock::Spin(m) => m.try_lock().map(PoolGuard::Spin),
            DescriptorLock::Blocking(m) => match m.try_lock() {
                Ok(g) => Some(PoolGuard::Blocking(g)),
                Err(std::sync::TryLockError::Poisoned(p)) => Some(PoolGuard::Blocking(p.into_inner())),
                Err(std::sync::TryLockError::WouldBlock) => None,
            },
        }
    }

    /// Header state of a live block carved from this descriptor.
    #[inline]
    pub(crate) fn in_use_state(&self) -> BlockState {
        let mut state = BlockState::IN_USE;
        if self.base == BasePoolType::Paged {
            state |= BlockState::PAGED;
        }
        if self.session {
            state |= BlockState::SESSION;
        }
        state
    }

    /// Carve `units` from the free lists, or `None` if no class fits.
    pub(crate) fn take_from_lists(&self, lists: &mut FreeLists, units: usize, aligned: bool) -> Option<BlockPtr> {
        let need = if aligned { units + ALIGN_SLACK } else { units };
        if need >= self.page_units() {
            return None;
        }
        let block = lists.pop_first_fit(need)?;
        Some(self.carve(lists, block, units, aligned))
    }

    /// Format a fresh page as one free block and carve `units` from it.
    ///
    /// # Safety
    /// `page` is a committed, page-aligned page this descriptor now owns.
    pub(crate) unsafe fn carve_new_page(
        &self,
        lists: &mut FreeLists,
        page: NonNull<u8>,
        units: usize,
        aligned: bool,
    ) -> BlockPtr {
        // Safety: caller hands us the whole page.
        let block = unsafe { BlockPtr::from_raw(page) };
        block.init(self.page_units(), 0, self.index);
        self.counters.note_page_taken();
        log::debug!("{:?} pool node {} took page {page:p}", self.base, self.index);
        self.carve(lists, block, units, aligned)
    }

    fn carve(&self, lists: &mut FreeLists, block: BlockPtr, units: usize, aligned: bool) -> BlockPtr {
        let block = if aligned { self.align_payload(lists, block) } else { block };
        // Page-start blocks are carved from the front so the remainder keeps
        // the rest of the page contiguous; others from the end so the free
        // part stays where it was.
        let front = aligned || block.is_page_start();
        let block = self.split(lists, block, units, front);
        block.set_state(self.in_use_state());
        self.counters.note_alloc(units << UNIT_SHIFT);
        block
    }

    fn split(&self, lists: &mut FreeLists, block: BlockPtr, units: usize, front: bool) -> BlockPtr {
        let total = block.units();
        debug_assert!(total >= units, "split {total} < {units}");
        if total == units {
            return block;
        }
        let rest = total - units;
        let (taken, remainder) = if front {
            let remainder = block.offset(units);
            remainder.init(rest, units, self.index);
            block.set_units(units);
            (block, remainder)
        } else {
            let taken = block.offset(rest);
            taken.init(units, rest, self.index);
            block.set_units(rest);
            (taken, block)
        };
        let last = if front { remainder } else { taken };
        if let Some(next) = last.next(self.page_size) {
            next.set_previous_units(last.units());
        }
        lists.insert(remainder);
        taken
    }

    /// Split a front fragment off `block` so the returned block's payload
    /// starts on a cache line. The fragment goes back on the lists.
    fn align_payload(&self, lists: &mut FreeLists, block: BlockPtr) -> BlockPtr {
        let misalign = block.payload().as_ptr() as usize % CACHE_LINE;
        if misalign == 0 {
            return block;
        }
        let skip = (CACHE_LINE - misalign) / UNIT;
        let aligned = block.offset(skip);
        aligned.init(block.units() - skip, skip, self.index);
        block.set_units(skip);
        if let Some(next) = aligned.next(self.page_size) {
            next.set_previous_units(aligned.units());
        }
        lists.insert(block);
        aligned
    }

    /// Validate and merge a block back into the free lists. Returns the page
    /// when the merge leaves it entirely free; the caller releases it after
    /// dropping the lock.
    pub(crate) fn release_block(&self, lists: &mut FreeLists, block: BlockPtr) -> Option<NonNull<u8>> {
        block.check_links(self.page_size);
        block.set_state(BlockState::empty());

        if let Some(next) = block.next(self.page_size)
            && next.state().is_free()
        {
            lists.remove(next);
            let merged = block.units() + next.units();
            next.scrub();
            block.set_units(merged);
            if let Some(after) = block.next(self.page_size) {
                after.set_previous_units(merged);
            }
        }

        let mut block = block;
        if let Some(prev) = block.previous()
            && prev.state().is_free()
        {
            lists.remove(prev);
            let merged = prev.units() + block.units();
            block.scrub();
            prev.set_units(merged);
            if let Some(after) = prev.next(self.page_size) {
                after.set_previous_units(merged);
            }
            block = prev;
        }

        if block.is_page_start() && block.units() == self.page_units() {
            block.scrub();
            self.counters.note_page_released();
            // Safety: page-start header address is the page address.
            return Some(unsafe { NonNull::new_unchecked(block.as_ptr()) });
        }
        lists.insert(block);
        None
    }

    /// Merge every pending free under the held lock. Whole pages found along
    /// the way are returned for release after unlock.
    pub(crate) fn drain_pending(&self, lists: &mut FreeLists) -> Vec<NonNull<u8>> {
        let mut pages = Vec::new();
        let mut drained = 0usize;
        for payload in self.pending.take() {
            // Safety: only small pool blocks of this descriptor are queued.
            let block = unsafe { BlockPtr::from_payload(payload, self.page_size) };
            self.counters.note_free(block.units() << UNIT_SHIFT);
            if let Some(page) = self.release_block(lists, block) {
                pages.push(page);
            }
            drained += 1;
        }
        if drained != 0 {
            log::trace!("{:?} pool node {} drained {drained} pending frees", self.base, self.index);
        }
        pages
    }

    /// Take the lock, drain pending frees, and hand emptied pages back.
    pub(crate) fn flush_pending(&self, provider: &dyn PageProvider) -> usize {
        if self.pending.depth() == 0 {
            return 0;
        }
        let pages = {
            let mut lists = self.lock();
            self.drain_pending(&mut lists)
        };
        let released = pages.len();
        self.release_pages(provider, pages);
        released
    }

    pub(crate) fn release_pages(&self, provider: &dyn PageProvider, pages: Vec<NonNull<u8>>) {
        for page in pages {
            log::debug!("{:?} pool node {} released page {page:p}", self.base, self.index);
            // Safety: the page came from this provider and is entirely free.
            if unsafe { provider.free_pages(page) }.is_none() {
                bug_check(BugCheck::BadPoolCaller {
                    check: "page provider does not own pool page",
                    address: page.as_ptr() as usize,
                });
            }
        }
    }
}
