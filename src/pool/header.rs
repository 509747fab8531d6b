//! Block header layout and the checked accessor every pool path goes through.
//!
//! Each small block is a 16-byte header followed by its payload, both inside
//! one pool page. Sizes are counted in 16-byte units and include the header,
//! so a page of `P` bytes holds at most `P / 16` units. Neighbours are found
//! by arithmetic: the next header sits `block_size` units on, the previous
//! one `previous_size` units back. `previous_size == 0` marks the first block
//! of a page.

use std::ptr::{NonNull, addr_of, addr_of_mut};

use bitflags::bitflags;

use super::error::{BugCheck, bug_check};
use super::types::{PoolTag, ProcessId};
use crate::sync::raw::{AtomicU8, Ordering};

pub(crate) const UNIT_SHIFT: u32 = 4;
pub(crate) const UNIT: usize = 1 << UNIT_SHIFT;
pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();
/// Classes small enough for the lookaside caches.
pub(crate) const SMALL_LISTS: usize = 32;
pub(crate) const CACHE_LINE: usize = 64;

const _: () = assert!(HEADER_SIZE == UNIT);

bitflags! {
    /// Header state byte. A block with neither `IN_USE` nor `CACHED` is free.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct BlockState: u8 {
        const IN_USE = 1 << 0;
        const PAGED = 1 << 1;
        const QUOTA = 1 << 2;
        const SESSION = 1 << 3;
        /// Parked on a lookaside list or a pending-free list. Owned by the
        /// pool but not mergeable.
        const CACHED = 1 << 4;
    }
}

impl BlockState {
    #[inline]
    pub(crate) fn is_free(self) -> bool {
        !self.intersects(Self::IN_USE | Self::CACHED)
    }
}

#[repr(C)]
pub(crate) struct BlockHeader {
    previous_size: u16,
    block_size: u16,
    pool_index: u8,
    state: AtomicU8,
    _spare: u16,
    tag: u32,
    billed: u32,
}

/// Units needed for a request of `bytes`, header included.
#[inline]
pub(crate) const fn units_for(bytes: usize) -> usize {
    (bytes + HEADER_SIZE + UNIT - 1) >> UNIT_SHIFT
}

/// Usable payload bytes of a block of `units`.
#[inline]
pub(crate) const fn usable_bytes(units: usize) -> usize {
    (units << UNIT_SHIFT) - HEADER_SIZE
}

/// Largest request served from the free lists. Anything larger is a whole
/// page allocation.
#[inline]
pub(crate) const fn max_small_size(page_size: usize) -> usize {
    page_size - 2 * HEADER_SIZE
}

/// Handle to a header inside a committed pool page.
///
/// Construction is unsafe; once built, the accessors rely on the header
/// staying mapped. That holds while the block is allocated, cached, or free
/// under the owning descriptor's lock, which is the only time pool code
/// holds a `BlockPtr`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockPtr(NonNull<BlockHeader>);

impl std::fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockPtr({:#x}, units={})", self.addr(), self.units())
    }
}

impl BlockPtr {
    /// # Safety
    /// `ptr` must address a 16-byte-aligned header slot inside a committed
    /// pool page that stays mapped while the handle is used.
    #[inline]
    pub(crate) unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self(ptr.cast())
    }

    /// Recover the header of `payload`, checking the fields a corrupted or
    /// foreign pointer would get wrong.
    ///
    /// # Safety
    /// `payload` must be an address the caller obtained from a small pool
    /// allocation, so that its header page is mapped.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>, page_size: usize) -> Self {
        let addr = payload.as_ptr() as usize;
        if !addr.is_multiple_of(UNIT) || addr & (page_size - 1) < HEADER_SIZE {
            bug_check(BugCheck::BadPoolCaller { check: "misaligned payload", address: addr });
        }
        // Safety: the header precedes the payload in the same page.
        unsafe { Self::from_raw(NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE))) }
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    #[inline]
    pub(crate) fn payload(self) -> NonNull<u8> {
        // Safety: the payload directly follows the header.
        unsafe { NonNull::new_unchecked(self.as_ptr().add(HEADER_SIZE)) }
    }

    // Fields are read and written one at a time through raw pointers. Other
    // threads touch other fields of the same header concurrently (a
    // neighbour's merge reads `state` while the owner stamps `tag`), so no
    // reference to the whole header is ever formed.

    #[inline]
    fn state_cell(&self) -> &AtomicU8 {
        // Safety: type invariant; the reference covers the atomic byte only.
        unsafe { &*addr_of!((*self.0.as_ptr()).state) }
    }

    #[inline]
    pub(crate) fn units(self) -> usize {
        // Safety: type invariant.
        usize::from(unsafe { addr_of!((*self.0.as_ptr()).block_size).read() })
    }

    #[inline]
    pub(crate) fn previous_units(self) -> usize {
        // Safety: type invariant.
        usize::from(unsafe { addr_of!((*self.0.as_ptr()).previous_size).read() })
    }

    #[inline]
    pub(crate) fn pool_index(self) -> usize {
        // Safety: type invariant.
        usize::from(unsafe { addr_of!((*self.0.as_ptr()).pool_index).read() })
    }

    #[inline]
    pub(crate) fn state(self) -> BlockState {
        BlockState::from_bits_retain(self.state_cell().load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn tag(self) -> PoolTag {
        // Safety: type invariant.
        PoolTag::from_raw(unsafe { addr_of!((*self.0.as_ptr()).tag).read() })
    }

    #[inline]
    pub(crate) fn billed(self) -> ProcessId {
        // Safety: type invariant.
        ProcessId(unsafe { addr_of!((*self.0.as_ptr()).billed).read() })
    }

    #[inline]
    pub(crate) fn set_state(self, state: BlockState) {
        self.state_cell().store(state.bits(), Ordering::Release);
    }

    /// Atomically move `from` to `to`. Fails if another path changed the
    /// state first.
    #[inline]
    pub(crate) fn transition(self, from: BlockState, to: BlockState) -> bool {
        self.state_cell()
            .compare_exchange(from.bits(), to.bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // Plain field writes. Callers own the block or hold the descriptor lock.

    #[inline]
    pub(crate) fn set_units(self, units: usize) {
        debug_assert!(units <= usize::from(u16::MAX));
        // Safety: type invariant; no other path writes this field concurrently.
        unsafe { addr_of_mut!((*self.0.as_ptr()).block_size).write(units as u16) };
    }

    #[inline]
    pub(crate) fn set_previous_units(self, units: usize) {
        debug_assert!(units <= usize::from(u16::MAX));
        // Safety: as above.
        unsafe { addr_of_mut!((*self.0.as_ptr()).previous_size).write(units as u16) };
    }

    #[inline]
    pub(crate) fn set_pool_index(self, index: usize) {
        debug_assert!(index <= usize::from(u8::MAX));
        // Safety: as above.
        unsafe { addr_of_mut!((*self.0.as_ptr()).pool_index).write(index as u8) };
    }

    #[inline]
    pub(crate) fn set_tag(self, tag: PoolTag) {
        // Safety: as above.
        unsafe { addr_of_mut!((*self.0.as_ptr()).tag).write(tag.raw()) };
    }

    #[inline]
    pub(crate) fn set_billed(self, process: ProcessId) {
        // Safety: as above.
        unsafe { addr_of_mut!((*self.0.as_ptr()).billed).write(process.0) };
    }

    /// Write a complete header for a freshly carved block.
    pub(crate) fn init(self, units: usize, previous_units: usize, pool_index: usize) {
        self.set_units(units);
        self.set_previous_units(previous_units);
        self.set_pool_index(pool_index);
        self.set_state(BlockState::empty());
        self.set_tag(PoolTag::NONE);
        self.set_billed(ProcessId::SYSTEM);
    }

    /// Wipe a header absorbed into a larger block so a stale pointer to it
    /// reads as free and trips double-free detection.
    pub(crate) fn scrub(self) {
        self.set_state(BlockState::empty());
        self.set_units(0);
        self.set_previous_units(0);
    }

    #[inline]
    pub(crate) fn page_offset(self, page_size: usize) -> usize {
        self.addr() & (page_size - 1)
    }

    #[inline]
    pub(crate) fn is_page_start(self) -> bool {
        self.previous_units() == 0
    }

    /// Following block in the same page, if any.
    #[inline]
    pub(crate) fn next(self, page_size: usize) -> Option<Self> {
        let end = self.page_offset(page_size) + (self.units() << UNIT_SHIFT);
        if end >= page_size {
            return None;
        }
        // Safety: end < page_size, so the next header is in the same page.
        Some(unsafe { Self::from_raw(NonNull::new_unchecked(self.as_ptr().add(self.units() << UNIT_SHIFT))) })
    }

    /// Preceding block in the same page, if any.
    #[inline]
    pub(crate) fn previous(self) -> Option<Self> {
        if self.is_page_start() {
            return None;
        }
        // Safety: previous_size was checked against the page offset by
        // `check_links` before any caller walks backwards.
        Some(unsafe {
            Self::from_raw(NonNull::new_unchecked(self.as_ptr().sub(self.previous_units() << UNIT_SHIFT)))
        })
    }

    /// Header at `units` into this block.
    #[inline]
    pub(crate) fn offset(self, units: usize) -> Self {
        // Safety: callers only offset within the current block's extent.
        unsafe { Self::from_raw(NonNull::new_unchecked(self.as_ptr().add(units << UNIT_SHIFT))) }
    }

    /// Verify size and neighbour links against the page layout. Any mismatch
    /// is a fatal stop naming the failing check.
    pub(crate) fn check_links(self, page_size: usize) {
        let address = self.addr();
        let offset = self.page_offset(page_size);
        let units = self.units();
        if units == 0 || offset + (units << UNIT_SHIFT) > page_size {
            bug_check(BugCheck::BadPoolHeader { check: "block size out of page", address });
        }
        if (self.previous_units() << UNIT_SHIFT) > offset {
            bug_check(BugCheck::BadPoolHeader { check: "previous size out of page", address });
        }
        if let Some(prev) = self.previous() {
            if prev.units() != self.previous_units() {
                bug_check(BugCheck::BadPoolHeader { check: "previous block size mismatch", address });
            }
        } else if offset != 0 {
            bug_check(BugCheck::BadPoolHeader { check: "first block not at page start", address });
        }
        if let Some(next) = self.next(page_size)
            && next.previous_units() != units
        {
            bug_check(BugCheck::BadPoolHeader { check: "next block back link mismatch", address });
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    struct TestPage {
        ptr: NonNull<u8>,
        layout: std::alloc::Layout,
    }

    impl TestPage {
        fn new() -> Self {
            let layout = std::alloc::Layout::from_size_align(PAGE, PAGE).unwrap();
            // Safety: Test code.
            let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
            Self { ptr, layout }
        }

        fn block(&self, unit: usize) -> BlockPtr {
            // Safety: Test code; unit is inside the page.
            unsafe { BlockPtr::from_raw(NonNull::new_unchecked(self.ptr.as_ptr().add(unit * UNIT))) }
        }
    }

    impl Drop for TestPage {
        fn drop(&mut self) {
            // Safety: Test code.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn test_header_is_one_unit() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(std::mem::align_of::<BlockHeader>(), 4);
    }

    #[test]
    fn test_size_classing() {
        assert_eq!(units_for(1), 2);
        assert_eq!(units_for(16), 2);
        assert_eq!(units_for(17), 3);
        assert_eq!(units_for(32), 3);
        for size in 1..600 {
            let usable = usable_bytes(units_for(size));
            assert!(usable >= size && usable < size + UNIT, "size {size} -> {usable}");
        }
        assert_eq!(max_small_size(PAGE), 4064);
        assert_eq!(units_for(max_small_size(PAGE)), PAGE / UNIT - 1);
    }

    #[test]
    fn test_neighbour_walk() {
        let page = TestPage::new();
        let a = page.block(0);
        a.init(4, 0, 0);
        let b = page.block(4);
        b.init(PAGE / UNIT - 4, 4, 0);

        assert_eq!(a.next(PAGE), Some(b));
        assert_eq!(b.previous(), Some(a));
        assert_eq!(a.previous(), None);
        assert_eq!(b.next(PAGE), None);
        a.check_links(PAGE);
        b.check_links(PAGE);
    }

    #[test]
    fn test_state_transitions() {
        let page = TestPage::new();
        let a = page.block(0);
        a.init(2, 0, 0);
        assert!(a.state().is_free());
        a.set_state(BlockState::IN_USE | BlockState::PAGED);
        assert!(!a.state().is_free());
        assert!(a.transition(BlockState::IN_USE | BlockState::PAGED, BlockState::CACHED | BlockState::PAGED));
        assert!(!a.transition(BlockState::IN_USE | BlockState::PAGED, BlockState::empty()));
        assert!(!a.state().is_free());
    }

    #[test]
    fn test_field_writes_race_state_reads() {
        let page = TestPage::new();
        let a = page.block(0);
        a.init(4, 0, 0);
        let b = page.block(4);
        b.init(4, 4, 0);
        a.set_state(BlockState::IN_USE);
        let addr = a.addr();
        std::thread::scope(|s| {
            s.spawn(|| {
                // Safety: Test code; `a` lives in `page` for the whole scope.
                let a = unsafe { BlockPtr::from_raw(NonNull::new(addr as *mut u8).unwrap()) };
                for i in 0..1000u32 {
                    a.set_tag(PoolTag::from_raw(i));
                    a.set_billed(ProcessId(i));
                }
            });
            // What a neighbour's merge does while the owner stamps its header.
            for _ in 0..1000 {
                assert!(!b.previous().unwrap().state().is_free());
                assert_eq!(b.previous_units(), 4);
            }
        });
        assert_eq!((a.tag().raw(), a.billed()), (999, ProcessId(999)));
    }

    #[test]
    fn test_payload_round_trip() {
        let page = TestPage::new();
        let a = page.block(3);
        a.init(5, 3, 0);
        // Safety: Test code.
        let back = unsafe { BlockPtr::from_payload(a.payload(), PAGE) };
        assert_eq!(back, a);
    }

    #[test]
    #[should_panic(expected = "next block back link mismatch")]
    fn test_broken_back_link_is_fatal() {
        let page = TestPage::new();
        let a = page.block(0);
        a.init(4, 0, 0);
        let b = page.block(4);
        b.init(8, 3, 0);
        a.check_links(PAGE);
    }

    #[test]
    #[should_panic(expected = "misaligned payload")]
    fn test_page_aligned_payload_rejected() {
        let page = TestPage::new();
        // Safety: Test code; the check fires before any dereference.
        unsafe { BlockPtr::from_payload(page.ptr, PAGE) };
    }
}
