//! Usage counters behind `query_pool_usage`.
//!
//! Every counter is `Relaxed`. A reader folding several of them (pages
//! against bytes, say) can see one side of an operation without the other;
//! the figures are for reporting and for the low-priority pressure check,
//! which tolerates a stale read.

use crate::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

/// A level that goes up and down.
///
/// Frees counted on one processor can land before the allocation they undo
/// is counted on another, so the raw value may dip below zero. Reads clamp.
pub(crate) struct Gauge(AtomicIsize);

impl Gauge {
    pub(crate) fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    pub(crate) fn raise(&self, by: usize) {
        self.0.fetch_add(by.min(isize::MAX as usize).cast_signed(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn lower(&self, by: usize) {
        self.0.fetch_sub(by.min(isize::MAX as usize).cast_signed(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn level(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl std::fmt::Debug for Gauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gauge({})", self.level())
    }
}

/// Running totals of one pool descriptor.
///
/// `bytes` counts blocks that are live, parked on a lookaside list, or
/// waiting on the pending list; `frees` only moves once a block is really
/// back on the free lists or cached.
pub(crate) struct PoolCounters {
    allocs: AtomicU64,
    frees: AtomicU64,
    pages: Gauge,
    big_pages: Gauge,
    bytes: Gauge,
}

impl PoolCounters {
    pub(crate) fn new() -> Self {
        Self {
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            pages: Gauge::new(),
            big_pages: Gauge::new(),
            bytes: Gauge::new(),
        }
    }

    #[inline]
    pub(crate) fn note_alloc(&self, bytes: usize) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.bytes.raise(bytes);
    }

    #[inline]
    pub(crate) fn note_free(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.bytes.lower(bytes);
    }

    /// A lookaside block went back to the free lists. Its free was counted
    /// when it was cached.
    #[inline]
    pub(crate) fn note_uncached(&self, bytes: usize) {
        self.bytes.lower(bytes);
    }

    pub(crate) fn note_page_taken(&self) {
        self.pages.raise(1);
    }

    pub(crate) fn note_page_released(&self) {
        self.pages.lower(1);
    }

    pub(crate) fn note_big_alloc(&self, pages: usize, bytes: usize) {
        self.big_pages.raise(pages);
        self.note_alloc(bytes);
    }

    pub(crate) fn note_big_free(&self, pages: usize, bytes: usize) {
        self.big_pages.lower(pages);
        self.note_free(bytes);
    }

    pub(crate) fn allocs(&self) -> u64 {
        self.allocs.load(Ordering::Relaxed)
    }

    pub(crate) fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Pages carved into small blocks.
    pub(crate) fn pages(&self) -> usize {
        self.pages.level()
    }

    pub(crate) fn big_pages(&self) -> usize {
        self.big_pages.level()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes.level()
    }
}
