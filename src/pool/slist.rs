//! Bounded lock-free LIFO of pool blocks.
//!
//! Nodes are linked through the first `usize` of their payload. The top of
//! the stack is one 128-bit word: the top node in the low half and a
//! generation in the high half, bumped by every successful push and pop.
//!
//! A pop reads the link of the node it saw on top before its CAS. By then
//! another processor may have popped that node, reused it, even returned its
//! page to the provider. The word read is garbage in that case, but the
//! generation has moved on, so the CAS fails and the garbage is dropped.
//! This needs only that pool pages stay readable once mapped, which
//! [`PageProvider`](super::page::PageProvider) guarantees.

use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU32, AtomicU128, AtomicUsize, Ordering};

/// Stack top: node address and generation.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Top(u128);

impl Top {
    const EMPTY: Self = Self(0);

    #[inline]
    fn node(self) -> *mut u8 {
        (self.0 as usize) as *mut u8
    }

    #[inline]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }

    /// The next top after replacing the node with `node`.
    #[inline]
    fn succeed(self, node: *mut u8) -> Self {
        Self(u128::from(self.generation().wrapping_add(1)) << 64 | node as usize as u128)
    }
}

impl std::fmt::Debug for Top {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Top({:p}, gen={})", self.node(), self.generation())
    }
}

pub(crate) struct SList {
    top: AtomicU128,
    count: AtomicU32,
}

impl SList {
    pub(crate) fn new() -> Self {
        Self {
            top: AtomicU128::new(Top::EMPTY.0),
            count: AtomicU32::new(0),
        }
    }

    #[inline]
    fn link(node: *mut u8) -> *const AtomicUsize {
        debug_assert!(
            (node as usize).is_multiple_of(std::mem::align_of::<AtomicUsize>()),
            "slist node is not atomically aligned: {node:p}",
        );
        node.cast::<AtomicUsize>()
    }

    /// Nodes currently on the stack. Approximate under concurrency.
    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Push `node` unless the stack already holds `limit` nodes.
    ///
    /// Returns false, leaving `node` with the caller, when full.
    ///
    /// # Safety
    /// `node` must be owned by the caller, point at least `usize` bytes of
    /// writable memory, and stay mapped until popped.
    pub(crate) unsafe fn try_push(&self, node: NonNull<u8>, limit: u32) -> bool {
        // Claim room first so the count never overshoots `limit`.
        if self.count.fetch_add(1, Ordering::Relaxed) >= limit {
            self.count.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        let mut top = Top(self.top.load(Ordering::Relaxed));
        loop {
            // Safety: the node is ours until the CAS publishes it.
            unsafe { (*Self::link(node.as_ptr())).store(top.node() as usize, Ordering::Relaxed) };
            match self.top.compare_exchange_weak(
                top.0,
                top.succeed(node.as_ptr()).0,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => top = Top(current),
            }
        }
    }

    /// Pop the most recently pushed node.
    pub(crate) fn pop(&self) -> Option<NonNull<u8>> {
        let mut top = Top(self.top.load(Ordering::Acquire));
        loop {
            let node = NonNull::new(top.node())?;
            // Safety: pool memory stays mapped; a stale link is discarded by
            // the failing CAS below.
            let next = unsafe { (*Self::link(node.as_ptr())).load(Ordering::Relaxed) };
            match self.top.compare_exchange_weak(
                top.0,
                top.succeed(next as *mut u8).0,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.count.fetch_sub(1, Ordering::Relaxed);
                    return Some(node);
                }
                Err(current) => top = Top(current),
            }
        }
    }
}

// Safety: SList only uses atomics; node memory ownership moves with push/pop.
unsafe impl Send for SList {}
// Safety: see above.
unsafe impl Sync for SList {}
