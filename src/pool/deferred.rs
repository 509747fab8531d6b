//! Per-descriptor pending-free list.
//!
//! Producers push freed blocks with a single CAS and never touch the
//! descriptor lock. Whoever pushes the block that reaches the batch limit,
//! or an allocation about to give up, takes the whole chain with one swap
//! and merges it under a single lock acquisition. Since the consumer
//! detaches the entire chain at once, no node is ever read after another
//! thread could have reclaimed it, and the head needs no generation tag.

use std::ptr::NonNull;

use crate::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct PendingFrees {
    head: AtomicUsize,
    depth: AtomicUsize,
}

impl PendingFrees {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    #[inline]
    unsafe fn link(node: *mut u8) -> *const AtomicUsize {
        node.cast::<AtomicUsize>()
    }

    /// Queue `node` and return the depth after the push.
    ///
    /// # Safety
    /// `node` is the payload of a block the caller owns, at least `usize`
    /// bytes long, that stays mapped until drained.
    pub(crate) unsafe fn push(&self, node: NonNull<u8>) -> usize {
        // Count before publishing so a racing drain never underflows.
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: caller owns node.
            unsafe { (*Self::link(node.as_ptr())).store(head, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr() as usize,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        depth
    }

    /// Detach every queued node.
    pub(crate) fn take(&self) -> PendingChain<'_> {
        let head = self.head.swap(0, Ordering::Acquire);
        PendingChain { next: head, depth: &self.depth }
    }

    #[inline]
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Nodes detached by [`PendingFrees::take`], newest first.
pub(crate) struct PendingChain<'a> {
    next: usize,
    depth: &'a AtomicUsize,
}

impl Iterator for PendingChain<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<NonNull<u8>> {
        let node = NonNull::new(self.next as *mut u8)?;
        // Safety: the chain is exclusively ours after the swap; each node
        // was written by `push` before being published.
        self.next = unsafe { (*PendingFrees::link(node.as_ptr())).load(Ordering::Relaxed) };
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(node)
    }
}
