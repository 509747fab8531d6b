//! Logical processor numbering.
//!
//! User-space threads migrate freely, so each thread is pinned to a logical
//! processor slot the first time it touches a pool. Slots are handed out
//! round-robin; per-processor structures index by `slot % processors`.

use std::cell::Cell;

crate::sync::static_atomic! {
    static NEXT_SLOT: crate::sync::atomic::AtomicUsize = crate::sync::atomic::AtomicUsize::new(0);
}

thread_local! {
    static SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn thread_slot() -> usize {
    SLOT.with(|slot| {
        if let Some(s) = slot.get() {
            return s;
        }
        let s = NEXT_SLOT.fetch_add(1, crate::sync::atomic::Ordering::Relaxed);
        slot.set(Some(s));
        s
    })
}

/// Processor index of the calling thread in `0..processors`.
#[inline]
pub(crate) fn current_processor(processors: usize) -> usize {
    thread_slot() % processors
}

/// Home NUMA node of `processor`. Processors are split into `nodes`
/// contiguous ranges.
#[inline]
pub(crate) fn node_of(processor: usize, processors: usize, nodes: usize) -> usize {
    processor * nodes / processors
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_processor_is_stable_per_thread() {
        let a = current_processor(8);
        let b = current_processor(8);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn test_node_ranges() {
        let nodes: Vec<_> = (0..8).map(|p| node_of(p, 8, 2)).collect();
        assert_eq!(nodes, [0, 0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(node_of(2, 3, 1), 0);
    }

    #[test]
    fn test_threads_spread_over_slots() {
        let slots: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(thread_slot))
            .map(|h| h.join().unwrap())
            .collect();
        let mut sorted = slots.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), slots.len(), "each thread gets its own slot");
    }
}
