//! Per-processor lookaside caches for the small size classes.
//!
//! Every processor owns a private list per (base type, class) and all
//! processors share a second tier. Pop and push try the private list first.
//! Each list's depth is a soft cap retuned periodically by
//! [`compute_depth`], a bounded negative-feedback controller that grows the
//! cap while misses are frequent and decays it when the list sits idle.

use std::ptr::NonNull;

use super::header::SMALL_LISTS;
use super::slist::SList;
use super::types::{BasePoolType, LookasideInfo};
use crate::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Below this many allocations per period the list is considered idle.
const MINIMUM_ALLOCATION_THRESHOLD: u64 = 25;
/// Shrink step for idle lists.
const IDLE_SHRINK: u32 = 10;
/// Miss ratio (per mille) under which a busy list is over-provisioned.
const LOW_MISS_RATIO: u64 = 5;
const MAXIMUM_GROWTH: u64 = 30;
const BASE_GROWTH: u64 = 5;

/// Next depth for a list that saw `allocates` allocations with `misses`
/// misses since the previous adjustment. The result is always within
/// `[minimum, maximum]`.
pub(crate) fn compute_depth(allocates: u64, misses: u64, minimum: u32, maximum: u32, depth: u32) -> u32 {
    let depth = depth.clamp(minimum, maximum);
    let next = if allocates < MINIMUM_ALLOCATION_THRESHOLD {
        depth.saturating_sub(IDLE_SHRINK)
    } else {
        let ratio = misses.min(allocates) * 1000 / allocates;
        if ratio < LOW_MISS_RATIO {
            depth.saturating_sub(1)
        } else {
            let headroom = u64::from(maximum - depth);
            let growth = (ratio * headroom / 2000 + BASE_GROWTH).min(MAXIMUM_GROWTH);
            depth.saturating_add(growth as u32)
        }
    };
    next.clamp(minimum, maximum)
}

pub(crate) struct LookasideList {
    list: SList,
    depth: AtomicU32,
    minimum: u32,
    maximum: u32,
    total_allocates: AtomicU64,
    allocate_misses: AtomicU64,
    total_frees: AtomicU64,
    free_misses: AtomicU64,
    last_total_allocates: AtomicU64,
    last_allocate_misses: AtomicU64,
}

impl LookasideList {
    fn new(minimum: u32, maximum: u32) -> Self {
        Self {
            list: SList::new(),
            depth: AtomicU32::new(minimum),
            minimum,
            maximum,
            total_allocates: AtomicU64::new(0),
            allocate_misses: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
            free_misses: AtomicU64::new(0),
            last_total_allocates: AtomicU64::new(0),
            last_allocate_misses: AtomicU64::new(0),
        }
    }

    fn pop(&self) -> Option<NonNull<u8>> {
        self.total_allocates.fetch_add(1, Ordering::Relaxed);
        let node = self.list.pop();
        if node.is_none() {
            self.allocate_misses.fetch_add(1, Ordering::Relaxed);
        }
        node
    }

    /// # Safety
    /// See [`SList::try_push`].
    unsafe fn push(&self, node: NonNull<u8>) -> bool {
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        let depth = self.depth.load(Ordering::Relaxed);
        // Safety: forwarded from caller.
        let pushed = unsafe { self.list.try_push(node, depth) };
        if !pushed {
            self.free_misses.fetch_add(1, Ordering::Relaxed);
        }
        pushed
    }

    fn adjust(&self) {
        let allocates = self.total_allocates.load(Ordering::Relaxed);
        let misses = self.allocate_misses.load(Ordering::Relaxed);
        let period_allocates = allocates.wrapping_sub(self.last_total_allocates.swap(allocates, Ordering::Relaxed));
        let period_misses = misses.wrapping_sub(self.last_allocate_misses.swap(misses, Ordering::Relaxed));
        let depth = self.depth.load(Ordering::Relaxed);
        let next = compute_depth(period_allocates, period_misses, self.minimum, self.maximum, depth);
        if next != depth {
            log::trace!("lookaside depth {depth} -> {next} ({period_misses}/{period_allocates} misses)");
        }
        self.depth.store(next, Ordering::Relaxed);
    }

    fn hits(&self) -> u64 {
        self.total_allocates
            .load(Ordering::Relaxed)
            .saturating_sub(self.allocate_misses.load(Ordering::Relaxed))
    }

    fn cached_frees(&self) -> u64 {
        self.total_frees
            .load(Ordering::Relaxed)
            .saturating_sub(self.free_misses.load(Ordering::Relaxed))
    }

    fn info(&self) -> LookasideInfo {
        LookasideInfo {
            depth: self.depth.load(Ordering::Relaxed),
            minimum_depth: self.minimum,
            maximum_depth: self.maximum,
            cached: self.list.len(),
            total_allocates: self.total_allocates.load(Ordering::Relaxed),
            allocate_misses: self.allocate_misses.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            free_misses: self.free_misses.load(Ordering::Relaxed),
        }
    }
}

/// One processor's (or the shared tier's) lists, indexed by base type then
/// class. Class `u` lives at `u - 1`.
struct ListSet(Box<[LookasideList]>);

impl ListSet {
    fn new(minimum: u32, maximum: u32) -> Self {
        Self((0..2 * SMALL_LISTS).map(|_| LookasideList::new(minimum, maximum)).collect())
    }

    #[inline]
    fn get(&self, base: BasePoolType, units: usize) -> &LookasideList {
        debug_assert!((1..=SMALL_LISTS).contains(&units));
        &self.0[base.index() * SMALL_LISTS + units - 1]
    }

    fn of_base(&self, base: BasePoolType) -> &[LookasideList] {
        &self.0[base.index() * SMALL_LISTS..(base.index() + 1) * SMALL_LISTS]
    }
}

/// Adjustment groups, visited round-robin one per period.
const GROUPS: usize = 3;

pub(crate) struct Lookasides {
    per_processor: Box<[ListSet]>,
    shared: ListSet,
    next_group: AtomicUsize,
}

impl Lookasides {
    /// With `enabled == false` every list is pinned at depth zero.
    pub(crate) fn new(processors: usize, enabled: bool, minimum: u32, maximum: u32) -> Self {
        let (minimum, maximum) = if enabled { (minimum, maximum) } else { (0, 0) };
        Self {
            per_processor: (0..processors).map(|_| ListSet::new(minimum, maximum)).collect(),
            shared: ListSet::new(minimum, maximum),
            next_group: AtomicUsize::new(0),
        }
    }

    /// Private list first, then the shared tier.
    pub(crate) fn pop(&self, processor: usize, base: BasePoolType, units: usize) -> Option<NonNull<u8>> {
        self.per_processor[processor]
            .get(base, units)
            .pop()
            .or_else(|| self.shared.get(base, units).pop())
    }

    /// # Safety
    /// `node` is the payload of a block the caller owns and has marked
    /// cached; it stays mapped while on the list.
    pub(crate) unsafe fn push(
        &self,
        processor: usize,
        base: BasePoolType,
        units: usize,
        node: NonNull<u8>,
    ) -> bool {
        // Safety: forwarded from caller.
        unsafe {
            self.per_processor[processor].get(base, units).push(node)
                || self.shared.get(base, units).push(node)
        }
    }

    /// Retune one group: nonpaged private lists, paged private lists, or the
    /// shared tier. Returns the group visited.
    pub(crate) fn adjust_next_group(&self) -> usize {
        let group = self.next_group.fetch_add(1, Ordering::Relaxed) % GROUPS;
        match group {
            0 | 1 => {
                let base = if group == 0 { BasePoolType::NonPaged } else { BasePoolType::Paged };
                for set in &self.per_processor {
                    set.of_base(base).iter().for_each(LookasideList::adjust);
                }
            }
            _ => self.shared.0.iter().for_each(LookasideList::adjust),
        }
        group
    }

    /// Pop every cached node of every list and hand it to `f`.
    pub(crate) fn drain(&self, mut f: impl FnMut(BasePoolType, NonNull<u8>)) {
        for set in self.per_processor.iter().chain(std::iter::once(&self.shared)) {
            for base in BasePoolType::ALL {
                for list in set.of_base(base) {
                    while let Some(node) = list.list.pop() {
                        f(base, node);
                    }
                }
            }
        }
    }

    fn all(&self) -> impl Iterator<Item = &ListSet> {
        self.per_processor.iter().chain(std::iter::once(&self.shared))
    }

    /// Allocations served from cache, all tiers.
    pub(crate) fn hits(&self, base: BasePoolType) -> u64 {
        self.all().flat_map(|s| s.of_base(base)).map(LookasideList::hits).sum()
    }

    /// Frees absorbed by cache, all tiers.
    pub(crate) fn cached_frees(&self, base: BasePoolType) -> u64 {
        self.all().flat_map(|s| s.of_base(base)).map(LookasideList::cached_frees).sum()
    }

    pub(crate) fn info(&self, processor: usize, base: BasePoolType, units: usize) -> LookasideInfo {
        self.per_processor[processor].get(base, units).info()
    }

    #[cfg(test)]
    pub(crate) fn shared_info(&self, base: BasePoolType, units: usize) -> LookasideInfo {
        self.shared.get(base, units).info()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_idle_list_shrinks_to_minimum() {
        assert_eq!(compute_depth(0, 0, 4, 256, 100), 90);
        assert_eq!(compute_depth(10, 10, 4, 256, 8), 4);
        assert_eq!(compute_depth(0, 0, 4, 256, 4), 4);
    }

    #[test]
    fn test_low_miss_ratio_shrinks_by_one() {
        assert_eq!(compute_depth(1000, 1, 4, 256, 50), 49);
        assert_eq!(compute_depth(1000, 0, 4, 256, 4), 4);
    }

    #[test]
    fn test_high_miss_ratio_grows_capped() {
        // Every allocation missed: growth capped at the per-period maximum.
        assert_eq!(compute_depth(100, 100, 4, 256, 4), 34);
        // Small ratio: proportional growth plus the base step.
        assert_eq!(compute_depth(1000, 10, 4, 256, 56), 56 + 1 + 5);
        // Never past the maximum.
        assert_eq!(compute_depth(100, 100, 4, 256, 250), 256);
    }

    #[test]
    fn test_depth_always_within_bounds() {
        let mut depth = 4;
        let mut seed = 0x2545_f491_u64;
        for _ in 0..10_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let allocates = seed % 500;
            let misses = (seed >> 16) % (allocates + 1);
            depth = compute_depth(allocates, misses, 4, 256, depth);
            assert!((4..=256).contains(&depth), "depth {depth} escaped bounds");
        }
    }

    #[test]
    fn test_disabled_lists_pass_through() {
        let la = Lookasides::new(1, false, 4, 256);
        let mut node = Box::new([0usize; 2]);
        let ptr = NonNull::from(&mut *node).cast::<u8>();
        // Safety: Test code.
        assert!(!unsafe { la.push(0, BasePoolType::NonPaged, 2, ptr) });
        la.adjust_next_group();
        la.adjust_next_group();
        la.adjust_next_group();
        let info = la.info(0, BasePoolType::NonPaged, 2);
        assert_eq!((info.depth, info.minimum_depth, info.maximum_depth), (0, 0, 0));
    }

    #[test]
    fn test_private_then_shared_tier() {
        let la = Lookasides::new(2, true, 1, 4);
        let mut storage: Vec<Box<[usize; 2]>> = (0..3).map(|_| Box::new([0; 2])).collect();
        let ptrs: Vec<NonNull<u8>> = storage.iter_mut().map(|b| NonNull::from(&mut **b).cast()).collect();
        // Safety: Test code. Depth starts at the minimum (1) per list.
        unsafe {
            assert!(la.push(0, BasePoolType::Paged, 3, ptrs[0]));
            assert!(la.push(0, BasePoolType::Paged, 3, ptrs[1]));
            assert!(!la.push(0, BasePoolType::Paged, 3, ptrs[2]));
        }
        assert_eq!(la.info(0, BasePoolType::Paged, 3).cached, 1);
        assert_eq!(la.shared_info(BasePoolType::Paged, 3).cached, 1);

        // Processor 1 has nothing private but can reach the shared tier.
        assert_eq!(la.pop(1, BasePoolType::Paged, 3), Some(ptrs[1]));
        assert_eq!(la.pop(0, BasePoolType::Paged, 3), Some(ptrs[0]));
        assert_eq!(la.pop(0, BasePoolType::Paged, 3), None);
        assert_eq!(la.hits(BasePoolType::Paged), 2);
        assert_eq!(la.cached_frees(BasePoolType::Paged), 2);
    }

    #[test]
    fn test_round_robin_groups() {
        let la = Lookasides::new(1, true, 4, 256);
        let groups: Vec<_> = (0..6).map(|_| la.adjust_next_group()).collect();
        assert_eq!(groups, [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_busy_list_grows_over_periods() {
        let la = Lookasides::new(1, true, 4, 256);
        let base = BasePoolType::NonPaged;
        let mut storage: Vec<Box<[usize; 2]>> = (0..64).map(|_| Box::new([0; 2])).collect();
        // Nodes not currently parked on a list.
        let mut spare: Vec<NonNull<u8>> = storage.iter_mut().map(|b| NonNull::from(&mut **b).cast()).collect();

        let mut depths = Vec::new();
        for _ in 0..3 {
            let taken: Vec<_> = (0..64)
                .map(|_| la.pop(0, base, 2).unwrap_or_else(|| spare.pop().unwrap()))
                .collect();
            for p in taken {
                // Safety: Test code.
                if !unsafe { la.push(0, base, 2, p) } {
                    spare.push(p);
                }
            }
            // Visit all three groups once.
            for _ in 0..GROUPS {
                la.adjust_next_group();
            }
            depths.push(la.info(0, base, 2).depth);
        }
        assert!(depths.windows(2).all(|w| w[1] > w[0]), "depths {depths:?}");
    }
}
