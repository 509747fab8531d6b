#[cfg(all(test, not(loom)))]
mod tests {
    use std::alloc::Layout;
    use std::collections::HashMap;
    use std::ptr::NonNull;

    use crate::pool::allocator::PoolAllocator;
    use crate::pool::config::PoolConfig;
    use crate::pool::error::PoolError;
    use crate::pool::page::{SystemPages, SystemPagesConfig};
    use crate::pool::quota::ProcessQuotaLedger;
    use crate::pool::special::SpecialPool;
    use crate::pool::types::{BasePoolType, PoolBlock, PoolFlags, PoolPriority, PoolTag, PoolType, ProcessId};
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use crate::sync::{Arc, Mutex, thread};

    const TEST: PoolTag = PoolTag::new(*b"TEST");

    fn pool_with(config: PoolConfig, nonpaged_bytes: usize, paged_bytes: usize) -> PoolAllocator {
        let pages = SystemPages::with_config(&SystemPagesConfig { nonpaged_bytes, paged_bytes }).unwrap();
        PoolAllocator::with_config(config, pages).unwrap()
    }

    fn single_cpu() -> PoolAllocator {
        pool_with(PoolConfig { processors: 1, ..PoolConfig::default() }, 32 << 20, 32 << 20)
    }

    fn row(pool: &PoolAllocator, tag: PoolTag) -> crate::pool::types::TagInfo {
        pool.query_tag_info().into_iter().find(|r| r.tag == tag).unwrap_or_default()
    }

    // =====================================================================
    // Scenarios
    // =====================================================================

    #[test]
    fn test_tagged_allocation_is_tracked() {
        let pool = single_cpu();
        let block = pool.allocate(PoolType::NON_PAGED, 32, TEST).unwrap();
        let r = row(&pool, TEST);
        assert_eq!(r.nonpaged_allocs, 1);
        assert_eq!(r.nonpaged_bytes, 48);

        // Safety: Test code.
        unsafe { pool.free(block, TEST) };
        let r = row(&pool, TEST);
        assert_eq!(r.nonpaged_frees, 1);
        assert_eq!(r.nonpaged_bytes, 0);
        assert_eq!(r.paged_allocs, 0);
    }

    #[test]
    fn test_many_small_blocks_grow_then_return_pages() {
        let pool = single_cpu();
        let mut blocks = Vec::with_capacity(10_000);
        let mut last_pages = 0;
        for _ in 0..10_000 {
            blocks.push(pool.allocate(PoolType::NON_PAGED, 16, TEST).unwrap());
            let pages = pool.query_pool_usage().nonpaged_pages;
            assert!(pages >= last_pages, "page count shrank while only allocating");
            last_pages = pages;
        }
        let peak = last_pages;
        assert!(peak > 1);
        assert_eq!(row(&pool, TEST).nonpaged_allocs, 10_000);

        for b in blocks {
            // Safety: Test code.
            unsafe { pool.free(b, TEST) };
        }
        // Batched pending drains already handed most whole pages back.
        assert!(pool.query_pool_usage().nonpaged_pages < peak);
        pool.trim();
        let usage = pool.query_pool_usage();
        assert_eq!(usage.nonpaged_pages, 0);
        assert_eq!(usage.nonpaged_bytes, 0);
        assert_eq!(row(&pool, TEST).nonpaged_bytes, 0);
    }

    #[test]
    fn test_page_sized_request_goes_to_big_table() {
        let pool = single_cpu();
        let tag = PoolTag::new(*b"BIGG");
        let page = pool.page_size();
        let block = pool.allocate(PoolType::NON_PAGED, page + 1, tag).unwrap();
        assert!(block.addr().is_multiple_of(page));

        let big = pool.query_big_pool_info();
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].address, block.addr());
        assert_eq!(big[0].tag, tag);
        assert_eq!(big[0].size_bytes, 2 * page);
        assert!(big[0].non_paged);

        let usage = pool.query_pool_usage();
        assert_eq!(usage.nonpaged_pages, 0, "free-list pages untouched");
        assert_eq!(usage.nonpaged_big_pages, 2);
        assert_eq!(row(&pool, tag).nonpaged_bytes, 2 * page as u64);

        // Safety: Test code.
        unsafe {
            assert_eq!(pool.query_block_size(block), (2 * page, false));
            pool.free(block, tag);
        }
        assert!(pool.query_big_pool_info().is_empty());
        assert_eq!(pool.query_pool_usage().nonpaged_big_pages, 0);
    }

    #[test]
    fn test_lookaside_depth_adapts_to_load() {
        let pool = single_cpu();
        let mut depths = Vec::new();
        let mut ratios = Vec::new();
        for _ in 0..3 {
            let blocks: Vec<_> = (0..64).map(|_| pool.allocate(PoolType::NON_PAGED, 40, TEST).unwrap()).collect();
            for b in blocks {
                // Safety: Test code.
                unsafe { pool.free(b, TEST) };
            }
            for _ in 0..3 {
                pool.adjust_lookaside_depth();
            }
            let info = pool.lookaside_info(BasePoolType::NonPaged, 40).unwrap();
            assert!((info.minimum_depth..=info.maximum_depth).contains(&info.depth));
            depths.push(info.depth);
            ratios.push(info.hit_ratio());
        }
        assert!(depths.windows(2).all(|w| w[1] > w[0]), "depths {depths:?}");
        assert!(ratios.windows(2).all(|w| w[1] > w[0]), "hit ratios {ratios:?}");
    }

    // =====================================================================
    // Properties
    // =====================================================================

    #[test]
    fn test_usable_size_within_class() {
        let pool = single_cpu();
        let largest = pool.page_size() - 32;
        let mut size = 1;
        while size <= largest {
            for ty in [PoolType::NON_PAGED, PoolType::PAGED] {
                let b = pool.allocate(ty, size, TEST).unwrap();
                // Safety: Test code.
                let (usable, charged) = unsafe { pool.query_block_size(b) };
                assert!(usable >= size, "size {size} got {usable}");
                assert!(usable < size + 16, "size {size} got {usable}");
                assert!(!charged);
                // Safety: Test code.
                unsafe {
                    b.as_ptr().write_bytes(0xA5, size);
                    pool.free(b, TEST);
                }
            }
            size += size / 3 + 1;
        }
    }

    #[test]
    fn test_round_trip_restores_tag_counters() {
        let pool = single_cpu();
        let tag = PoolTag::new(*b"Rtrp");
        let keep = pool.allocate(PoolType::PAGED, 100, tag).unwrap();
        let before = row(&pool, tag);

        for size in [8, 100, 1000, pool.page_size() * 3] {
            let b = pool.allocate(PoolType::PAGED, size, tag).unwrap();
            // Safety: Test code.
            unsafe { pool.free(b, tag) };
        }
        let after = row(&pool, tag);
        assert_eq!(after.paged_allocs - after.paged_frees, before.paged_allocs - before.paged_frees);
        assert_eq!(after.paged_bytes, before.paged_bytes);
        // Safety: Test code.
        unsafe { pool.free(keep, tag) };
    }

    #[test]
    fn test_live_count_matches_tag_totals() {
        let pool = single_cpu();
        let tags: Vec<PoolTag> = (0..6u8).map(|i| PoolTag::new([b'L', b'i', b'v', b'0' + i])).collect();
        let mut live: Vec<(PoolBlock, PoolTag, BasePoolType)> = Vec::new();
        let mut seed = 0x9e37_79b9_u32;
        for step in 0..3000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if live.is_empty() || seed % 3 != 0 {
                let base = if step % 2 == 0 { BasePoolType::Paged } else { BasePoolType::NonPaged };
                let tag = tags[seed as usize % tags.len()];
                let size = (seed as usize >> 8) % 700 + 1;
                live.push((pool.allocate(base.into(), size, tag).unwrap(), tag, base));
            } else {
                let (b, tag, _) = live.swap_remove(seed as usize % live.len());
                // Safety: Test code.
                unsafe { pool.free(b, tag) };
            }
        }

        let rows = pool.query_tag_info();
        for base in BasePoolType::ALL {
            let tracked: u64 = rows.iter().map(|r| r.live(base)).sum();
            let actual = live.iter().filter(|(_, _, b)| *b == base).count() as u64;
            assert_eq!(tracked, actual, "{base:?}");
        }
        for (b, tag, _) in live {
            // Safety: Test code.
            unsafe { pool.free(b, tag) };
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let pool = single_cpu();
        let b = pool.allocate(PoolType::NON_PAGED, 64, TEST).unwrap();
        // Safety: Test code. The second free is the bug under test.
        unsafe {
            pool.free(b, TEST);
            pool.free(b, TEST);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_of_big_block_is_fatal() {
        let pool = single_cpu();
        let b = pool.allocate(PoolType::PAGED, pool.page_size() * 2, TEST).unwrap();
        // Safety: Test code. The second free is the bug under test.
        unsafe {
            pool.free(b, TEST);
            pool.free(b, TEST);
        }
    }

    #[test]
    fn test_split_blocks_merge_back_at_original_address() {
        let config = PoolConfig { processors: 1, lookaside_enabled: false, delay_frees: false, ..PoolConfig::default() };
        let pool = pool_with(config, 1 << 20, 1 << 20);
        let keep = pool.allocate(PoolType::NON_PAGED, 32, TEST).unwrap();
        let whole = pool.allocate(PoolType::NON_PAGED, 600, TEST).unwrap();
        let base = whole.addr();
        // Safety: Test code.
        unsafe { pool.free(whole, TEST) };

        let x = pool.allocate(PoolType::NON_PAGED, 280, TEST).unwrap();
        let y = pool.allocate(PoolType::NON_PAGED, 280, TEST).unwrap();
        assert_ne!(x, y);
        // Safety: Test code.
        unsafe {
            pool.free(x, TEST);
            pool.free(y, TEST);
        }
        let again = pool.allocate(PoolType::NON_PAGED, 600, TEST).unwrap();
        assert_eq!(again.addr(), base);
        // Safety: Test code.
        unsafe {
            pool.free(again, TEST);
            pool.free(keep, TEST);
        }
        assert_eq!(pool.query_pool_usage().nonpaged_pages, 0);
    }

    #[test]
    fn test_big_table_grows_under_load() {
        let config = PoolConfig { processors: 1, big_table_size: 16, ..PoolConfig::default() };
        let pool = pool_with(config, 64 << 20, 1 << 20);
        let page = pool.page_size();
        let blocks: Vec<_> = (0..200)
            .map(|i| pool.allocate(PoolType::NON_PAGED, page * (1 + i % 3), TEST).unwrap())
            .collect();
        let rows = pool.query_big_pool_info();
        assert_eq!(rows.len(), blocks.len());
        for b in blocks.iter().step_by(2) {
            // Safety: Test code.
            unsafe { pool.free(*b, TEST) };
        }
        assert_eq!(pool.query_big_pool_info().len(), 100);
        for b in blocks.iter().skip(1).step_by(2) {
            // Safety: Test code.
            unsafe {
                assert!(pool.query_block_size(*b).0 >= page);
                pool.free(*b, TEST);
            }
        }
        assert!(pool.query_big_pool_info().is_empty());
        assert_eq!(row(&pool, TEST).nonpaged_bytes, 0);
    }

    // =====================================================================
    // Collaborators
    // =====================================================================

    const SPECIAL: PoolTag = PoolTag::new(*b"Spcl");

    #[derive(Default)]
    struct GuardedPool {
        blocks: Mutex<HashMap<usize, Layout>>,
        frees: AtomicUsize,
    }

    impl SpecialPool for GuardedPool {
        fn should_use(&self, _pool_type: PoolType, _size: usize, tag: PoolTag) -> bool {
            tag == SPECIAL
        }

        fn allocate(&self, _pool_type: PoolType, size: usize, _tag: PoolTag) -> Option<NonNull<u8>> {
            let layout = Layout::from_size_align(size, 16).ok()?;
            // Safety: Test code.
            let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
            self.blocks.lock().unwrap().insert(ptr.as_ptr() as usize, layout);
            Some(ptr)
        }

        fn owns(&self, addr: usize) -> bool {
            self.blocks.lock().unwrap().contains_key(&addr)
        }

        fn block_size(&self, ptr: NonNull<u8>) -> usize {
            self.blocks.lock().unwrap()[&(ptr.as_ptr() as usize)].size()
        }

        unsafe fn free(&self, ptr: NonNull<u8>) {
            let layout = self.blocks.lock().unwrap().remove(&(ptr.as_ptr() as usize)).unwrap();
            self.frees.fetch_add(1, Ordering::Relaxed);
            // Safety: Test code.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    #[test]
    fn test_special_pool_routing() {
        let special = Arc::new(GuardedPool::default());
        let pool = single_cpu().with_special_pool(special.clone());

        let s = pool.allocate(PoolType::NON_PAGED, 100, SPECIAL).unwrap();
        let n = pool.allocate(PoolType::NON_PAGED, 100, TEST).unwrap();
        assert!(special.owns(s.addr()));
        assert!(!special.owns(n.addr()));
        // Safety: Test code.
        unsafe {
            assert_eq!(pool.query_block_size(s), (100, false));
            pool.free(s, SPECIAL);
            pool.free(n, TEST);
        }
        assert_eq!(special.frees.load(Ordering::Relaxed), 1);
        assert!(pool.query_tag_info().iter().all(|r| r.tag != SPECIAL));
    }

    #[test]
    fn test_quota_charge_and_refund() {
        let ledger = Arc::new(ProcessQuotaLedger::new(4096, 1 << 20));
        let pool = single_cpu().with_quota_ledger(ledger.clone());
        let process = ProcessId(7);
        let ty = PoolType::NON_PAGED.with(PoolFlags::QUOTA);

        let b = pool.allocate_with_quota(ty, 100, TEST, process).unwrap();
        // Safety: Test code.
        assert_eq!(unsafe { pool.query_block_size(b) }, (112, true));
        assert_eq!(ledger.usage(process, BasePoolType::NonPaged), 128);
        assert_eq!(ledger.references(process), 1);

        let big_ty = PoolType::PAGED.with(PoolFlags::QUOTA);
        let page = pool.page_size();
        let big = pool.allocate_with_quota(big_ty, 2 * page, TEST, process).unwrap();
        assert_eq!(ledger.usage(process, BasePoolType::Paged), 2 * page);

        // Safety: Test code.
        unsafe {
            pool.free(b, TEST);
            pool.free(big, TEST);
        }
        assert_eq!(ledger.usage(process, BasePoolType::NonPaged), 0);
        assert_eq!(ledger.usage(process, BasePoolType::Paged), 0);
        assert_eq!(ledger.references(process), 0);

        // The system process and unflagged requests are never billed.
        let free_ride = pool.allocate_with_quota(PoolType::NON_PAGED, 100, TEST, process).unwrap();
        // Safety: Test code.
        assert!(!unsafe { pool.query_block_size(free_ride) }.1);
        // Safety: Test code.
        unsafe { pool.free(free_ride, TEST) };
    }

    #[test]
    fn test_quota_denial_unwinds_allocation() {
        let ledger = Arc::new(ProcessQuotaLedger::new(64, 64));
        let pool = single_cpu().with_quota_ledger(ledger.clone());
        let process = ProcessId(3);
        let ty = PoolType::NON_PAGED.with(PoolFlags::QUOTA);

        let err = pool.allocate_with_quota(ty, 100, TEST, process).unwrap_err();
        assert!(matches!(err, PoolError::QuotaExceeded { process: p, .. } if p == process));
        let r = row(&pool, TEST);
        assert_eq!((r.nonpaged_allocs, r.nonpaged_frees, r.nonpaged_bytes), (1, 1, 0));
        assert_eq!(ledger.usage(process, BasePoolType::NonPaged), 0);
        assert_eq!(ledger.references(process), 0);

        let page = pool.page_size();
        assert!(pool.allocate_with_quota(ty, 4 * page, TEST, process).is_err());
        assert!(pool.query_big_pool_info().is_empty());
    }

    #[test]
    fn test_returned_quota_is_not_refunded_again() {
        let ledger = Arc::new(ProcessQuotaLedger::new(1 << 20, 1 << 20));
        let pool = single_cpu().with_quota_ledger(ledger.clone());
        let process = ProcessId(9);
        let page = pool.page_size();

        let small = pool.allocate_with_quota(PoolType::NON_PAGED.with(PoolFlags::QUOTA), 100, TEST, process).unwrap();
        let big = pool.allocate_with_quota(PoolType::PAGED.with(PoolFlags::QUOTA), 3 * page, TEST, process).unwrap();
        assert_eq!(ledger.references(process), 2);

        // Safety: Test code.
        unsafe {
            pool.return_pool_quota(small);
            pool.return_pool_quota(big);
            // A second return finds nothing left to refund.
            pool.return_pool_quota(small);
            pool.return_pool_quota(big);
        }
        assert_eq!(ledger.usage(process, BasePoolType::NonPaged), 0);
        assert_eq!(ledger.usage(process, BasePoolType::Paged), 0);
        assert_eq!(ledger.references(process), 0);
        // Safety: Test code.
        unsafe {
            assert_eq!(pool.query_block_size(small), (112, false));
            assert_eq!(pool.query_block_size(big), (3 * page, false));
        }

        // Still allocated and still tracked until freed.
        assert_eq!(row(&pool, TEST).nonpaged_frees, 0);
        // Safety: Test code.
        unsafe {
            pool.free(small, TEST);
            pool.free(big, TEST);
        }
        assert_eq!(ledger.usage(process, BasePoolType::NonPaged), 0);
        assert_eq!(ledger.references(process), 0);
        let r = row(&pool, TEST);
        assert_eq!((r.nonpaged_frees, r.paged_frees, r.nonpaged_bytes, r.paged_bytes), (1, 1, 0, 0));
    }

    // =====================================================================
    // Big page table full
    // =====================================================================

    #[test]
    fn test_unrecorded_big_allocation_keeps_its_size() {
        let config = PoolConfig { processors: 1, big_table_size: 1, big_table_max_size: 1, ..PoolConfig::default() };
        let pool = pool_with(config, 32 << 20, 32 << 20);
        let page = pool.page_size();
        let bigg = PoolTag::new(*b"BIGG");

        let first = pool.allocate(PoolType::NON_PAGED, page, bigg).unwrap();
        let second = pool.allocate(PoolType::NON_PAGED, 3 * page, bigg).unwrap();
        assert_eq!(pool.query_big_pool_info().len(), 1);
        // Safety: Test code.
        assert_eq!(unsafe { pool.query_block_size(second) }, (3 * page, false));

        let r = row(&pool, PoolTag::BIG);
        assert_eq!((r.nonpaged_allocs, r.nonpaged_bytes), (1, 3 * page as u64));
        assert_eq!(row(&pool, bigg).nonpaged_bytes, page as u64);

        // The caller's tag is still accepted on free.
        // Safety: Test code.
        unsafe { pool.free(second, bigg) };
        let r = row(&pool, PoolTag::BIG);
        assert_eq!((r.nonpaged_allocs, r.nonpaged_frees, r.nonpaged_bytes), (1, 1, 0));
        assert_eq!(pool.query_pool_usage().nonpaged_big_pages, 1);

        // Safety: Test code.
        unsafe { pool.free(first, bigg) };
        assert_eq!(pool.query_pool_usage().nonpaged_big_pages, 0);
    }

    // =====================================================================
    // Exhaustion
    // =====================================================================

    #[test]
    fn test_low_priority_refused_when_pool_is_full() {
        let config = PoolConfig { processors: 1, lookaside_enabled: false, ..PoolConfig::default() };
        let pool = pool_with(config, 1 << 20, 1 << 20);
        let page = pool.page_size();

        // Not 2 MiB of headroom: big low-priority requests fail at once.
        let err = pool.allocate_with_priority(PoolType::NON_PAGED, 2 * page, TEST, PoolPriority::Low).unwrap_err();
        assert!(matches!(err, PoolError::InsufficientResources { pool: BasePoolType::NonPaged, .. }));
        // Small ones go ahead while the pool's pages are mostly empty.
        let early = pool.allocate_with_priority(PoolType::NON_PAGED, 64, TEST, PoolPriority::Low).unwrap();

        let half = page / 2 - 32;
        let blocks: Vec<_> = (0..100).map(|_| pool.allocate(PoolType::NON_PAGED, half, TEST).unwrap()).collect();
        assert!(pool.allocate_with_priority(PoolType::NON_PAGED, 64, TEST, PoolPriority::Low).is_err());
        let high = pool.allocate_with_priority(PoolType::NON_PAGED, 64, TEST, PoolPriority::High).unwrap();
        let must = PoolType::NON_PAGED.with(PoolFlags::MUST_SUCCEED);
        let forced = pool.allocate_with_priority(must, 64, TEST, PoolPriority::Low).unwrap();

        // Safety: Test code.
        unsafe {
            for b in blocks {
                pool.free(b, TEST);
            }
            pool.free(early, TEST);
            pool.free(high, TEST);
            pool.free(forced, TEST);
        }
    }

    #[test]
    fn test_raise_on_failure_unwinds_with_error() {
        let pool = pool_with(PoolConfig { processors: 1, ..PoolConfig::default() }, 1 << 20, 1 << 20);
        let ty = PoolType::NON_PAGED.with(PoolFlags::RAISE_ON_FAILURE);
        let payload = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.allocate(ty, 2 << 20, TEST)))
            .expect_err("allocation failure must raise");
        let err = payload.downcast_ref::<PoolError>().expect("payload is the pool error");
        assert!(matches!(err, PoolError::InsufficientResources { pool: BasePoolType::NonPaged, .. }));

        // Quota denial raises the same way.
        let ledger = Arc::new(ProcessQuotaLedger::new(64, 64));
        let pool = pool.with_quota_ledger(ledger);
        let ty = ty.with(PoolFlags::QUOTA);
        let payload = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.allocate_with_quota(ty, 100, TEST, ProcessId(4))
        }))
        .expect_err("quota denial must raise");
        assert!(matches!(payload.downcast_ref::<PoolError>(), Some(PoolError::QuotaExceeded { .. })));

        // Success is untouched by the flag.
        let b = pool.allocate(ty, 100, TEST).unwrap();
        // Safety: Test code.
        unsafe { pool.free(b, TEST) };
    }

    #[test]
    fn test_soft_exhaustion_returns_error() {
        let pool = pool_with(PoolConfig { processors: 1, ..PoolConfig::default() }, 1 << 20, 1 << 20);
        let too_big = 2 << 20;
        let err = pool.allocate(PoolType::NON_PAGED, too_big, TEST).unwrap_err();
        assert!(matches!(err, PoolError::InsufficientResources { pool: BasePoolType::NonPaged, size } if size == too_big));
        // A failed request leaves no trace in the accounting.
        assert!(pool.query_tag_info().is_empty());
    }

    #[test]
    #[should_panic(expected = "must-succeed")]
    fn test_must_succeed_exhaustion_is_fatal() {
        let pool = pool_with(PoolConfig { processors: 1, ..PoolConfig::default() }, 1 << 20, 1 << 20);
        let ty = PoolType::NON_PAGED.with(PoolFlags::MUST_SUCCEED);
        let _ = pool.allocate(ty, 2 << 20, TEST);
    }

    #[test]
    fn test_exhaustion_flushes_pending_frees_and_retries() {
        let config = PoolConfig {
            processors: 1,
            lookaside_enabled: false,
            pending_free_limit: 1000,
            ..PoolConfig::default()
        };
        let page = SystemPages::host_page_size();
        let pool = pool_with(config, 2 * page, page);

        let half = page / 2 - 64;
        let blocks: Vec<_> = (0..4).map(|_| pool.allocate(PoolType::NON_PAGED, half, TEST).unwrap()).collect();
        assert_eq!(pool.query_pool_usage().nonpaged_pages, 2);
        for b in blocks {
            // Safety: Test code.
            unsafe { pool.free(b, TEST) };
        }
        // Everything is parked on the pending list; both pages are still held.
        assert_eq!(pool.query_pool_usage().pending_frees, 4);
        assert_eq!(pool.query_pool_usage().nonpaged_pages, 2);

        // The provider is empty until the pending list is flushed.
        let big = pool.allocate(PoolType::NON_PAGED, 2 * page, TEST).unwrap();
        assert_eq!(pool.query_pool_usage().pending_frees, 0);
        assert_eq!(pool.query_pool_usage().nonpaged_pages, 0);
        // Safety: Test code.
        unsafe { pool.free(big, TEST) };
    }

    // =====================================================================
    // Concurrency
    // =====================================================================

    #[test]
    fn test_concurrent_mixed_workload() {
        let config = PoolConfig { processors: 4, nodes: 2, pending_free_limit: 8, ..PoolConfig::default() };
        let pool = Arc::new(pool_with(config, 64 << 20, 64 << 20));
        let num_threads = 6u8;
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let tag = PoolTag::new([b'T', b'h', b'r', b'0' + t]);
                    let base = if t % 2 == 0 { BasePoolType::NonPaged } else { BasePoolType::Paged };
                    let page = pool.page_size();
                    barrier.wait();
                    for round in 0..20usize {
                        let mut held = Vec::new();
                        for i in 0..50usize {
                            let size = match i % 10 {
                                9 => page + 100,
                                n => 16 << (n % 6),
                            };
                            let b = pool.allocate(base.into(), size, tag).unwrap();
                            // Safety: Test code.
                            unsafe { b.as_ptr().write_bytes(t, size.min(256)) };
                            held.push((b, size));
                        }
                        for (b, size) in held {
                            // Safety: Test code.
                            unsafe {
                                let bytes = std::slice::from_raw_parts(b.as_ptr(), size.min(256));
                                assert!(bytes.iter().all(|&x| x == t), "thread {t} round {round} corrupted");
                                pool.free(b, tag);
                            }
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        for r in pool.query_tag_info() {
            assert_eq!(r.paged_allocs, r.paged_frees, "{}", r.tag);
            assert_eq!(r.nonpaged_allocs, r.nonpaged_frees, "{}", r.tag);
            assert_eq!((r.paged_bytes, r.nonpaged_bytes), (0, 0), "{}", r.tag);
        }
        pool.trim();
        let usage = pool.query_pool_usage();
        assert_eq!((usage.paged_pages, usage.nonpaged_pages), (0, 0));
        assert_eq!((usage.paged_big_pages, usage.nonpaged_big_pages), (0, 0));
        assert_eq!((usage.paged_bytes, usage.nonpaged_bytes), (0, 0));
        assert_eq!(usage.paged_allocs, usage.paged_frees);
        assert_eq!(usage.nonpaged_allocs, usage.nonpaged_frees);
        assert!(pool.query_big_pool_info().is_empty());
    }
}
