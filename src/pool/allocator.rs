//! The pool allocator context.
//!
//! One [`PoolAllocator`] owns every descriptor, cache and accounting table.
//! Requests flow through three tiers:
//!
//! 1. **Lookaside**: small classes on the calling processor's private list,
//!    then the shared tier. Lock-free.
//! 2. **Descriptor free lists**: first-fit over size classes under the home
//!    node's lock, trying other nodes when the home lock is contended, then
//!    one fresh page from the provider.
//! 3. **Big pages**: anything past the largest class goes straight to the
//!    page provider and is recorded in the big-page table.
//!
//! Frees mirror this: special pool, big pages, lookaside, the pending list,
//! or a merge under the descriptor lock.

use std::ptr::NonNull;

use super::big_pages::{BigEntry, BigPageTable};
use super::config::PoolConfig;
use super::cpu;
use super::descriptor::{ALIGN_SLACK, PoolDescriptor};
use super::error::{BugCheck, PoolError, bug_check};
use super::header::{BlockPtr, BlockState, SMALL_LISTS, UNIT_SHIFT, max_small_size, units_for, usable_bytes};
use super::lookaside::Lookasides;
use super::page::{PageProvider, SystemPages};
use super::quota::QuotaLedger;
use super::special::SpecialPool;
use super::tracker::TagTable;
use super::types::{
    BasePoolType, BigPoolInfo, LookasideInfo, PoolBlock, PoolFlags, PoolPriority, PoolTag, PoolType, PoolUsage,
    ProcessId, TagInfo,
};

pub struct PoolAllocator {
    config: PoolConfig,
    processors: usize,
    page_size: usize,
    /// Indexed by node.
    nonpaged: Box<[PoolDescriptor]>,
    paged: Box<[PoolDescriptor]>,
    /// Its pool index is `config.nodes`.
    session: PoolDescriptor,
    lookasides: Lookasides,
    tags: TagTable,
    big: BigPageTable,
    provider: Box<dyn PageProvider>,
    quota: Option<Box<dyn QuotaLedger>>,
    special: Option<Box<dyn SpecialPool>>,
}

impl PoolAllocator {
    /// Default configuration over [`SystemPages`].
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Vm` if the page arenas cannot be reserved.
    pub fn new() -> Result<Self, PoolError> {
        Self::with_config(PoolConfig::default(), SystemPages::new()?)
    }

    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if `config` does not validate
    /// against the provider's page size.
    pub fn with_config(config: PoolConfig, provider: impl PageProvider + 'static) -> Result<Self, PoolError> {
        let page_size = provider.page_size();
        config.validate(page_size)?;
        let processors = config.resolved_processors();
        let nodes = config.nodes;
        let descriptors = |base| -> Box<[PoolDescriptor]> {
            (0..nodes).map(|node| PoolDescriptor::new(base, node, false, page_size)).collect()
        };
        let allocator = Self {
            processors,
            page_size,
            nonpaged: descriptors(BasePoolType::NonPaged),
            paged: descriptors(BasePoolType::Paged),
            session: PoolDescriptor::new(BasePoolType::Paged, nodes, true, page_size),
            lookasides: Lookasides::new(
                processors,
                config.lookaside_enabled,
                config.lookaside_minimum_depth,
                config.lookaside_maximum_depth,
            ),
            tags: TagTable::new(processors, config.tag_table_size, config.tag_expansion_limit, &config.hot_tags),
            big: BigPageTable::new(config.big_table_size, config.big_table_max_size, page_size),
            provider: Box::new(provider),
            quota: None,
            special: None,
            config,
        };
        log::debug!(
            "pool allocator: {processors} processors, {nodes} nodes, {page_size}-byte pages, largest class {} bytes",
            max_small_size(page_size)
        );
        Ok(allocator)
    }

    /// Install the ledger charged by quota allocations.
    #[must_use]
    pub fn with_quota_ledger(mut self, ledger: impl QuotaLedger + 'static) -> Self {
        self.quota = Some(Box::new(ledger));
        self
    }

    /// Install an alternate allocation path offered every request first.
    #[must_use]
    pub fn with_special_pool(mut self, special: impl SpecialPool + 'static) -> Self {
        self.special = Some(Box::new(special));
        self
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes tagged `tag`. Never charges quota.
    ///
    /// # Errors
    ///
    /// `InvalidTag` for the reserved tags, `InsufficientResources` when the
    /// pool and the page provider are both exhausted or `size` is beyond
    /// anything the address space could hold.
    ///
    /// # Panics
    ///
    /// Exhaustion of a `MUST_SUCCEED` request is a bug check. With
    /// `RAISE_ON_FAILURE`, every error is raised with
    /// [`std::panic::panic_any`] carrying the `PoolError` instead of being
    /// returned.
    pub fn allocate(&self, pool_type: PoolType, size: usize, tag: PoolTag) -> Result<PoolBlock, PoolError> {
        self.allocate_with_quota(pool_type, size, tag, ProcessId::SYSTEM)
    }

    /// As [`allocate`](Self::allocate), charging `process` when the pool type
    /// carries `QUOTA` and a ledger is installed.
    ///
    /// # Errors
    ///
    /// As `allocate`, plus `QuotaExceeded` when the ledger refuses the
    /// charge. The allocation is undone before returning.
    ///
    /// # Panics
    ///
    /// As `allocate`.
    pub fn allocate_with_quota(
        &self,
        pool_type: PoolType,
        size: usize,
        tag: PoolTag,
        process: ProcessId,
    ) -> Result<PoolBlock, PoolError> {
        raise_if_asked(pool_type, self.try_allocate(pool_type, size, tag, process))
    }

    /// As [`allocate`](Self::allocate), but below `High` priority the request
    /// is refused up front when the provider is short of headroom. Small
    /// requests still go ahead while the pool's own pages are under 80% used,
    /// since a free fragment will likely fit.
    ///
    /// # Errors
    ///
    /// As `allocate`; an early refusal is `InsufficientResources`.
    ///
    /// # Panics
    ///
    /// As `allocate`.
    pub fn allocate_with_priority(
        &self,
        pool_type: PoolType,
        size: usize,
        tag: PoolTag,
        priority: PoolPriority,
    ) -> Result<PoolBlock, PoolError> {
        let result = if self.resources_available(pool_type, size, priority) {
            self.try_allocate(pool_type, size, tag, ProcessId::SYSTEM)
        } else {
            log::debug!("{priority:?} priority request for {size} bytes '{tag}' refused, {:?} pool low", pool_type.base);
            Err(PoolError::InsufficientResources { pool: pool_type.base, size })
        };
        raise_if_asked(pool_type, result)
    }

    fn resources_available(&self, pool_type: PoolType, size: usize, priority: PoolPriority) -> bool {
        let Some(headroom) = priority.headroom() else {
            return true;
        };
        if pool_type.flags.contains(PoolFlags::MUST_SUCCEED) {
            return true;
        }
        let Some(free) = self.provider.available_bytes(pool_type.base) else {
            return true;
        };
        if size.saturating_add(headroom) <= free {
            return true;
        }
        if size > max_small_size(self.page_size) {
            return false;
        }
        let descriptors = if pool_type.is_session() {
            std::slice::from_ref(&self.session)
        } else {
            self.descriptors(pool_type.base)
        };
        let (pages, bytes) = descriptors.iter().fold((0, 0), |(pages, bytes), d| {
            (pages + d.counters.pages() + d.counters.big_pages(), bytes + d.counters.bytes())
        });
        // Counters are read unlocked; clamp a torn sum.
        let pages = pages | 1;
        let used = (bytes / self.page_size).min(pages);
        used * 100 / pages < 80
    }

    fn try_allocate(
        &self,
        pool_type: PoolType,
        size: usize,
        tag: PoolTag,
        process: ProcessId,
    ) -> Result<PoolBlock, PoolError> {
        if tag.is_none() || tag == PoolTag::BIG {
            return Err(PoolError::InvalidTag(tag));
        }
        let size = size.max(1);
        if size > isize::MAX as usize - self.page_size {
            return Err(self.exhausted(pool_type, size));
        }

        if let Some(special) = &self.special
            && special.should_use(pool_type, size, tag)
            && let Some(ptr) = special.allocate(pool_type, size, tag)
        {
            log::trace!("special pool served {size} bytes '{tag}' at {ptr:p}");
            return Ok(PoolBlock::from_ptr(ptr));
        }

        let charge_to = self.billable(pool_type, process);
        let aligned = pool_type.flags.contains(PoolFlags::CACHE_ALIGNED);
        let units = units_for(size);
        if size > max_small_size(self.page_size) || (aligned && units + ALIGN_SLACK >= self.page_size >> UNIT_SHIFT) {
            return self.allocate_big(pool_type, size, tag, charge_to);
        }

        let processor = cpu::current_processor(self.processors);
        let block = self.allocate_small(pool_type, units, aligned, processor)?;
        let base = pool_type.base;
        block.set_tag(tag);
        block.set_billed(ProcessId::SYSTEM);
        self.tags.insert(processor, tag, units << UNIT_SHIFT, base);
        let pool_block = PoolBlock::from_ptr(block.payload());

        if let Some((ledger, process)) = charge_to {
            if let Err(e) = ledger.charge(process, base, units << UNIT_SHIFT) {
                // Safety: the block was handed out above and never escaped.
                unsafe { self.free(pool_block, tag) };
                return Err(e);
            }
            block.set_billed(process);
            block.set_state(block.state() | BlockState::QUOTA);
        }
        log::trace!("allocated {size} bytes '{tag}' at {:p} ({units} units)", pool_block.as_ptr());
        Ok(pool_block)
    }

    fn billable(&self, pool_type: PoolType, process: ProcessId) -> Option<(&dyn QuotaLedger, ProcessId)> {
        if !pool_type.flags.contains(PoolFlags::QUOTA) || process == ProcessId::SYSTEM {
            return None;
        }
        self.quota.as_deref().map(|ledger| (ledger, process))
    }

    /// Report exhaustion, or stop if the caller cannot take no for an answer.
    #[cold]
    fn exhausted(&self, pool_type: PoolType, size: usize) -> PoolError {
        if pool_type.flags.contains(PoolFlags::MUST_SUCCEED) {
            bug_check(BugCheck::MustSucceedPoolEmpty { pool: pool_type.base, size });
        }
        log::warn!("{:?} pool exhausted allocating {size} bytes", pool_type.base);
        PoolError::InsufficientResources { pool: pool_type.base, size }
    }

    #[inline]
    fn lookaside_eligible(&self, units: usize) -> bool {
        self.config.lookaside_enabled && units <= SMALL_LISTS
    }

    #[inline]
    fn home_node(&self, processor: usize) -> usize {
        cpu::node_of(processor, self.processors, self.config.nodes)
    }

    fn descriptors(&self, base: BasePoolType) -> &[PoolDescriptor] {
        match base {
            BasePoolType::NonPaged => &self.nonpaged,
            BasePoolType::Paged => &self.paged,
        }
    }

    fn allocate_small(
        &self,
        pool_type: PoolType,
        units: usize,
        aligned: bool,
        processor: usize,
    ) -> Result<BlockPtr, PoolError> {
        let session = pool_type.is_session();
        if !session && !aligned && self.lookaside_eligible(units) {
            if let Some(node) = self.lookasides.pop(processor, pool_type.base, units) {
                // Safety: lookaside nodes are payloads of cached pool blocks.
                let block = unsafe { BlockPtr::from_payload(node, self.page_size) };
                let owner = self.descriptor_at(pool_type.base, false, block.pool_index(), block.addr());
                block.set_state(owner.in_use_state());
                return Ok(block);
            }
        }

        let (home, peers): (&PoolDescriptor, &[PoolDescriptor]) = if session {
            (&self.session, &[])
        } else {
            let descriptors = self.descriptors(pool_type.base);
            (&descriptors[self.home_node(processor)], descriptors)
        };

        for attempt in 0..2 {
            if let Some(block) = Self::take_small(home, peers, units, aligned) {
                return Ok(block);
            }
            // Pending frees may already hold a fit; merge them before asking
            // for a new page.
            if home.pending.depth() != 0 {
                home.flush_pending(&*self.provider);
                if let Some(block) = Self::take_small(home, peers, units, aligned) {
                    return Ok(block);
                }
            }
            if let Some(page) = self.provider.allocate_pages(home.base(), self.page_size) {
                let mut lists = home.lock();
                // Safety: a fresh page from the provider, owned by `home` from
                // here on.
                return Ok(unsafe { home.carve_new_page(&mut lists, page, units, aligned) });
            }
            if attempt == 0 {
                log::debug!("{:?} page provider empty, flushing deferred frees", home.base());
                self.flush_deferred();
            }
        }
        Err(self.exhausted(pool_type, usable_bytes(units)))
    }

    /// Home descriptor first; if its lock is contended, any peer whose lock
    /// is free, round-robin from the home node; then block on home.
    fn take_small(home: &PoolDescriptor, peers: &[PoolDescriptor], units: usize, aligned: bool) -> Option<BlockPtr> {
        if let Some(mut lists) = home.try_lock() {
            return home.take_from_lists(&mut lists, units, aligned);
        }
        for i in 1..peers.len() {
            let peer = &peers[(home.index() + i) % peers.len()];
            if let Some(mut lists) = peer.try_lock()
                && let Some(block) = peer.take_from_lists(&mut lists, units, aligned)
            {
                return Some(block);
            }
        }
        let mut lists = home.lock();
        home.take_from_lists(&mut lists, units, aligned)
    }

    fn allocate_big(
        &self,
        pool_type: PoolType,
        size: usize,
        tag: PoolTag,
        charge_to: Option<(&dyn QuotaLedger, ProcessId)>,
    ) -> Result<PoolBlock, PoolError> {
        let base = pool_type.base;
        let pages = size.div_ceil(self.page_size);
        let bytes = pages * self.page_size;
        let ptr = match self.provider.allocate_pages(base, bytes) {
            Some(ptr) => ptr,
            None => {
                self.flush_deferred();
                self.provider
                    .allocate_pages(base, bytes)
                    .ok_or_else(|| self.exhausted(pool_type, size))?
            }
        };

        let mut billed = ProcessId::SYSTEM;
        if let Some((ledger, process)) = charge_to {
            if let Err(e) = ledger.charge(process, base, bytes) {
                // Safety: the run was allocated above and never escaped.
                unsafe { self.provider.free_pages(ptr) };
                return Err(e);
            }
            billed = process;
        }

        let va = ptr.as_ptr() as usize;
        let entry = BigEntry { tag, pages, non_paged: base == BasePoolType::NonPaged, billed };
        let tag = if self.big.insert(va, entry) {
            tag
        } else {
            log::warn!("big page table full; {bytes}-byte '{tag}' allocation at {va:#x} recorded as '{}'", PoolTag::BIG);
            if let Some((ledger, process)) = charge_to {
                ledger.refund(process, base, bytes);
            }
            PoolTag::BIG
        };

        let processor = cpu::current_processor(self.processors);
        self.tags.insert(processor, tag, bytes, base);
        self.big_accounting(base).counters.note_big_alloc(pages, bytes);
        log::trace!("allocated {pages} pages '{tag}' at {va:#x}");
        Ok(PoolBlock::from_ptr(ptr))
    }

    /// Page-granularity allocations are counted on node 0 of their base type.
    #[inline]
    fn big_accounting(&self, base: BasePoolType) -> &PoolDescriptor {
        &self.descriptors(base)[0]
    }

    // -----------------------------------------------------------------------
    // Free
    // -----------------------------------------------------------------------

    /// Return a block. A non-empty `tag` must match the one it was
    /// allocated with.
    ///
    /// # Safety
    /// `block` was returned by this allocator and is not used afterwards.
    ///
    /// # Panics
    ///
    /// Double frees, tag mismatches and corrupted headers are bug checks.
    pub unsafe fn free(&self, block: PoolBlock, tag: PoolTag) {
        if let Some(special) = &self.special
            && special.owns(block.addr())
        {
            // Safety: forwarded from caller; the special pool owns the block.
            unsafe { special.free(block.as_non_null()) };
            return;
        }
        let processor = cpu::current_processor(self.processors);
        if block.addr().is_multiple_of(self.page_size) {
            self.free_big(block, tag, processor);
        } else {
            // Safety: forwarded from caller.
            unsafe { self.free_small(block, tag, processor) };
        }
    }

    fn free_big(&self, block: PoolBlock, tag: PoolTag, processor: usize) {
        let va = block.addr();
        let (entry, recorded) = match self.big.find_and_remove(va) {
            Some(entry) => (entry, true),
            None => {
                let Some(base) = self.provider.pool_type_of(va) else {
                    bug_check(BugCheck::BadPoolCaller { check: "address not owned by the pool", address: va });
                };
                let entry = BigEntry {
                    tag: PoolTag::BIG,
                    pages: 0,
                    non_paged: base == BasePoolType::NonPaged,
                    billed: ProcessId::SYSTEM,
                };
                (entry, false)
            }
        };
        if !tag.is_none() && entry.tag != PoolTag::BIG && entry.tag != tag {
            bug_check(BugCheck::TagMismatch { address: va, given: tag, actual: entry.tag });
        }

        // Safety: the caller returns this run; the table entry is gone.
        let Some(pages) = (unsafe { self.provider.free_pages(block.as_non_null()) }) else {
            if recorded {
                bug_check(BugCheck::BadPoolCaller { check: "page provider does not own big allocation", address: va });
            }
            bug_check(BugCheck::DoubleFree { address: va });
        };
        if recorded && pages != entry.pages {
            log::warn!("big allocation at {va:#x} recorded {} pages, provider freed {pages}", entry.pages);
        }

        let base = if entry.non_paged { BasePoolType::NonPaged } else { BasePoolType::Paged };
        let bytes = pages * self.page_size;
        if entry.billed != ProcessId::SYSTEM
            && let Some(ledger) = &self.quota
        {
            ledger.refund(entry.billed, base, bytes);
        }
        self.tags.remove(processor, entry.tag, bytes, base);
        self.big_accounting(base).counters.note_big_free(pages, bytes);
        log::trace!("freed {pages} pages '{}' at {va:#x}", entry.tag);
    }

    /// # Safety
    /// As [`free`](Self::free), for a small block.
    unsafe fn free_small(&self, block: PoolBlock, tag: PoolTag, processor: usize) {
        // Safety: caller guarantees a small pool payload.
        let header = unsafe { BlockPtr::from_payload(block.as_non_null(), self.page_size) };
        let state = header.state();
        if !state.contains(BlockState::IN_USE) {
            bug_check(BugCheck::DoubleFree { address: block.addr() });
        }
        let actual = header.tag();
        if !tag.is_none() && tag != actual {
            bug_check(BugCheck::TagMismatch { address: block.addr(), given: tag, actual });
        }
        let base = if state.contains(BlockState::PAGED) { BasePoolType::Paged } else { BasePoolType::NonPaged };
        let session = state.contains(BlockState::SESSION);
        let owner = self.descriptor_at(base, session, header.pool_index(), header.addr());
        let units = header.units();
        if units == 0 || units > owner.page_units() {
            bug_check(BugCheck::BadPoolHeader { check: "block size out of page", address: header.addr() });
        }
        // From here on the block is ours alone; a racing second free fails
        // the transition.
        if !header.transition(state, BlockState::CACHED) {
            bug_check(BugCheck::DoubleFree { address: block.addr() });
        }

        let bytes = units << UNIT_SHIFT;
        self.tags.remove(processor, actual, bytes, base);
        if state.contains(BlockState::QUOTA)
            && let Some(ledger) = &self.quota
        {
            ledger.refund(header.billed(), base, bytes);
        }

        if !session && self.lookaside_eligible(units) && owner.index() == self.home_node(processor) {
            // Safety: the block is cached and ours; its page stays mapped
            // while its descriptor holds the page.
            if unsafe { self.lookasides.push(processor, base, units, header.payload()) } {
                log::trace!("freed {:p} to lookaside ({units} units)", block.as_ptr());
                return;
            }
        }

        if self.config.delay_frees {
            // Safety: as above.
            let depth = unsafe { owner.pending.push(header.payload()) };
            if depth >= self.config.pending_free_limit {
                owner.flush_pending(&*self.provider);
            }
            return;
        }

        let page = {
            let mut lists = owner.lock();
            owner.counters.note_free(bytes);
            owner.release_block(&mut lists, header)
        };
        if let Some(page) = page {
            owner.release_pages(&*self.provider, vec![page]);
        }
    }

    /// Refund the quota charged for a live block without freeing it. The
    /// block stays allocated and is billed to nobody from here on.
    ///
    /// # Safety
    /// `block` is a live allocation of this allocator.
    ///
    /// # Panics
    ///
    /// A block that is not allocated is a bug check.
    pub unsafe fn return_pool_quota(&self, block: PoolBlock) {
        if let Some(special) = &self.special
            && special.owns(block.addr())
        {
            return;
        }
        if block.addr().is_multiple_of(self.page_size) {
            if let Some(entry) = self.big.clear_billed(block.addr())
                && entry.billed != ProcessId::SYSTEM
                && let Some(ledger) = &self.quota
            {
                let base = if entry.non_paged { BasePoolType::NonPaged } else { BasePoolType::Paged };
                ledger.refund(entry.billed, base, entry.pages * self.page_size);
            }
            return;
        }

        // Safety: caller guarantees a live small block.
        let header = unsafe { BlockPtr::from_payload(block.as_non_null(), self.page_size) };
        let state = header.state();
        if !state.contains(BlockState::IN_USE) {
            bug_check(BugCheck::BadPoolCaller { check: "quota returned for a block not in use", address: block.addr() });
        }
        // Clearing the bit first leaves a racing free nothing to refund.
        if !state.contains(BlockState::QUOTA) || !header.transition(state, state - BlockState::QUOTA) {
            return;
        }
        let process = header.billed();
        header.set_billed(ProcessId::SYSTEM);
        if let Some(ledger) = &self.quota {
            let base = if state.contains(BlockState::PAGED) { BasePoolType::Paged } else { BasePoolType::NonPaged };
            ledger.refund(process, base, header.units() << UNIT_SHIFT);
        }
        log::trace!("returned quota of {process:?} for {:p}", block.as_ptr());
    }

    /// Descriptor named by a block header, validated.
    fn descriptor_at(&self, base: BasePoolType, session: bool, index: usize, address: usize) -> &PoolDescriptor {
        if session {
            if base != BasePoolType::Paged || index != self.config.nodes {
                bug_check(BugCheck::BadPoolHeader { check: "bad session pool index", address });
            }
            return &self.session;
        }
        match self.descriptors(base).get(index) {
            Some(d) => d,
            None => bug_check(BugCheck::BadPoolHeader { check: "pool index out of range", address }),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Usable bytes of a live block and whether it was charged to quota.
    ///
    /// # Safety
    /// `block` is a live allocation of this allocator.
    pub unsafe fn query_block_size(&self, block: PoolBlock) -> (usize, bool) {
        if let Some(special) = &self.special
            && special.owns(block.addr())
        {
            return (special.block_size(block.as_non_null()), false);
        }
        if block.addr().is_multiple_of(self.page_size) {
            return match self.big.find(block.addr()) {
                Some(entry) => (entry.pages * self.page_size, entry.billed != ProcessId::SYSTEM),
                // Not recorded; the provider still knows the run.
                None => {
                    let pages = self.provider.pages_of(block.addr()).unwrap_or(1);
                    (pages * self.page_size, false)
                }
            };
        }
        // Safety: caller guarantees a live small block.
        let header = unsafe { BlockPtr::from_payload(block.as_non_null(), self.page_size) };
        (usable_bytes(header.units()), header.state().contains(BlockState::QUOTA))
    }

    /// Aggregate counters over every descriptor and lookaside list.
    ///
    /// Frees sitting on a pending list are counted once drained.
    pub fn query_pool_usage(&self) -> PoolUsage {
        let mut usage = PoolUsage::default();
        let paged = self.paged.iter().chain(std::iter::once(&self.session));
        for d in self.nonpaged.iter().chain(paged) {
            let (pages, big, allocs, frees, bytes) = match d.base() {
                BasePoolType::NonPaged => (
                    &mut usage.nonpaged_pages,
                    &mut usage.nonpaged_big_pages,
                    &mut usage.nonpaged_allocs,
                    &mut usage.nonpaged_frees,
                    &mut usage.nonpaged_bytes,
                ),
                BasePoolType::Paged => (
                    &mut usage.paged_pages,
                    &mut usage.paged_big_pages,
                    &mut usage.paged_allocs,
                    &mut usage.paged_frees,
                    &mut usage.paged_bytes,
                ),
            };
            *pages += d.counters.pages();
            *big += d.counters.big_pages();
            *allocs += d.counters.allocs();
            *frees += d.counters.frees();
            *bytes += d.counters.bytes();
            usage.pending_frees += d.pending.depth();
        }
        for base in BasePoolType::ALL {
            let hits = self.lookasides.hits(base);
            let cached = self.lookasides.cached_frees(base);
            usage.lookaside_hits += hits;
            match base {
                BasePoolType::NonPaged => {
                    usage.nonpaged_allocs += hits;
                    usage.nonpaged_frees += cached;
                }
                BasePoolType::Paged => {
                    usage.paged_allocs += hits;
                    usage.paged_frees += cached;
                }
            }
        }
        usage
    }

    /// One row per tag ever used, ordered by tag.
    pub fn query_tag_info(&self) -> Vec<TagInfo> {
        self.tags.snapshot()
    }

    /// Fill `buffer` with tag rows and return how many were written.
    ///
    /// # Errors
    ///
    /// `BufferTooSmall` carrying the row count needed; `buffer` is left
    /// untouched.
    pub fn query_tag_info_into(&self, buffer: &mut [TagInfo]) -> Result<usize, PoolError> {
        copy_rows(&self.tags.snapshot(), buffer)
    }

    /// Every live page-granularity allocation the big-page table holds.
    pub fn query_big_pool_info(&self) -> Vec<BigPoolInfo> {
        self.big.snapshot(self.page_size)
    }

    /// # Errors
    ///
    /// `BufferTooSmall` carrying the row count needed.
    pub fn query_big_pool_info_into(&self, buffer: &mut [BigPoolInfo]) -> Result<usize, PoolError> {
        copy_rows(&self.big.snapshot(self.page_size), buffer)
    }

    /// Counters of the calling processor's lookaside list for `size`, or
    /// `None` if that size is never cached.
    pub fn lookaside_info(&self, base: BasePoolType, size: usize) -> Option<LookasideInfo> {
        if size > max_small_size(self.page_size) {
            return None;
        }
        let units = units_for(size.max(1));
        (units <= SMALL_LISTS).then(|| {
            self.lookasides
                .info(cpu::current_processor(self.processors), base, units)
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Run one period of the lookaside depth controller over the next group
    /// of lists. Call periodically; three calls visit every list once.
    pub fn adjust_lookaside_depth(&self) {
        let group = self.lookasides.adjust_next_group();
        log::trace!("adjusted lookaside group {group}");
    }

    /// Return every cached lookaside block to its descriptor's free lists.
    pub fn drain_lookasides(&self) -> usize {
        let mut drained = 0;
        self.lookasides.drain(|base, node| {
            // Safety: lookaside nodes are payloads of cached pool blocks.
            let block = unsafe { BlockPtr::from_payload(node, self.page_size) };
            let owner = self.descriptor_at(base, false, block.pool_index(), block.addr());
            owner.counters.note_uncached(block.units() << UNIT_SHIFT);
            let page = {
                let mut lists = owner.lock();
                owner.release_block(&mut lists, block)
            };
            if let Some(page) = page {
                owner.release_pages(&*self.provider, vec![page]);
            }
            drained += 1;
        });
        if drained != 0 {
            log::debug!("drained {drained} lookaside blocks");
        }
        drained
    }

    /// Merge every descriptor's pending frees. Returns pages given back.
    pub fn flush_deferred(&self) -> usize {
        let paged = self.paged.iter().chain(std::iter::once(&self.session));
        self.nonpaged
            .iter()
            .chain(paged)
            .map(|d| d.flush_pending(&*self.provider))
            .sum()
    }

    /// Drain lookasides and pending frees so every fully free page goes back
    /// to the provider.
    pub fn trim(&self) -> usize {
        self.drain_lookasides();
        let released = self.flush_deferred();
        log::debug!("trim released {released} pages");
        released
    }
}

/// Hand `result` back, or raise its error if the caller asked for that.
fn raise_if_asked(pool_type: PoolType, result: Result<PoolBlock, PoolError>) -> Result<PoolBlock, PoolError> {
    match result {
        Err(e) if pool_type.flags.contains(PoolFlags::RAISE_ON_FAILURE) => {
            log::error!("raising allocation failure: {e}");
            std::panic::panic_any(e)
        }
        other => other,
    }
}

fn copy_rows<T: Copy>(rows: &[T], buffer: &mut [T]) -> Result<usize, PoolError> {
    if buffer.len() < rows.len() {
        return Err(PoolError::BufferTooSmall { required: rows.len() });
    }
    buffer[..rows.len()].copy_from_slice(rows);
    Ok(rows.len())
}
