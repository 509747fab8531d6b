use super::error::PoolError;
use super::types::PoolTag;

/// Smallest page size the header encoding and list bitmap accept.
pub(crate) const MIN_PAGE_SIZE: usize = 1024;
/// Largest page size the two-level list bitmap can index (4096 units).
pub(crate) const MAX_PAGE_SIZE: usize = 64 * 1024;
/// NUMA node indexes are stored in one header byte.
pub(crate) const MAX_NODES: usize = 64;

/// Configuration for `PoolAllocator`. All fields have sensible defaults.
/// Set at construction via `PoolAllocator::with_config()`.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of logical processors that get private lookaside lists and tag
    /// shards. Default: 0 = auto-detect from `available_parallelism`.
    pub processors: usize,

    /// NUMA nodes. One paged and one nonpaged descriptor per node;
    /// processors are spread over nodes in contiguous ranges. Default: 1.
    pub nodes: usize,

    /// Enable the per-processor lookaside caches. When false every list is
    /// pinned at depth 0 and the cache is a pure pass-through. Default: true.
    pub lookaside_enabled: bool,

    /// Floor the depth controller never shrinks below. Default: 4.
    pub lookaside_minimum_depth: u32,

    /// Ceiling the depth controller never grows beyond. Default: 256.
    pub lookaside_maximum_depth: u32,

    /// Queue small frees on a per-descriptor pending list and merge them in
    /// batches. Default: true.
    pub delay_frees: bool,

    /// Pending frees that trigger a batch drain. Default: 32.
    pub pending_free_limit: usize,

    /// Slots per processor tag shard. Power of two. Default: 2048.
    pub tag_table_size: usize,

    /// Rows in the shared spin-locked expansion table that absorbs tags the
    /// shards cannot hold. Beyond it, tags land in the `Ovfl` bucket.
    /// Default: 1024.
    pub tag_expansion_limit: usize,

    /// Initial big-page table slots. Power of two. Default: 4096.
    pub big_table_size: usize,

    /// Growth ceiling for the big-page table. Power of two. Default: 1 Mi.
    pub big_table_max_size: usize,

    /// Tags pre-seeded into every shard so the hottest allocation sites never
    /// scan past their home slot. Default: empty.
    pub hot_tags: Vec<PoolTag>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processors: 0,
            nodes: 1,
            lookaside_enabled: true,
            lookaside_minimum_depth: 4,
            lookaside_maximum_depth: 256,
            delay_frees: true,
            pending_free_limit: 32,
            tag_table_size: 2048,
            tag_expansion_limit: 1024,
            big_table_size: 4096,
            big_table_max_size: 1 << 20,
            hot_tags: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Processor count with auto-detection applied.
    #[must_use]
    pub fn resolved_processors(&self) -> usize {
        if self.processors != 0 {
            return self.processors;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    /// Check the configuration against the page size the provider reports.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` naming the first offending field.
    pub fn validate(&self, page_size: usize) -> Result<(), PoolError> {
        let bad = |msg: String| Err(PoolError::InvalidConfig(msg));

        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return bad(format!(
                "page size {page_size} must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
            ));
        }
        let processors = self.resolved_processors();
        if self.nodes == 0 || self.nodes > MAX_NODES || self.nodes > processors {
            return bad(format!(
                "nodes = {} must be in 1..={}",
                self.nodes,
                processors.min(MAX_NODES)
            ));
        }
        if self.lookaside_minimum_depth > self.lookaside_maximum_depth {
            return bad(format!(
                "lookaside minimum depth {} exceeds maximum {}",
                self.lookaside_minimum_depth, self.lookaside_maximum_depth
            ));
        }
        if self.pending_free_limit == 0 {
            return bad("pending_free_limit must be non-zero".to_string());
        }
        if !self.tag_table_size.is_power_of_two() || self.tag_table_size < 16 {
            return bad(format!(
                "tag_table_size {} must be a power of two >= 16",
                self.tag_table_size
            ));
        }
        if !self.big_table_size.is_power_of_two()
            || !self.big_table_max_size.is_power_of_two()
            || self.big_table_size > self.big_table_max_size
        {
            return bad(format!(
                "big table sizes {}..{} must be powers of two with initial <= max",
                self.big_table_size, self.big_table_max_size
            ));
        }
        if self.hot_tags.iter().any(|t| t.is_none()) {
            return bad("hot_tags may not contain the empty tag".to_string());
        }
        Ok(())
    }
}
