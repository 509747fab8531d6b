//! Public vocabulary shared by the allocator, its collaborators and the
//! query interfaces.

use std::fmt;
use std::ptr::NonNull;

use bitflags::bitflags;

/// Four-byte caller identifier used for per-allocation-site accounting.
///
/// Tags are built from their printable form, first byte in the low bits, so
/// `PoolTag::new(*b"TEST")` prints back as `TEST`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PoolTag(u32);

impl PoolTag {
    /// Sentinel for page-granularity allocations the big-page table could
    /// not record.
    pub const BIG: Self = Self::new(*b"BIG ");
    /// Bucket that absorbs tags once every tracking table is full.
    pub const OVERFLOW: Self = Self::new(*b"Ovfl");
    pub const NONE: Self = Self(0);

    #[inline]
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PoolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PoolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolTag('{self}')")
    }
}

impl From<[u8; 4]> for PoolTag {
    fn from(bytes: [u8; 4]) -> Self {
        Self::new(bytes)
    }
}

/// The two pool flavours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BasePoolType {
    /// Always resident. Guarded by a spin lock.
    NonPaged,
    /// May be paged out. Guarded by a blocking lock.
    Paged,
}

impl BasePoolType {
    pub const ALL: [Self; 2] = [Self::NonPaged, Self::Paged];

    #[inline]
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::NonPaged => 0,
            Self::Paged => 1,
        }
    }
}

bitflags! {
    /// Modifiers carried alongside the base pool type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PoolFlags: u8 {
        /// Payload starts on a cache-line boundary.
        const CACHE_ALIGNED = 1 << 0;
        /// Exhaustion is a fatal stop instead of an error.
        const MUST_SUCCEED = 1 << 1;
        /// Failure panics with the `PoolError` as payload instead of
        /// returning it.
        const RAISE_ON_FAILURE = 1 << 2;
        /// Charge the allocation to the requesting process.
        const QUOTA = 1 << 3;
        /// Serve from the session descriptor. Paged only.
        const SESSION = 1 << 4;
    }
}

/// Base type plus modifiers, as passed to `allocate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolType {
    pub base: BasePoolType,
    pub flags: PoolFlags,
}

impl PoolType {
    pub const NON_PAGED: Self = Self::new(BasePoolType::NonPaged);
    pub const PAGED: Self = Self::new(BasePoolType::Paged);

    pub const fn new(base: BasePoolType) -> Self {
        Self { base, flags: PoolFlags::empty() }
    }

    #[must_use]
    pub const fn with(self, flags: PoolFlags) -> Self {
        Self { base: self.base, flags: self.flags.union(flags) }
    }

    /// Session requests are honoured for the paged pool only.
    #[inline]
    pub(crate) fn is_session(self) -> bool {
        self.base == BasePoolType::Paged && self.flags.contains(PoolFlags::SESSION)
    }
}

impl From<BasePoolType> for PoolType {
    fn from(base: BasePoolType) -> Self {
        Self::new(base)
    }
}

/// How hard a request should press when the pool is running low.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PoolPriority {
    /// Fails first: needs 2 MiB of headroom beyond the request.
    Low,
    /// Needs 512 KiB of headroom beyond the request.
    #[default]
    Normal,
    /// Never refused early.
    High,
}

impl PoolPriority {
    /// Free bytes the provider must have beyond the request, if checked.
    #[inline]
    pub(crate) const fn headroom(self) -> Option<usize> {
        match self {
            Self::Low => Some(2 << 20),
            Self::Normal => Some(512 << 10),
            Self::High => None,
        }
    }
}

/// Identity of a process that can be billed for pool usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// The system process is never charged.
    pub const SYSTEM: Self = Self(0);
}

/// Payload of a live pool allocation.
///
/// Returned by `allocate` and consumed by `free`. The handle is `Copy`, like
/// the raw address it wraps; freeing it twice is detected as corruption.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolBlock(NonNull<u8>);

// Safety: a PoolBlock is an address. Ownership of the memory behind it
// follows the caller's protocol, not the handle.
unsafe impl Send for PoolBlock {}
// Safety: see above.
unsafe impl Sync for PoolBlock {}

impl PoolBlock {
    #[inline]
    pub(crate) const fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    pub const fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for PoolBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolBlock({:p})", self.0)
    }
}

/// One row of `query_tag_info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagInfo {
    pub tag: PoolTag,
    pub paged_allocs: u64,
    pub paged_frees: u64,
    pub paged_bytes: u64,
    pub nonpaged_allocs: u64,
    pub nonpaged_frees: u64,
    pub nonpaged_bytes: u64,
}

impl TagInfo {
    /// Allocations of this tag still outstanding in `base`.
    pub fn live(&self, base: BasePoolType) -> u64 {
        match base {
            BasePoolType::Paged => self.paged_allocs.saturating_sub(self.paged_frees),
            BasePoolType::NonPaged => self.nonpaged_allocs.saturating_sub(self.nonpaged_frees),
        }
    }
}

/// One row of `query_big_pool_info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BigPoolInfo {
    pub address: usize,
    pub tag: PoolTag,
    pub size_bytes: usize,
    pub non_paged: bool,
}

/// Aggregate counters returned by `query_pool_usage`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolUsage {
    /// Pages currently backing the paged free-list descriptors.
    pub paged_pages: usize,
    /// Pages currently backing the nonpaged free-list descriptors.
    pub nonpaged_pages: usize,
    pub paged_big_pages: usize,
    pub nonpaged_big_pages: usize,
    pub paged_allocs: u64,
    pub paged_frees: u64,
    pub nonpaged_allocs: u64,
    pub nonpaged_frees: u64,
    /// Bytes handed out by descriptors, including blocks parked in lookaside
    /// caches and pending frees.
    pub paged_bytes: usize,
    pub nonpaged_bytes: usize,
    pub lookaside_hits: u64,
    pub pending_frees: usize,
}

/// Counters of one lookaside list, as seen by the calling processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LookasideInfo {
    pub depth: u32,
    pub minimum_depth: u32,
    pub maximum_depth: u32,
    pub cached: u32,
    pub total_allocates: u64,
    pub allocate_misses: u64,
    pub total_frees: u64,
    pub free_misses: u64,
}

impl LookasideInfo {
    /// Fraction of allocations served from the list, 0.0 to 1.0.
    pub fn hit_ratio(&self) -> f64 {
        if self.total_allocates == 0 {
            return 0.0;
        }
        let hits = self.total_allocates.saturating_sub(self.allocate_misses);
        hits as f64 / self.total_allocates as f64
    }
}
