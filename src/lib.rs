#[cfg(not(target_pointer_width = "64"))]
compile_error!("expool supports only 64-bit targets.");

pub(crate) mod sync;

pub mod pool;

// allocator context
pub use pool::allocator::PoolAllocator;
pub use pool::config::PoolConfig;

// collaborators
pub use pool::page::{PageProvider, SystemPages, SystemPagesConfig};
pub use pool::quota::{ProcessQuotaLedger, QuotaLedger};
pub use pool::special::SpecialPool;

// public vocabulary
pub use pool::types::{
    BasePoolType, BigPoolInfo, LookasideInfo, PoolBlock, PoolFlags, PoolPriority, PoolTag, PoolType,
    PoolUsage, ProcessId, TagInfo,
};

// errors
pub use pool::error::{BugCheck, PoolError, VmError};
