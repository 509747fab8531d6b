//! Alternate allocation path for verified or guarded blocks.
//!
//! When installed, the pool offers every request to the special pool first
//! and routes any free of an address the special pool owns back to it.
//! Special-pool blocks bypass tags, lookasides and quota.

use std::ptr::NonNull;

use super::types::{PoolTag, PoolType};

pub trait SpecialPool: Send + Sync {
    /// Whether this request should be served here instead of the pool.
    fn should_use(&self, pool_type: PoolType, size: usize, tag: PoolTag) -> bool;

    /// `None` falls back to the ordinary pool.
    fn allocate(&self, pool_type: PoolType, size: usize, tag: PoolTag) -> Option<NonNull<u8>>;

    /// Whether `addr` lies inside a block this pool handed out.
    fn owns(&self, addr: usize) -> bool;

    /// Usable bytes of a block this pool owns.
    fn block_size(&self, ptr: NonNull<u8>) -> usize;

    /// # Safety
    /// `ptr` came from `allocate` on this pool and is not used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>);
}

impl<T: SpecialPool + ?Sized> SpecialPool for std::sync::Arc<T> {
    fn should_use(&self, pool_type: PoolType, size: usize, tag: PoolTag) -> bool {
        (**self).should_use(pool_type, size, tag)
    }

    fn allocate(&self, pool_type: PoolType, size: usize, tag: PoolTag) -> Option<NonNull<u8>> {
        (**self).allocate(pool_type, size, tag)
    }

    fn owns(&self, addr: usize) -> bool {
        (**self).owns(addr)
    }

    fn block_size(&self, ptr: NonNull<u8>) -> usize {
        (**self).block_size(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: forwarded from caller.
        unsafe { (**self).free(ptr) }
    }
}
