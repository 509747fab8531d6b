use thiserror::Error;

use super::types::{BasePoolType, PoolTag, ProcessId};

/// Host virtual-memory failures behind the default page provider.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("reserving {bytes} bytes of address space failed: {source}")]
    Reserve { bytes: usize, source: std::io::Error },

    #[error("committing {bytes} bytes at {address:#x} failed: {source}")]
    Commit { address: usize, bytes: usize, source: std::io::Error },

    #[error("decommitting {bytes} bytes at {address:#x} failed: {source}")]
    Decommit { address: usize, bytes: usize, source: std::io::Error },

    #[error("releasing reservation at {address:#x} failed: {source}")]
    Release { address: usize, source: std::io::Error },
}

/// Recoverable pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{pool:?} pool exhausted allocating {size} bytes")]
    InsufficientResources { pool: BasePoolType, size: usize },

    #[error("quota exceeded charging {bytes} bytes to process {}", process.0)]
    QuotaExceeded { process: ProcessId, bytes: usize },

    #[error("tag '{0}' is reserved for internal accounting")]
    InvalidTag(PoolTag),

    #[error("buffer too small: {required} rows required")]
    BufferTooSmall { required: usize },

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Unrecoverable conditions. Raised through [`bug_check`], never returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BugCheck {
    #[error("bad pool header at {address:#x}: {check}")]
    BadPoolHeader { check: &'static str, address: usize },

    #[error("corrupted free list at {address:#x}: {check}")]
    CorruptedFreeList { check: &'static str, address: usize },

    #[error("double free of pool block at {address:#x}")]
    DoubleFree { address: usize },

    #[error("free of block at {address:#x} with tag '{given}', allocated as '{actual}'")]
    TagMismatch { address: usize, given: PoolTag, actual: PoolTag },

    #[error("must-succeed {pool:?} pool empty allocating {size} bytes")]
    MustSucceedPoolEmpty { pool: BasePoolType, size: usize },

    #[error("bad pool caller freeing {address:#x}: {check}")]
    BadPoolCaller { check: &'static str, address: usize },
}

/// Stop on a structural inconsistency. Logged first so the failing check and
/// address survive even when the panic is caught.
#[cold]
#[track_caller]
pub(crate) fn bug_check(code: BugCheck) -> ! {
    log::error!("pool bug check: {code}");
    panic!("pool bug check: {code}");
}
