//! Process quota charging.
//!
//! The pool only asks the ledger two questions: may this process be billed
//! `bytes` of a base pool type, and give those bytes back. Everything else
//! about budgets lives behind [`QuotaLedger`].

use std::collections::HashMap;
use std::sync::PoisonError;

use super::error::PoolError;
use super::types::{BasePoolType, ProcessId};
use crate::sync::Mutex;

/// Per-process byte budget consulted for quota-charged allocations.
pub trait QuotaLedger: Send + Sync {
    /// Bill `bytes` of `base` pool to `process`. A successful charge also
    /// takes a reference on the process, held until the matching refund.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::QuotaExceeded` when the budget would be exceeded.
    fn charge(&self, process: ProcessId, base: BasePoolType, bytes: usize) -> Result<(), PoolError>;

    /// Return bytes billed by an earlier `charge` and drop its reference.
    fn refund(&self, process: ProcessId, base: BasePoolType, bytes: usize);
}

impl<T: QuotaLedger + ?Sized> QuotaLedger for std::sync::Arc<T> {
    fn charge(&self, process: ProcessId, base: BasePoolType, bytes: usize) -> Result<(), PoolError> {
        (**self).charge(process, base, bytes)
    }

    fn refund(&self, process: ProcessId, base: BasePoolType, bytes: usize) {
        (**self).refund(process, base, bytes);
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Account {
    limit: [usize; 2],
    used: [usize; 2],
    references: usize,
}

/// Ledger with a fixed per-process limit per base pool type.
///
/// Processes without an explicit limit get the defaults given to
/// [`ProcessQuotaLedger::new`]. An account whose last reference is refunded
/// keeps its limit but holds no usage.
pub struct ProcessQuotaLedger {
    defaults: [usize; 2],
    accounts: Mutex<HashMap<ProcessId, Account>>,
}

impl ProcessQuotaLedger {
    #[must_use]
    pub fn new(nonpaged_limit: usize, paged_limit: usize) -> Self {
        let mut defaults = [0; 2];
        defaults[BasePoolType::NonPaged.index()] = nonpaged_limit;
        defaults[BasePoolType::Paged.index()] = paged_limit;
        Self { defaults, accounts: Mutex::new(HashMap::new()) }
    }

    /// Override the `base` limit for one process.
    pub fn set_limit(&self, process: ProcessId, base: BasePoolType, bytes: usize) {
        let mut accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        let defaults = self.defaults;
        let account = accounts.entry(process).or_insert_with(|| Account { limit: defaults, ..Account::default() });
        account.limit[base.index()] = bytes;
    }

    /// Bytes of `base` pool currently billed to `process`.
    pub fn usage(&self, process: ProcessId, base: BasePoolType) -> usize {
        let accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        accounts.get(&process).map_or(0, |a| a.used[base.index()])
    }

    /// Outstanding charges held against `process`.
    pub fn references(&self, process: ProcessId) -> usize {
        let accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        accounts.get(&process).map_or(0, |a| a.references)
    }
}

impl QuotaLedger for ProcessQuotaLedger {
    fn charge(&self, process: ProcessId, base: BasePoolType, bytes: usize) -> Result<(), PoolError> {
        let mut accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        let defaults = self.defaults;
        let account = accounts.entry(process).or_insert_with(|| Account { limit: defaults, ..Account::default() });
        let i = base.index();
        match account.used[i].checked_add(bytes) {
            Some(total) if total <= account.limit[i] => {
                account.used[i] = total;
                account.references += 1;
                Ok(())
            }
            _ => {
                log::debug!(
                    "process {} over {base:?} quota: {} used of {}, asked {bytes}",
                    process.0,
                    account.used[i],
                    account.limit[i]
                );
                Err(PoolError::QuotaExceeded { process, bytes })
            }
        }
    }

    fn refund(&self, process: ProcessId, base: BasePoolType, bytes: usize) {
        let mut accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(account) = accounts.get_mut(&process) else {
            log::warn!("refund of {bytes} bytes to unknown process {}", process.0);
            return;
        };
        let i = base.index();
        if account.used[i] < bytes || account.references == 0 {
            log::warn!("process {} refunded more {base:?} quota than it was charged", process.0);
        }
        account.used[i] = account.used[i].saturating_sub(bytes);
        account.references = account.references.saturating_sub(1);
    }
}
