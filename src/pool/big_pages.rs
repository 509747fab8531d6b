//! Page-granularity allocation table.
//!
//! Open-addressed with linear scanning, keyed by page-aligned address. The low
//! bits of a page address are always zero, so the address word doubles as
//! slot state: `FREE` marks an empty slot and `BUSY` a slot whose claimer is
//! still filling in tag and page count.
//!
//! Inserts and removes take the table lock shared and claim or release
//! individual slots by CAS. Growth takes it exclusive, doubles the table and
//! rehashes the live entries. It triggers on load factor, on a long scan,
//! or when an insert finds no free slot at all.

use super::types::{BigPoolInfo, PoolTag, ProcessId};
use crate::sync::RwLock;
use crate::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

const FREE: usize = 1;
const BUSY: usize = 2;
/// Scan steps beyond this on insert ask for a bigger table.
const LONG_SCAN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BigEntry {
    pub(crate) tag: PoolTag,
    pub(crate) pages: usize,
    pub(crate) non_paged: bool,
    pub(crate) billed: ProcessId,
}

struct BigSlot {
    va: AtomicUsize,
    tag: AtomicU32,
    pages: AtomicUsize,
    non_paged: AtomicBool,
    billed: AtomicU32,
}

impl BigSlot {
    fn free() -> Self {
        Self {
            va: AtomicUsize::new(FREE),
            tag: AtomicU32::new(0),
            pages: AtomicUsize::new(0),
            non_paged: AtomicBool::new(false),
            billed: AtomicU32::new(0),
        }
    }

    #[inline]
    fn is_live(va: usize) -> bool {
        va & (FREE | BUSY) == 0
    }

    fn entry(&self) -> BigEntry {
        BigEntry {
            tag: PoolTag::from_raw(self.tag.load(Ordering::Relaxed)),
            pages: self.pages.load(Ordering::Relaxed),
            non_paged: self.non_paged.load(Ordering::Relaxed),
            billed: ProcessId(self.billed.load(Ordering::Relaxed)),
        }
    }

    fn fill(&self, entry: BigEntry) {
        self.tag.store(entry.tag.raw(), Ordering::Relaxed);
        self.pages.store(entry.pages, Ordering::Relaxed);
        self.non_paged.store(entry.non_paged, Ordering::Relaxed);
        self.billed.store(entry.billed.0, Ordering::Relaxed);
    }
}

enum Claim {
    Placed { steps: usize, len: usize },
    Full { len: usize },
}

pub(crate) struct BigPageTable {
    table: RwLock<Box<[BigSlot]>>,
    live: AtomicUsize,
    max_size: usize,
    page_shift: u32,
}

fn empty_table(len: usize) -> Box<[BigSlot]> {
    (0..len).map(|_| BigSlot::free()).collect()
}

impl BigPageTable {
    pub(crate) fn new(initial: usize, max_size: usize, page_size: usize) -> Self {
        Self {
            table: RwLock::new(empty_table(initial)),
            live: AtomicUsize::new(0),
            max_size,
            page_shift: page_size.trailing_zeros(),
        }
    }

    #[inline]
    fn hash(&self, va: usize, mask: usize) -> usize {
        let h = va >> self.page_shift;
        (h ^ (h >> 8) ^ (h >> 16) ^ (h >> 24)) & mask
    }

    /// Record a page-granularity allocation. Returns false only when the
    /// table is full and cannot grow any further.
    pub(crate) fn insert(&self, va: usize, entry: BigEntry) -> bool {
        debug_assert!(BigSlot::is_live(va), "big page address {va:#x} not page aligned");
        loop {
            let claim = {
                let table = self.table.read().unwrap_or_else(std::sync::PoisonError::into_inner);
                self.claim(&table, va, entry)
            };
            match claim {
                Claim::Placed { steps, len } => {
                    let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
                    if steps > LONG_SCAN || live * 4 > len * 3 {
                        self.grow(len);
                    }
                    return true;
                }
                Claim::Full { len } => {
                    if !self.grow(len) {
                        return false;
                    }
                }
            }
        }
    }

    fn claim(&self, table: &[BigSlot], va: usize, entry: BigEntry) -> Claim {
        let len = table.len();
        let mask = len - 1;
        let mut i = self.hash(va, mask);
        for steps in 0..len {
            let slot = &table[i];
            if slot.va.load(Ordering::Relaxed) == FREE
                && slot
                    .va
                    .compare_exchange(FREE, BUSY, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                slot.fill(entry);
                slot.va.store(va, Ordering::Release);
                return Claim::Placed { steps, len };
            }
            i = (i + 1) & mask;
        }
        Claim::Full { len }
    }

    /// Double the table if it is still `observed` slots long. False when the
    /// size ceiling forbids it.
    fn grow(&self, observed: usize) -> bool {
        let mut table = self.table.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if table.len() != observed {
            return true;
        }
        let new_len = observed * 2;
        if new_len > self.max_size {
            log::warn!("big page table at ceiling ({observed} slots), cannot grow");
            return false;
        }
        let fresh = empty_table(new_len);
        let mask = new_len - 1;
        for slot in table.iter() {
            let va = slot.va.load(Ordering::Relaxed);
            if !BigSlot::is_live(va) {
                continue;
            }
            let mut i = self.hash(va, mask);
            while fresh[i].va.load(Ordering::Relaxed) != FREE {
                i = (i + 1) & mask;
            }
            fresh[i].fill(slot.entry());
            fresh[i].va.store(va, Ordering::Relaxed);
        }
        *table = fresh;
        log::debug!("big page table grew {observed} -> {new_len} slots");
        true
    }

    /// Remove and return the entry for `va`.
    pub(crate) fn find_and_remove(&self, va: usize) -> Option<BigEntry> {
        let table = self.table.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mask = table.len() - 1;
        let mut i = self.hash(va, mask);
        for _ in 0..table.len() {
            let slot = &table[i];
            if slot.va.load(Ordering::Acquire) == va {
                let entry = slot.entry();
                if slot
                    .va
                    .compare_exchange(va, FREE, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.live.fetch_sub(1, Ordering::Relaxed);
                    return Some(entry);
                }
            }
            i = (i + 1) & mask;
        }
        None
    }

    pub(crate) fn find(&self, va: usize) -> Option<BigEntry> {
        let table = self.table.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mask = table.len() - 1;
        let mut i = self.hash(va, mask);
        for _ in 0..table.len() {
            let slot = &table[i];
            if slot.va.load(Ordering::Acquire) == va {
                return Some(slot.entry());
            }
            i = (i + 1) & mask;
        }
        None
    }

    /// Stop billing the allocation at `va`. Returns the entry as it was,
    /// so the caller can refund whoever it named.
    pub(crate) fn clear_billed(&self, va: usize) -> Option<BigEntry> {
        let table = self.table.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mask = table.len() - 1;
        let mut i = self.hash(va, mask);
        for _ in 0..table.len() {
            let slot = &table[i];
            if slot.va.load(Ordering::Acquire) == va {
                let mut entry = slot.entry();
                entry.billed = ProcessId(slot.billed.swap(ProcessId::SYSTEM.0, Ordering::Relaxed));
                return Some(entry);
            }
            i = (i + 1) & mask;
        }
        None
    }

    pub(crate) fn snapshot(&self, page_size: usize) -> Vec<BigPoolInfo> {
        let table = self.table.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        table
            .iter()
            .filter_map(|slot| {
                let va = slot.va.load(Ordering::Acquire);
                BigSlot::is_live(va).then(|| {
                    let e = slot.entry();
                    BigPoolInfo { address: va, tag: e.tag, size_bytes: e.pages * page_size, non_paged: e.non_paged }
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.table.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}
