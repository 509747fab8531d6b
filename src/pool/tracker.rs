//! Per-tag allocation accounting.
//!
//! Each processor owns a shard: an open-addressed table of atomic counter
//! rows, claimed lazily by CAS on the key. Writers only ever touch their own
//! shard, so the hot path is a slot lookup plus two relaxed `fetch_add`s with no
//! cross-processor cache traffic.
//!
//! Readers fold every shard into one consistent view behind a barrier: the
//! snapshot raises a pause flag and waits until no shard has a writer in
//! flight, so an allocation counted on one processor and its free counted on
//! another are either both in the fold or both out of it. Writers that meet
//! the flag spin until the fold is done.
//!
//! A shard that fills up spills into a shared, spin-locked expansion table.
//! When that reaches its limit, the `Ovfl` bucket absorbs the rest: totals
//! stay balanced, per-tag precision degrades, and nothing ever fails.

use std::collections::BTreeMap;

use super::types::{BasePoolType, PoolTag, TagInfo};
use crate::sync::SpinMutex;
use crate::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use crate::sync::hint;

/// Multiplicative hash over the tag bytes, folded two bits at a time.
#[inline]
fn tag_hash(tag: PoolTag, mask: usize) -> usize {
    let [b0, b1, b2, b3] = tag.bytes().map(u32::from);
    let folded = (((b0 << 2) ^ b1) << 2 ^ b2) << 2 ^ b3;
    (folded.wrapping_mul(40543) >> 2) as usize & mask
}

#[derive(Clone, Copy, Default)]
struct Totals {
    allocs: [u64; 2],
    frees: [u64; 2],
    bytes: [i64; 2],
}

impl Totals {
    fn apply(&mut self, base: BasePoolType, bytes: usize, alloc: bool) {
        let i = base.index();
        if alloc {
            self.allocs[i] += 1;
            self.bytes[i] += bytes as i64;
        } else {
            self.frees[i] += 1;
            self.bytes[i] -= bytes as i64;
        }
    }

    fn merge(&mut self, other: &Self) {
        for i in 0..2 {
            self.allocs[i] += other.allocs[i];
            self.frees[i] += other.frees[i];
            self.bytes[i] += other.bytes[i];
        }
    }

    fn is_empty(&self) -> bool {
        self.allocs == [0; 2] && self.frees == [0; 2]
    }

    fn into_info(self, tag: PoolTag) -> TagInfo {
        let np = BasePoolType::NonPaged.index();
        let p = BasePoolType::Paged.index();
        TagInfo {
            tag,
            paged_allocs: self.allocs[p],
            paged_frees: self.frees[p],
            paged_bytes: self.bytes[p].max(0) as u64,
            nonpaged_allocs: self.allocs[np],
            nonpaged_frees: self.frees[np],
            nonpaged_bytes: self.bytes[np].max(0) as u64,
        }
    }
}

struct TagSlot {
    key: AtomicU32,
    allocs: [AtomicU64; 2],
    frees: [AtomicU64; 2],
    bytes: [AtomicI64; 2],
}

impl TagSlot {
    fn new(key: u32) -> Self {
        Self {
            key: AtomicU32::new(key),
            allocs: [AtomicU64::new(0), AtomicU64::new(0)],
            frees: [AtomicU64::new(0), AtomicU64::new(0)],
            bytes: [AtomicI64::new(0), AtomicI64::new(0)],
        }
    }

    #[inline]
    fn record(&self, base: BasePoolType, bytes: usize, alloc: bool) {
        let i = base.index();
        if alloc {
            self.allocs[i].fetch_add(1, Ordering::Relaxed);
            self.bytes[i].fetch_add(bytes as i64, Ordering::Relaxed);
        } else {
            self.frees[i].fetch_add(1, Ordering::Relaxed);
            self.bytes[i].fetch_sub(bytes as i64, Ordering::Relaxed);
        }
    }

    fn totals(&self) -> Totals {
        let mut t = Totals::default();
        for i in 0..2 {
            t.allocs[i] = self.allocs[i].load(Ordering::Relaxed);
            t.frees[i] = self.frees[i].load(Ordering::Relaxed);
            t.bytes[i] = self.bytes[i].load(Ordering::Relaxed);
        }
        t
    }
}

struct Shard {
    slots: Box<[TagSlot]>,
    /// Writers between entering and leaving the gate.
    writers: AtomicUsize,
}

impl Shard {
    fn new(slots: usize) -> Self {
        Self { slots: (0..slots).map(|_| TagSlot::new(0)).collect(), writers: AtomicUsize::new(0) }
    }

    /// Slot holding `tag`, claiming an empty one on the way if needed.
    /// `None` once every slot holds some other tag.
    fn locate(&self, tag: PoolTag) -> Option<&TagSlot> {
        let mask = self.slots.len() - 1;
        let mut i = tag_hash(tag, mask);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[i];
            let key = slot.key.load(Ordering::Acquire);
            if key == tag.raw() {
                return Some(slot);
            }
            if key == 0 {
                match slot.key.compare_exchange(0, tag.raw(), Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return Some(slot),
                    Err(actual) if actual == tag.raw() => return Some(slot),
                    Err(_) => {}
                }
            }
            i = (i + 1) & mask;
        }
        None
    }
}

pub(crate) struct TagTable {
    shards: Box<[Shard]>,
    expansion: SpinMutex<Vec<(PoolTag, Totals)>>,
    expansion_limit: usize,
    overflow: TagSlot,
    overflowed: AtomicBool,
    /// Set while a snapshot folds the shards.
    paused: AtomicBool,
    /// Serializes snapshots.
    folding: SpinMutex<()>,
}

impl TagTable {
    pub(crate) fn new(processors: usize, slots: usize, expansion_limit: usize, hot_tags: &[PoolTag]) -> Self {
        let shards: Box<[Shard]> = (0..processors).map(|_| Shard::new(slots)).collect();
        for shard in &shards {
            for &tag in hot_tags {
                let _ = shard.locate(tag);
            }
        }
        Self {
            shards,
            expansion: SpinMutex::new(Vec::new()),
            expansion_limit,
            overflow: TagSlot::new(PoolTag::OVERFLOW.raw()),
            overflowed: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            folding: SpinMutex::new(()),
        }
    }

    #[inline]
    pub(crate) fn insert(&self, processor: usize, tag: PoolTag, bytes: usize, base: BasePoolType) {
        self.record(processor, tag, bytes, base, true);
    }

    #[inline]
    pub(crate) fn remove(&self, processor: usize, tag: PoolTag, bytes: usize, base: BasePoolType) {
        self.record(processor, tag, bytes, base, false);
    }

    fn record(&self, processor: usize, tag: PoolTag, bytes: usize, base: BasePoolType, alloc: bool) {
        let shard = &self.shards[processor];
        self.enter(shard);
        match shard.locate(tag) {
            Some(slot) => slot.record(base, bytes, alloc),
            None => self.record_slow(tag, bytes, base, alloc),
        }
        shard.writers.fetch_sub(1, Ordering::Release);
    }

    /// Announce a writer on `shard`, backing off while a snapshot folds.
    #[inline]
    fn enter(&self, shard: &Shard) {
        loop {
            shard.writers.fetch_add(1, Ordering::SeqCst);
            if !self.paused.load(Ordering::SeqCst) {
                return;
            }
            shard.writers.fetch_sub(1, Ordering::Release);
            while self.paused.load(Ordering::Acquire) {
                hint::spin_loop();
            }
        }
    }

    #[cold]
    fn record_slow(&self, tag: PoolTag, bytes: usize, base: BasePoolType, alloc: bool) {
        {
            let mut rows = self.expansion.lock();
            if let Some((_, totals)) = rows.iter_mut().find(|(t, _)| *t == tag) {
                totals.apply(base, bytes, alloc);
                return;
            }
            if rows.len() < self.expansion_limit {
                let mut totals = Totals::default();
                totals.apply(base, bytes, alloc);
                rows.push((tag, totals));
                if rows.len() == 1 {
                    log::debug!("tag shard full, expansion table in use (first tag '{tag}')");
                }
                return;
            }
        }
        if !self.overflowed.swap(true, Ordering::Relaxed) {
            log::warn!("tag tracking tables full; '{tag}' and later tags are counted under 'Ovfl'");
        }
        self.overflow.record(base, bytes, alloc);
    }

    /// Fold every shard, the expansion table and the overflow bucket into one
    /// row per tag, ordered by tag. Writers are held off for the fold.
    pub(crate) fn snapshot(&self) -> Vec<TagInfo> {
        let _folding = self.folding.lock();
        self.paused.store(true, Ordering::SeqCst);
        for shard in &self.shards {
            while shard.writers.load(Ordering::SeqCst) != 0 {
                hint::spin_loop();
            }
        }
        let rows = self.fold();
        self.paused.store(false, Ordering::Release);
        rows
    }

    fn fold(&self) -> Vec<TagInfo> {
        let mut rows: BTreeMap<PoolTag, Totals> = BTreeMap::new();
        for shard in &self.shards {
            for slot in shard.slots.iter() {
                let key = slot.key.load(Ordering::Acquire);
                if key != 0 {
                    rows.entry(PoolTag::from_raw(key)).or_default().merge(&slot.totals());
                }
            }
        }
        for (tag, totals) in self.expansion.lock().iter() {
            rows.entry(*tag).or_default().merge(totals);
        }
        let overflow = self.overflow.totals();
        if !overflow.is_empty() {
            rows.entry(PoolTag::OVERFLOW).or_default().merge(&overflow);
        }
        rows.into_iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(tag, t)| t.into_info(tag))
            .collect()
    }
}
