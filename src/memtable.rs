//! `MemTable`: the in-memory write buffer.
//!
//! Slot *indices* need to survive into the flushed `SortedRun` unchanged
//! (insertion order feeds `record_order`'s tiebreak, and the run's
//! delete-tag array is indexed by slot), so inserts reserve a slot with an
//! atomic fetch-add rather than going through a concurrent map. Each
//! reserved slot is written by exactly one thread and then published with a
//! release store -- the same snapshot-swap handoff shape used for installing
//! a new `Version`, just at per-record instead of per-version granularity.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::bloom::TombstoneFilter;
use crate::error::EngineError;
use crate::record::{record_order, DeleteTags, Header, Record};

struct Slot<K, V> {
    cell: UnsafeCell<MaybeUninit<Record<K, V>>>,
    ready: AtomicBool,
}

impl<K, V> Slot<K, V> {
    fn empty() -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            ready: AtomicBool::new(false),
        }
    }
}

/// A single rotating write buffer. Readers that hold a shared reference may
/// freely call `snapshot_sorted` while writers concurrently reserve and fill
/// new slots, so long as readers only ever touch slots already marked
/// `ready`.
pub struct MemTable<K, V> {
    slots: Vec<Slot<K, V>>,
    capacity: usize,
    /// Next slot index to hand out. May exceed `capacity` transiently; the
    /// caller must treat that as "full" and not index past `capacity`.
    tail: AtomicUsize,
    /// Count of slots that have completed their release-store publish.
    published: AtomicUsize,
    tombstone_count: AtomicUsize,
    tombstone_capacity: usize,
    /// Approximate running weight sum. Only used to prioritize which
    /// memtable the sample executor's top-level alias favors; exactness
    /// doesn't matter because every candidate still passes per-key
    /// rejection sampling (see `sample.rs`).
    total_weight: AtomicU64,
    filter: parking_lot::Mutex<TombstoneFilter<K>>,
    /// Set once the memtable is handed to the compactor; new `append` calls
    /// are refused against a merging table.
    merging: AtomicBool,
    next_insert_index: AtomicU64,
    /// Monotonic creation order across the engine's rotating memtable
    /// pool. Insert indices are only comparable within one memtable
    /// instance, so a point lookup that checks several generations at once
    /// breaks ties by generation rather than by insert index. Atomic so
    /// `truncate` can recycle a drained instance back into the pool under
    /// a new generation without requiring `&mut self`.
    generation: AtomicU64,
}

// SAFETY: each slot is written at most once, by whichever thread won the
// `tail` fetch_add for that index, before its `ready` flag is published
// with a `Release` store; every other access is a read gated on an
// `Acquire` load of that same flag. No two threads ever observe a slot
// through conflicting access modes.
unsafe impl<K: Send, V: Send> Sync for MemTable<K, V> {}

impl<K, V> MemTable<K, V>
where
    K: Ord + Copy + std::hash::Hash + Send + Sync,
    V: Copy + PartialEq + Send + Sync,
{
    pub fn new(capacity: usize, tombstone_capacity: usize, bloom_fpr: f64, bloom_hash_functions: usize, seed: u64) -> Self {
        Self::with_generation(capacity, tombstone_capacity, bloom_fpr, bloom_hash_functions, seed, 0)
    }

    pub fn with_generation(
        capacity: usize,
        tombstone_capacity: usize,
        bloom_fpr: f64,
        bloom_hash_functions: usize,
        seed: u64,
        generation: u64,
    ) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::empty);
        Self {
            slots,
            capacity,
            tail: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
            tombstone_count: AtomicUsize::new(0),
            tombstone_capacity,
            total_weight: AtomicU64::new(0),
            filter: parking_lot::Mutex::new(TombstoneFilter::new(
                tombstone_capacity.max(1),
                bloom_fpr,
                bloom_hash_functions,
                seed,
            )),
            merging: AtomicBool::new(false),
            next_insert_index: AtomicU64::new(0),
            generation: AtomicU64::new(generation),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Assigns a new generation number, used by the engine's rotating pool
    /// when handing a recycled (truncated) memtable back out as the active
    /// slot -- generation order must track real rotation order, so the
    /// engine (not `truncate` itself) supplies the value from its own
    /// monotonic counter.
    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    /// Atomically claims this memtable for compaction. Returns `true` iff
    /// this call made the claim (i.e. it wasn't already merging).
    pub fn mark_merging(&self) -> bool {
        self.merging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_count(&self) -> usize {
        self.published.load(Ordering::Acquire).min(self.capacity)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstone_count.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.tail.load(Ordering::Acquire) >= self.capacity
    }

    pub fn approximate_weight(&self) -> u64 {
        self.total_weight.load(Ordering::Relaxed)
    }

    /// Reserves a slot and writes `record` into it. Fails with
    /// `CapacityExhausted`/`TombstoneCapacityExhausted` without reserving
    /// anything if the relevant limit has already been reached.
    pub fn append(
        &self,
        key: K,
        value: V,
        weight: u32,
        is_tombstone: bool,
    ) -> Result<(), EngineError> {
        if self.merging.load(Ordering::Acquire) {
            return Err(EngineError::CapacityExhausted);
        }
        if is_tombstone && self.tombstone_count.load(Ordering::Acquire) >= self.tombstone_capacity
        {
            return Err(EngineError::TombstoneCapacityExhausted);
        }

        let idx = self.tail.fetch_add(1, Ordering::AcqRel);
        if idx >= self.capacity {
            // Over-subscribed; this reservation is void, nothing to undo
            // since nothing was written.
            return Err(EngineError::CapacityExhausted);
        }

        let insert_index = self.next_insert_index.fetch_add(1, Ordering::Relaxed);
        let record = Record {
            key,
            value,
            weight,
            header: Header::new(is_tombstone, insert_index),
        };

        // SAFETY: `idx` was obtained from a unique fetch_add, so no other
        // thread holds this index; the slot is written at most once.
        unsafe {
            (*self.slots[idx].cell.get()).write(record);
        }
        self.slots[idx].ready.store(true, Ordering::Release);
        self.published.fetch_add(1, Ordering::AcqRel);

        if is_tombstone {
            self.tombstone_count.fetch_add(1, Ordering::AcqRel);
            self.filter.lock().insert(&key);
        }
        self.total_weight.fetch_add(weight as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Spins until every slot below `tail` has completed its publish. Must
    /// be called before treating the memtable as a stable, readable
    /// snapshot (i.e. before flushing it into a `SortedRun`).
    pub fn quiesce(&self) {
        let target = self.tail.load(Ordering::Acquire).min(self.capacity);
        while self.published.load(Ordering::Acquire) < target {
            std::hint::spin_loop();
        }
    }

    fn get_slot(&self, idx: usize) -> Option<&Record<K, V>> {
        if idx >= self.slots.len() || !self.slots[idx].ready.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: `ready` was stored with Release after `write`, so this
        // Acquire load synchronizes-with that store.
        Some(unsafe { &*(*self.slots[idx].cell.get()).as_ptr() })
    }

    /// Point lookup: returns the most recently inserted record for `key`,
    /// scanning newest-to-oldest so a later tombstone shadows an earlier
    /// value.
    pub fn get(&self, key: K) -> Option<&Record<K, V>> {
        let n = self.record_count();
        let mut best: Option<&Record<K, V>> = None;
        for i in 0..n {
            if let Some(r) = self.get_slot(i) {
                if r.key == key {
                    match best {
                        None => best = Some(r),
                        Some(b) if r.header.insert_index > b.header.insert_index => best = Some(r),
                        _ => {}
                    }
                }
            }
        }
        best
    }

    /// `true` if a tombstone for `key` has possibly been inserted (bloom
    /// filter may false-positive; never false-negatives).
    pub fn may_contain_tombstone(&self, key: &K) -> bool {
        self.filter.lock().lookup(key)
    }

    /// Produces a key-sorted snapshot of every record this memtable holds,
    /// live or tombstone, with no collapsing of same-key duplicates: each
    /// successful `append` survives here as its own record, exactly as
    /// invariant 6 requires. Resolving a tombstone against the live copy it
    /// shadows is the merge-construction's job (`SortedRun::merge`'s
    /// adjacent-pair cancellation), not the memtable's. Must be called only
    /// after `quiesce()` (or after `mark_merging` has been observed and the
    /// caller has itself quiesced).
    pub fn snapshot_sorted(&self) -> Vec<Record<K, V>> {
        self.quiesce();
        let n = self.record_count();
        let mut all: Vec<Record<K, V>> = (0..n).filter_map(|i| self.get_slot(i).copied()).collect();
        all.sort_by(record_order);
        all
    }

    pub fn make_delete_tags(&self) -> DeleteTags {
        DeleteTags::new(self.record_count())
    }

    /// Resets this memtable to empty so it can be handed back into the
    /// engine's rotating pool after its contents have been flushed into a
    /// `SortedRun`. Does not touch `generation`; the engine assigns a fresh
    /// one via `set_generation` when the instance re-enters service.
    pub fn truncate(&self) {
        for slot in &self.slots {
            slot.ready.store(false, Ordering::Release);
        }
        self.tail.store(0, Ordering::Release);
        self.published.store(0, Ordering::Release);
        self.tombstone_count.store(0, Ordering::Release);
        self.total_weight.store(0, Ordering::Relaxed);
        self.next_insert_index.store(0, Ordering::Relaxed);
        self.filter.lock().clear();
        self.merging.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_get() {
        let mt: MemTable<i64, i64> = MemTable::new(16, 8, 0.01, 7, 1);
        mt.append(1, 100, 1, false).unwrap();
        mt.append(2, 200, 1, false).unwrap();
        assert_eq!(mt.get(1).unwrap().value, 100);
        assert_eq!(mt.get(2).unwrap().value, 200);
        assert!(mt.get(3).is_none());
    }

    #[test]
    fn newer_write_shadows_older() {
        let mt: MemTable<i64, i64> = MemTable::new(16, 8, 0.01, 7, 1);
        mt.append(1, 100, 1, false).unwrap();
        mt.append(1, 200, 1, false).unwrap();
        assert_eq!(mt.get(1).unwrap().value, 200);
    }

    #[test]
    fn tombstone_shadows_value() {
        let mt: MemTable<i64, i64> = MemTable::new(16, 8, 0.01, 7, 1);
        mt.append(1, 100, 1, false).unwrap();
        mt.append(1, 0, 0, true).unwrap();
        assert!(mt.get(1).unwrap().is_tombstone());
        assert!(mt.may_contain_tombstone(&1));
    }

    #[test]
    fn capacity_exhaustion_is_reported() {
        let mt: MemTable<i64, i64> = MemTable::new(2, 8, 0.01, 7, 1);
        mt.append(1, 1, 1, false).unwrap();
        mt.append(2, 2, 1, false).unwrap();
        assert!(matches!(
            mt.append(3, 3, 1, false),
            Err(EngineError::CapacityExhausted)
        ));
    }

    #[test]
    fn tombstone_capacity_exhaustion_is_reported() {
        let mt: MemTable<i64, i64> = MemTable::new(16, 1, 0.01, 7, 1);
        mt.append(1, 0, 0, true).unwrap();
        assert!(matches!(
            mt.append(2, 0, 0, true),
            Err(EngineError::TombstoneCapacityExhausted)
        ));
        // Non-tombstone appends still succeed.
        mt.append(3, 3, 1, false).unwrap();
    }

    #[test]
    fn snapshot_is_sorted_but_keeps_duplicate_keys() {
        let mt: MemTable<i64, i64> = MemTable::new(16, 8, 0.01, 7, 1);
        mt.append(3, 30, 1, false).unwrap();
        mt.append(1, 10, 1, false).unwrap();
        mt.append(2, 20, 1, false).unwrap();
        mt.append(1, 11, 1, false).unwrap();
        let snap = mt.snapshot_sorted();
        let keys: Vec<i64> = snap.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![1, 1, 2, 3]);
        // Both copies of key 1 survive, ordered by insertion.
        assert_eq!(snap[0].value, 10);
        assert_eq!(snap[1].value, 11);
    }

    #[test]
    fn mark_merging_is_single_claim() {
        let mt: MemTable<i64, i64> = MemTable::new(16, 8, 0.01, 7, 1);
        assert!(mt.mark_merging());
        assert!(!mt.mark_merging());
        assert!(matches!(
            mt.append(1, 1, 1, false),
            Err(EngineError::CapacityExhausted)
        ));
    }

    #[test]
    fn truncate_resets_to_empty_and_allows_reuse() {
        let mt: MemTable<i64, i64> = MemTable::new(16, 8, 0.01, 7, 1);
        mt.append(1, 10, 1, false).unwrap();
        mt.append(2, 0, 0, true).unwrap();
        mt.set_generation(5);
        mt.mark_merging();

        mt.truncate();

        assert_eq!(mt.record_count(), 0);
        assert_eq!(mt.tombstone_count(), 0);
        assert!(!mt.is_full());
        assert!(!mt.is_merging());
        assert!(mt.get(1).is_none());
        assert!(!mt.may_contain_tombstone(&2));
        // Generation is untouched by truncate; the engine bumps it
        // separately when the instance re-enters the rotation.
        assert_eq!(mt.generation(), 5);

        mt.append(3, 30, 1, false).unwrap();
        assert_eq!(mt.get(3).unwrap().value, 30);
    }
}
