//! Fixed-layout records and the ordering used when merging runs.
//!
//! A persisted `PageStore`-backed run would lay a record out as
//! `key | value | header`, each field aligned and padded to a cache line;
//! this in-memory engine keeps the header as a plain struct rather than a
//! packed `u64` -- see DESIGN.md.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Monotonic per-insert index, assigned atomically by the owning MemTable.
pub type InsertIndex = u64;

/// Tombstone flag, delete-tag flag, and insertion index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub is_tombstone: bool,
    pub is_deleted: bool,
    pub insert_index: InsertIndex,
}

impl Header {
    pub fn new(is_tombstone: bool, insert_index: InsertIndex) -> Self {
        Self {
            is_tombstone,
            is_deleted: false,
            insert_index,
        }
    }
}

/// A single LSM record: key, value, sampling weight, and header bits.
#[derive(Debug, Clone, Copy)]
pub struct Record<K, V> {
    pub key: K,
    pub value: V,
    pub weight: u32,
    pub header: Header,
}

impl<K: Ord + Copy, V: Copy + PartialEq> Record<K, V> {
    pub fn new(key: K, value: V, weight: u32, is_tombstone: bool, insert_index: InsertIndex) -> Self {
        Self {
            key,
            value,
            weight,
            header: Header::new(is_tombstone, insert_index),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.header.is_tombstone
    }

    pub fn is_deleted(&self) -> bool {
        self.header.is_deleted
    }

    pub fn matches(&self, key: K, value: V) -> bool {
        self.key == key && self.value == value
    }
}

/// Total order used when merging runs: ascending key, then live records
/// before tombstones of the same key (mirrors `record_cmp` in the original
/// `util/record.h`: a tombstone sorts *after* the data record it shadows, so
/// adjacent-pair cancellation during a merge always sees the data record
/// first), then insertion order as a final tiebreak for stability.
pub fn record_order<K: Ord, V>(a: &Record<K, V>, b: &Record<K, V>) -> Ordering {
    a.key
        .cmp(&b.key)
        .then_with(|| a.header.is_tombstone.cmp(&b.header.is_tombstone))
        .then_with(|| a.header.insert_index.cmp(&b.header.insert_index))
}

/// A side array of delete-tag bits, kept separate from the (otherwise
/// immutable) record array of a `SortedRun`. A delete-tag write is
/// best-effort and unsynchronized -- a `Relaxed` atomic bool array is
/// exactly that, without requiring `&mut` access to an otherwise-shared,
/// immutable buffer.
#[derive(Debug, Default)]
pub struct DeleteTags(Vec<AtomicBool>);

impl DeleteTags {
    pub fn new(len: usize) -> Self {
        Self((0..len).map(|_| AtomicBool::new(false)).collect())
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.0[idx].load(AtomicOrdering::Relaxed)
    }

    /// Sets the tag, returning `true` iff this call was the one to set it
    /// (i.e. it was previously unset).
    pub fn set(&self, idx: usize) -> bool {
        !self.0[idx].swap(true, AtomicOrdering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
