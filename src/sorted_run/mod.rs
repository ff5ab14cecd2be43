//! `SortedRun`: an immutable, key-sorted array of records plus the
//! auxiliary structures that make it queryable and sampleable.
//!
//! Pairs a block index and a bloom filter over one run, the way an
//! immutable SSTable would, plus a per-run alias table for weighted
//! sampling. A run here is an in-memory `Vec<Record<K, V>>` rather than an
//! on-disk table; persistence is out of scope (see `page_store.rs`).

pub mod index;

use crate::alias::AliasTable;
use crate::bloom::TombstoneFilter;
use crate::config::{DeleteMode, IndexKind};
use crate::record::{record_order, DeleteTags, Record};
use index::{IsamIndex, RunIndex, SplineKey, SplineIndex};

/// Resolves duplicate keys in a `record_order`-sorted stream by
/// adjacent-pair cancellation: within one key's run of records (always
/// live records before tombstones, per `record_order`), each tombstone
/// cancels the most recently inserted not-yet-cancelled live record --
/// not a blanket collapse to "the newest". Two independent live appends
/// of the same key each survive as distinct records until each is
/// individually cancelled or tagged; an unmatched tombstone (more
/// deletes than live copies) is preserved so it can keep propagating and
/// shadow an older copy further down the version stack.
///
/// Records already carrying `header.is_deleted` (tagged by an earlier
/// resolution pass) pass through untouched and never compete for a
/// tombstone's cancellation -- they're already resolved, dead weight.
pub(crate) fn resolve_duplicates<K, V>(sorted: Vec<Record<K, V>>, delete_mode: DeleteMode) -> Vec<Record<K, V>>
where
    K: Ord + Copy,
    V: Copy + PartialEq,
{
    let mut out = Vec::with_capacity(sorted.len());
    let mut i = 0;
    while i < sorted.len() {
        let key = sorted[i].key;
        let mut j = i + 1;
        while j < sorted.len() && sorted[j].key == key {
            j += 1;
        }
        resolve_group(&sorted[i..j], delete_mode, &mut out);
        i = j;
    }
    out
}

fn resolve_group<K: Copy, V: Copy + PartialEq>(group: &[Record<K, V>], delete_mode: DeleteMode, out: &mut Vec<Record<K, V>>) {
    let mut pending_live: Vec<Record<K, V>> = Vec::new();
    let mut resolved: Vec<Record<K, V>> = Vec::new();
    for rec in group {
        if rec.is_tombstone() {
            match pending_live.pop() {
                Some(live) => match delete_mode {
                    DeleteMode::Cancel => {}
                    DeleteMode::Tag => {
                        let mut tagged = live;
                        tagged.header.is_deleted = true;
                        resolved.push(tagged);
                    }
                },
                None => resolved.push(*rec),
            }
        } else if rec.is_deleted() {
            resolved.push(*rec);
        } else {
            pending_live.push(*rec);
        }
    }
    resolved.extend(pending_live);
    resolved.sort_by_key(|r| r.header.insert_index);
    out.extend(resolved);
}

pub struct SortedRun<K, V> {
    records: Vec<Record<K, V>>,
    tombstone_count: usize,
    filter: TombstoneFilter<K>,
    index: RunIndex<K>,
    delete_tags: DeleteTags,
    /// `None` when the run holds no live weight at all (e.g. every record
    /// was a tombstone or every weight was zero); sampling skips such runs.
    alias: Option<AliasTable>,
}

impl<K, V> SortedRun<K, V>
where
    K: Ord + Copy + std::hash::Hash + SplineKey,
    V: Copy + PartialEq,
{
    fn build_index(keys: &[K], kind: IndexKind) -> RunIndex<K> {
        match kind {
            IndexKind::Isam => RunIndex::Isam(IsamIndex::build(keys)),
            IndexKind::Spline => RunIndex::Spline(SplineIndex::build(keys, 8)),
        }
    }

    /// Builds a run from a record stream that may still hold, for a given
    /// key, multiple live copies and/or a tombstone -- `resolve_duplicates`
    /// is applied first, so every construction path (a solo memtable flush
    /// as well as a multi-run merge) gets identical cancellation semantics.
    pub(crate) fn from_sorted_records(
        records: Vec<Record<K, V>>,
        delete_mode: DeleteMode,
        bloom_fpr: f64,
        bloom_hash_functions: usize,
        index_kind: IndexKind,
        seed: u64,
    ) -> Self {
        let records = resolve_duplicates(records, delete_mode);
        let keys: Vec<K> = records.iter().map(|r| r.key).collect();
        let tombstone_count = records.iter().filter(|r| r.is_tombstone()).count();

        let mut filter = TombstoneFilter::new(tombstone_count.max(1), bloom_fpr, bloom_hash_functions, seed);
        for r in &records {
            if r.is_tombstone() {
                filter.insert(&r.key);
            }
        }

        let weights: Vec<u32> = records
            .iter()
            .map(|r| if r.is_tombstone() || r.is_deleted() { 0 } else { r.weight })
            .collect();
        let alias = AliasTable::build(&weights);

        let index = Self::build_index(&keys, index_kind);
        let delete_tags = DeleteTags::new(records.len());
        for (idx, r) in records.iter().enumerate() {
            if r.is_deleted() {
                delete_tags.set(idx);
            }
        }

        Self {
            records,
            tombstone_count,
            filter,
            index,
            delete_tags,
            alias,
        }
    }

    /// Builds a run from a memtable's raw sorted snapshot (which may still
    /// hold un-cancelled duplicate keys; see `from_sorted_records`).
    pub fn from_memtable_snapshot(
        records: Vec<Record<K, V>>,
        delete_mode: DeleteMode,
        bloom_fpr: f64,
        bloom_hash_functions: usize,
        index_kind: IndexKind,
        seed: u64,
    ) -> Self {
        Self::from_sorted_records(records, delete_mode, bloom_fpr, bloom_hash_functions, index_kind, seed)
    }

    /// Merges `inputs` (each already internally sorted) into one run,
    /// resolving duplicate keys and applying `delete_mode`.
    pub fn merge<'a>(
        inputs: impl IntoIterator<Item = &'a SortedRun<K, V>>,
        delete_mode: DeleteMode,
        bloom_fpr: f64,
        bloom_hash_functions: usize,
        index_kind: IndexKind,
        seed: u64,
    ) -> Self
    where
        K: 'a,
        V: 'a,
    {
        let mut all: Vec<Record<K, V>> = Vec::new();
        for run in inputs {
            all.extend(run.live_and_tombstone_records());
        }
        all.sort_by(record_order);
        Self::from_sorted_records(all, delete_mode, bloom_fpr, bloom_hash_functions, index_kind, seed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.records.len() - self.tombstone_count
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstone_count
    }

    fn bracket(&self, key: &K) -> (usize, usize) {
        self.index.bracket(key, self.records.len())
    }

    /// Smallest index `i` such that `records[i].key >= key`.
    pub fn lower_bound(&self, key: &K) -> usize {
        let (lo, hi) = self.bracket(key);
        self.records[lo..hi]
            .binary_search_by(|r| r.key.cmp(key).then(std::cmp::Ordering::Greater))
            .unwrap_or_else(|i| i)
            + lo
    }

    /// Smallest index `i` such that `records[i].key > key`.
    pub fn upper_bound(&self, key: &K) -> usize {
        let (lo, hi) = self.bracket(key);
        self.records[lo..hi]
            .binary_search_by(|r| r.key.cmp(key).then(std::cmp::Ordering::Less))
            .unwrap_or_else(|i| i)
            + lo
    }

    /// Point lookup, honoring delete-tags (best-effort in `Tag` mode).
    pub fn get(&self, key: K) -> Option<&Record<K, V>> {
        let start = self.lower_bound(&key);
        let end = self.upper_bound(&key);
        self.records[start..end]
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_tombstone())
            .rev()
            .find_map(|(offset, r)| {
                let idx = start + offset;
                if self.delete_tags.is_set(idx) {
                    None
                } else {
                    Some(r)
                }
            })
    }

    /// Whether this run contains a tombstone that could shadow `key`
    /// (approximate via the bloom filter, then confirmed by scanning the
    /// bracketed window).
    pub fn has_tombstone(&self, key: &K) -> bool {
        if !self.filter.lookup(key) {
            return false;
        }
        let start = self.lower_bound(key);
        let end = self.upper_bound(key);
        self.records[start..end].iter().any(|r| r.is_tombstone())
    }

    /// Attempts to delete-tag a live `(key, value)` record in this run.
    /// Returns `true` iff a matching, not-already-tagged record was found
    /// and tagged. Used by `DeleteMode::Tag` cascades to push a tombstone
    /// down into older levels instead of carrying the tombstone row
    /// forward forever.
    pub fn try_delete_tag(&self, key: K, value: V) -> bool {
        let start = self.lower_bound(&key);
        let end = self.upper_bound(&key);
        for idx in start..end {
            let r = &self.records[idx];
            if !r.is_tombstone() && r.matches(key, value) && !self.delete_tags.is_set(idx) {
                return self.delete_tags.set(idx);
            }
        }
        false
    }

    fn is_live_at(&self, idx: usize) -> bool {
        let r = &self.records[idx];
        !r.is_tombstone() && !self.delete_tags.is_set(idx)
    }

    fn live_and_tombstone_records(&self) -> Vec<Record<K, V>> {
        self.records
            .iter()
            .enumerate()
            .map(|(idx, r)| {
                let mut r = *r;
                if self.delete_tags.is_set(idx) {
                    r.header.is_deleted = true;
                }
                r
            })
            .collect()
    }

    /// Returns the half-open index window `[lo, hi)` covering `[lower,
    /// upper]` inclusive, or `None` if the run holds no records in range.
    pub fn range_window(&self, lower: &K, upper: &K) -> Option<(usize, usize)> {
        let lo = self.lower_bound(lower);
        let hi = self.upper_bound(upper);
        if lo >= hi {
            None
        } else {
            Some((lo, hi))
        }
    }

    /// Total live weight in `[lower, upper]`: the `make_sample_range`
    /// descriptor's `total_weight`, used by the sample executor to
    /// proportion the top-level source alias in WIRS mode.
    pub fn weight_in_range(&self, lower: &K, upper: &K) -> u64 {
        match self.range_window(lower, upper) {
            None => 0,
            Some((lo, hi)) => (lo..hi)
                .filter(|&i| self.is_live_at(i))
                .map(|i| self.records[i].weight as u64)
                .sum(),
        }
    }

    /// Total live (non-tombstone, non-tagged) weight across the whole run,
    /// used to proportion the sample executor's top-level source alias.
    pub fn total_weight(&self) -> u64 {
        (0..self.records.len())
            .filter(|&i| self.is_live_at(i))
            .map(|i| self.records[i].weight as u64)
            .sum()
    }

    pub fn record_count_in_range(&self, lower: &K, upper: &K) -> usize {
        match self.range_window(lower, upper) {
            None => 0,
            Some((lo, hi)) => (lo..hi).filter(|&i| self.is_live_at(i)).count(),
        }
    }

    /// Draws one candidate index from the whole-run alias table (WIRS
    /// mode). The caller is responsible for rejecting draws outside
    /// `[lower, upper]` or against tombstoned/tagged slots -- see
    /// `sample.rs`.
    pub fn sample_index(&self, rng: &mut dyn crate::rng::RngSource) -> Option<usize> {
        self.alias.as_ref().map(|a| a.sample(rng))
    }

    /// Draws a uniformly-random live index within `[lower, upper]`
    /// (uniform mode): picks a position uniformly in the window and lets
    /// the caller's rejection loop retry on a tombstoned/tagged miss.
    pub fn sample_uniform_index(
        &self,
        lower: &K,
        upper: &K,
        rng: &mut dyn crate::rng::RngSource,
    ) -> Option<usize> {
        let (lo, hi) = self.range_window(lower, upper)?;
        Some(lo + rng.uniform(hi - lo))
    }

    pub fn record_at(&self, idx: usize) -> &Record<K, V> {
        &self.records[idx]
    }

    pub fn is_index_live(&self, idx: usize) -> bool {
        self.is_live_at(idx)
    }

    pub fn in_range(&self, idx: usize, lower: &K, upper: &K) -> bool {
        let key = &self.records[idx].key;
        key >= lower && key <= upper
    }

    /// Consumes the run, handing back its records (with delete-tags folded
    /// into `Header::is_deleted`) for a caller that wants to rebuild a run
    /// from a filtered subset -- used by the compactor's tag-mode
    /// propagation pass.
    pub(crate) fn into_parts(self) -> Vec<Record<K, V>> {
        self.live_and_tombstone_records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Header;

    fn rec(key: i64, value: i64, weight: u32, tombstone: bool, idx: u64) -> Record<i64, i64> {
        Record {
            key,
            value,
            weight,
            header: Header::new(tombstone, idx),
        }
    }

    fn make_run(records: Vec<Record<i64, i64>>) -> SortedRun<i64, i64> {
        SortedRun::from_memtable_snapshot(records, DeleteMode::Cancel, 0.01, 7, IndexKind::Isam, 1)
    }

    #[test]
    fn lower_upper_bound_bracket_exact_key() {
        let run = make_run(vec![
            rec(1, 10, 1, false, 0),
            rec(3, 30, 1, false, 1),
            rec(5, 50, 1, false, 2),
        ]);
        assert_eq!(run.lower_bound(&3), 1);
        assert_eq!(run.upper_bound(&3), 2);
        assert_eq!(run.lower_bound(&4), 2);
        assert_eq!(run.upper_bound(&0), 0);
    }

    #[test]
    fn get_returns_live_record() {
        let run = make_run(vec![rec(1, 10, 1, false, 0), rec(2, 20, 1, false, 1)]);
        assert_eq!(run.get(1).unwrap().value, 10);
        assert!(run.get(5).is_none());
    }

    #[test]
    fn get_skips_tombstoned_tagged_record() {
        let run = make_run(vec![rec(1, 10, 1, false, 0)]);
        assert!(run.try_delete_tag(1, 10));
        assert!(run.get(1).is_none());
        // Second attempt finds nothing left to tag.
        assert!(!run.try_delete_tag(1, 10));
    }

    #[test]
    fn has_tombstone_detects_shadowing_row() {
        let run = make_run(vec![rec(1, 10, 1, false, 0), rec(1, 0, 0, true, 1)]);
        assert!(run.has_tombstone(&1));
        assert!(!run.has_tombstone(&2));
    }

    #[test]
    fn merge_cancels_tombstone_pairs() {
        let a = make_run(vec![rec(1, 10, 1, false, 0), rec(2, 20, 1, false, 1)]);
        let b = make_run(vec![rec(1, 0, 0, true, 2)]);
        let merged = SortedRun::merge([&a, &b], DeleteMode::Cancel, 0.01, 7, IndexKind::Isam, 1);
        assert!(merged.get(1).is_none());
        assert_eq!(merged.get(2).unwrap().value, 20);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merge_tag_mode_tags_instead_of_dropping_pair() {
        let a = make_run(vec![rec(1, 10, 1, false, 0)]);
        let b = make_run(vec![rec(1, 0, 0, true, 1)]);
        let merged = SortedRun::merge([&a, &b], DeleteMode::Tag, 0.01, 7, IndexKind::Isam, 1);
        assert_eq!(merged.len(), 1);
        assert!(merged.get(1).is_none());
        assert!(merged.record_at(0).is_deleted());
    }

    #[test]
    fn weight_in_range_sums_live_weight_only() {
        let run = make_run(vec![
            rec(1, 10, 5, false, 0),
            rec(2, 0, 0, true, 1),
            rec(3, 30, 7, false, 2),
        ]);
        assert_eq!(run.weight_in_range(&1, &3), 12);
    }

    #[test]
    fn duplicate_live_copies_only_one_cancelled_per_tombstone() {
        // Two independent live appends of the same key, one delete: exactly
        // one copy is cancelled, the other survives.
        let a = make_run(vec![rec(5, 10, 1, false, 0), rec(5, 10, 2, false, 1)]);
        let b = make_run(vec![rec(5, 0, 0, true, 2)]);
        let merged = SortedRun::merge([&a, &b], DeleteMode::Cancel, 0.01, 7, IndexKind::Isam, 1);
        assert_eq!(merged.len(), 1);
        assert!(merged.get(5).is_some());
    }

    #[test]
    fn solo_flush_resolves_duplicates_without_a_merge() {
        // A run built straight from a memtable snapshot (no `merge` call)
        // must still apply cancellation -- invariant 6 holds even when a
        // single memtable never goes through `SortedRun::merge`.
        let run = make_run(vec![rec(1, 10, 1, false, 0), rec(1, 0, 0, true, 1)]);
        assert_eq!(run.len(), 0);
        assert!(run.get(1).is_none());
    }
}
