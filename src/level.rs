//! `Level`: one rung of the LSM, holding one or more `SortedRun`s.
//!
//! A leveling level holds exactly one run; a tiering level holds up to `S`
//! runs; both are tracked by the same struct, with capacity and
//! tombstone-fraction bookkeeping shared across the two policies instead of
//! living in two parallel compaction modules.

use std::sync::Arc;

use crate::config::Policy;
use crate::sorted_run::SortedRun;

/// Runs are held behind `Arc` so that building a new version only needs to
/// clone the pointers of the levels it doesn't touch -- an untouched level
/// is shared, not deep-copied, between the old and new `Version`.
pub struct Level<K, V> {
    runs: Vec<Arc<SortedRun<K, V>>>,
    policy: Policy,
    /// Max record capacity for this level: `memtable_capacity * S^(depth+1)`.
    capacity: usize,
}

/// Result of a tombstone-aware lookup within a single level.
pub enum Lookup<K, V> {
    Live(crate::record::Record<K, V>),
    Deleted,
    NotFound,
}

impl<K, V> Clone for Level<K, V> {
    fn clone(&self) -> Self {
        Self {
            runs: self.runs.clone(),
            policy: self.policy,
            capacity: self.capacity,
        }
    }
}

impl<K, V> Level<K, V>
where
    K: Ord + Copy + std::hash::Hash + crate::sorted_run::index::SplineKey,
    V: Copy + PartialEq,
{
    pub fn new(policy: Policy, capacity: usize) -> Self {
        Self {
            runs: Vec::new(),
            policy,
            capacity,
        }
    }

    pub fn runs(&self) -> &[Arc<SortedRun<K, V>>] {
        &self.runs
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn record_count(&self) -> usize {
        self.runs.iter().map(|r| r.record_count()).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.runs.iter().map(|r| r.tombstone_count()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tombstone_fraction(&self) -> f64 {
        let live = self.record_count();
        if live == 0 {
            0.0
        } else {
            self.tombstone_count() as f64 / live as f64
        }
    }

    /// Whether this level has room for one more incoming run without
    /// itself needing to cascade into the next level down.
    pub fn can_accept(&self, scale_factor: usize) -> bool {
        match self.policy {
            Policy::Leveling => self.runs.is_empty(),
            Policy::Tiering => self.runs.len() < scale_factor,
        }
    }

    /// Appends `run` to this level. In `Leveling` mode this is only ever
    /// called on an empty level (a leveled level's single run is replaced
    /// via `replace_single_run`, not appended to).
    pub fn append_run(&mut self, run: Arc<SortedRun<K, V>>) {
        self.runs.push(run);
    }

    /// Replaces the level's contents with exactly one run, the common
    /// path after a leveling-policy merge-down has produced a new run
    /// combining this level with the overflow from above.
    pub fn replace_single_run(&mut self, run: Arc<SortedRun<K, V>>) {
        self.runs.clear();
        self.runs.push(run);
    }

    pub fn take_runs(&mut self) -> Vec<Arc<SortedRun<K, V>>> {
        std::mem::take(&mut self.runs)
    }

    pub fn get(&self, key: K) -> Option<&crate::record::Record<K, V>> {
        // Newest run is the one most recently appended (tiering) or the
        // sole run (leveling); scan newest-first so later overwrites win.
        self.runs.iter().rev().find_map(|run| run.get(key))
    }

    /// Like `get`, but distinguishes "no entry anywhere in this level" from
    /// "shadowed by a tombstone in this level" -- a plain `Option` can't
    /// tell those apart, and a caller walking down through older levels
    /// needs to stop at the first rather than the second. A run built by
    /// this engine never holds both a live record and a tombstone for the
    /// same key (duplicates are always resolved at merge time), so
    /// checking each run's tombstone presence before its live lookup is
    /// sufficient -- no ordering ambiguity within one run.
    pub fn lookup(&self, key: K) -> Lookup<K, V> {
        for run in self.runs.iter().rev() {
            if run.has_tombstone(&key) {
                return Lookup::Deleted;
            }
            if let Some(rec) = run.get(key) {
                return Lookup::Live(*rec);
            }
        }
        Lookup::NotFound
    }

    pub fn has_tombstone(&self, key: &K) -> bool {
        self.runs.iter().any(|run| run.has_tombstone(key))
    }

    /// Attempts to delete-tag a live `(key, value)` pair anywhere in this
    /// level; used by `DeleteMode::Tag` cascades walking down the version.
    pub fn try_delete(&self, key: K, value: V) -> bool {
        self.runs.iter().any(|run| run.try_delete_tag(key, value))
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexKind;
    use crate::record::Header;
    use crate::record::Record;

    fn rec(key: i64, value: i64) -> Record<i64, i64> {
        Record {
            key,
            value,
            weight: 1,
            header: Header::new(false, 0),
        }
    }

    #[test]
    fn leveling_accepts_only_when_empty() {
        let mut level: Level<i64, i64> = Level::new(Policy::Leveling, 100);
        assert!(level.can_accept(4));
        level.append_run(Arc::new(SortedRun::from_memtable_snapshot(
            vec![rec(1, 1)],
            crate::config::DeleteMode::Cancel,
            0.01,
            7,
            IndexKind::Isam,
            1,
        )));
        assert!(!level.can_accept(4));
    }

    #[test]
    fn tiering_accepts_up_to_scale_factor_runs() {
        let mut level: Level<i64, i64> = Level::new(Policy::Tiering, 100);
        for i in 0..3 {
            assert!(level.can_accept(4));
            level.append_run(Arc::new(SortedRun::from_memtable_snapshot(
                vec![rec(i, i)],
                crate::config::DeleteMode::Cancel,
                0.01,
                7,
                IndexKind::Isam,
                1,
            )));
        }
        assert!(level.can_accept(4));
        level.append_run(Arc::new(SortedRun::from_memtable_snapshot(
            vec![rec(9, 9)],
            crate::config::DeleteMode::Cancel,
            0.01,
            7,
            IndexKind::Isam,
            1,
        )));
        assert!(!level.can_accept(4));
    }

    #[test]
    fn get_prefers_newest_run() {
        let mut level: Level<i64, i64> = Level::new(Policy::Tiering, 100);
        level.append_run(Arc::new(SortedRun::from_memtable_snapshot(
            vec![rec(1, 100)],
            crate::config::DeleteMode::Cancel,
            0.01,
            7,
            IndexKind::Isam,
            1,
        )));
        level.append_run(Arc::new(SortedRun::from_memtable_snapshot(
            vec![rec(1, 200)],
            crate::config::DeleteMode::Cancel,
            0.01,
            7,
            IndexKind::Isam,
            2,
        )));
        assert_eq!(level.get(1).unwrap().value, 200);
    }
}
