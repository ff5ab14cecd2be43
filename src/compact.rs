//! Background compaction: memtable flushes and the cascading merges that
//! keep each level within its capacity and tombstone-fraction bound.
//!
//! Compaction runs on a dedicated background thread fed by a
//! `crossbeam::channel`, so `Engine::append` never blocks on a merge it
//! didn't itself trigger the tail end of. Cascade recursion is one
//! recursive `make_room` call that handles both the capacity trigger and
//! the tombstone-fraction trigger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::{DeleteMode, EngineOptions};
use crate::error::EngineError;
use crate::level::Level;
use crate::memtable::MemTable;
use crate::sorted_run::SortedRun;
use crate::version::{Version, VersionedCell};

enum CompactionRequest<K, V> {
    Flush(Arc<MemTable<K, V>>),
}

/// Owns the background compaction thread. Dropping the compactor closes
/// the request channel and joins the thread, so no flush is left stranded
/// mid-queue when the engine shuts down.
pub struct Compactor<K, V> {
    sender: Sender<CompactionRequest<K, V>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl<K, V> Compactor<K, V>
where
    K: Ord + Copy + std::hash::Hash + crate::sorted_run::index::SplineKey + Send + Sync + 'static,
    V: Copy + PartialEq + Send + Sync + 'static,
{
    pub fn spawn(
        versioned: Arc<VersionedCell<K, V>>,
        options: EngineOptions,
        free_memtables: Arc<Mutex<Vec<Arc<MemTable<K, V>>>>>,
    ) -> Self {
        let (sender, receiver): (Sender<CompactionRequest<K, V>>, Receiver<CompactionRequest<K, V>>) =
            channel::unbounded();
        let seed_counter = Arc::new(AtomicU64::new(1));

        let handle = std::thread::Builder::new()
            .name("lsm-compactor".into())
            .spawn(move || {
                for request in receiver {
                    match request {
                        CompactionRequest::Flush(memtable) => {
                            if let Err(err) =
                                flush_memtable(&versioned, &memtable, &options, &seed_counter)
                            {
                                tracing::error!(error = %err, "compaction cascade failed");
                            } else {
                                tracing::debug!(
                                    version = versioned.snapshot().version_num,
                                    "installed new version after flush"
                                );
                                memtable.truncate();
                                free_memtables.lock().push(memtable);
                            }
                        }
                    }
                }
                tracing::debug!("compactor thread exiting: request channel closed");
            })
            .expect("failed to spawn compaction thread");

        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Enqueues a memtable for flushing. The caller must have already
    /// claimed it via `MemTable::mark_merging`.
    pub fn request_flush(&self, memtable: Arc<MemTable<K, V>>) {
        // An unbounded channel never blocks the sender; a send failure here
        // only happens if the worker thread has already exited, which only
        // occurs during/after `Drop`.
        let _ = self.sender.send(CompactionRequest::Flush(memtable));
    }
}

impl<K, V> Drop for Compactor<K, V> {
    fn drop(&mut self) {
        // Dropping `sender` (implicitly, as part of `self`) closes the
        // channel once this is the last sender, which ends the worker's
        // `for request in receiver` loop.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Flushes `memtable`'s sorted snapshot into the version stack, cascading
/// as many levels as necessary.
fn flush_memtable<K, V>(
    versioned: &VersionedCell<K, V>,
    memtable: &MemTable<K, V>,
    options: &EngineOptions,
    seed_counter: &AtomicU64,
) -> Result<(), EngineError>
where
    K: Ord + Copy + std::hash::Hash + crate::sorted_run::index::SplineKey,
    V: Copy + PartialEq,
{
    let records = memtable.snapshot_sorted();
    if records.is_empty() {
        return Ok(());
    }

    let seed = seed_counter.fetch_add(1, Ordering::Relaxed);
    let run = SortedRun::from_memtable_snapshot(
        records,
        options.delete_mode,
        options.bloom_fpr,
        options.bloom_hash_functions,
        options.index_kind,
        seed,
    );

    let current = versioned.snapshot();
    let mut levels: Vec<Level<K, V>> = current.levels.clone();
    let max_depth = options
        .max_cascade_depth
        .unwrap_or_else(|| current.height().max(1));

    make_room(&mut levels, 0, run, options, seed_counter, max_depth)?;

    let new_version_num = versioned.next_version_num();
    versioned.install(Version {
        levels,
        version_num: new_version_num,
    });
    Ok(())
}

/// Inserts `incoming` at `levels[depth]`, recursively cascading into
/// `depth + 1` if the level can't absorb it without exceeding its capacity
/// or tombstone-fraction bound. Bounded by `max_depth`.
fn make_room<K, V>(
    levels: &mut Vec<Level<K, V>>,
    depth: usize,
    incoming: SortedRun<K, V>,
    options: &EngineOptions,
    seed_counter: &AtomicU64,
    max_depth: usize,
) -> Result<(), EngineError>
where
    K: Ord + Copy + std::hash::Hash + crate::sorted_run::index::SplineKey,
    V: Copy + PartialEq,
{
    if depth > max_depth {
        return Err(EngineError::CascadeDepthExceeded(max_depth));
    }
    if depth == levels.len() {
        let capacity = options
            .memtable_capacity
            .saturating_mul(options.scale_factor.pow((depth + 1) as u32));
        levels.push(Level::new(options.policy, capacity));
    }

    let needs_cascade = {
        let level = &levels[depth];
        let prospective_records = level.record_count() + incoming.record_count();
        let prospective_tombstones = level.tombstone_count() + incoming.tombstone_count();
        let over_tombstone_bound = prospective_records > 0
            && (prospective_tombstones as f64 / prospective_records as f64) > options.tombstone_fraction;
        !level.can_accept(options.scale_factor)
            || prospective_records > level.capacity()
            || over_tombstone_bound
    };

    if !needs_cascade {
        levels[depth].append_run(Arc::new(incoming));
        return Ok(());
    }

    let seed = seed_counter.fetch_add(1, Ordering::Relaxed);
    let mut to_merge = levels[depth].take_runs();
    to_merge.push(Arc::new(incoming));
    let mut merged = SortedRun::merge(
        to_merge.iter().map(|r| r.as_ref()),
        options.delete_mode,
        options.bloom_fpr,
        options.bloom_hash_functions,
        options.index_kind,
        seed,
    );

    if options.delete_mode == DeleteMode::Tag {
        merged = propagate_tag_deletes(merged, &levels[depth + 1..], options, seed_counter);
    }

    make_room(levels, depth + 1, merged, options, seed_counter, max_depth)
}

/// In `DeleteMode::Tag`, a tombstone that survives a merge still owes an
/// attempt to tag a live copy further down the version stack before it's
/// allowed to keep propagating as a standalone row. This walks the levels
/// strictly below the one just merged and drops any tombstone it manages
/// to plant.
fn propagate_tag_deletes<K, V>(
    merged: SortedRun<K, V>,
    older_levels: &[Level<K, V>],
    options: &EngineOptions,
    seed_counter: &AtomicU64,
) -> SortedRun<K, V>
where
    K: Ord + Copy + std::hash::Hash + crate::sorted_run::index::SplineKey,
    V: Copy + PartialEq,
{
    if older_levels.is_empty() {
        return merged;
    }
    let mut records = merged.into_parts();
    let before = records.len();
    records.retain(|r| {
        if r.is_tombstone() {
            !older_levels.iter().any(|lvl| lvl.try_delete(r.key, r.value))
        } else {
            true
        }
    });
    if records.len() != before {
        tracing::trace!(
            tagged = before - records.len(),
            "propagated delete tags into older levels"
        );
    }
    let seed = seed_counter.fetch_add(1, Ordering::Relaxed);
    SortedRun::from_sorted_records(
        records,
        options.delete_mode,
        options.bloom_fpr,
        options.bloom_hash_functions,
        options.index_kind,
        seed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexKind, Policy};
    use crate::record::Header;
    use crate::record::Record;

    fn rec(key: i64, value: i64, tombstone: bool, idx: u64) -> Record<i64, i64> {
        Record {
            key,
            value,
            weight: 1,
            header: Header::new(tombstone, idx),
        }
    }

    fn base_options() -> EngineOptions {
        EngineOptions {
            memtable_capacity: 4,
            memtable_tombstone_capacity: 4,
            memtable_count: 2,
            scale_factor: 2,
            policy: Policy::Leveling,
            tombstone_fraction: 0.5,
            bloom_fpr: 0.01,
            bloom_hash_functions: 7,
            sample_mode: crate::config::SampleMode::Uniform,
            delete_mode: DeleteMode::Cancel,
            index_kind: IndexKind::Isam,
            max_cascade_depth: Some(8),
        }
    }

    #[test]
    fn make_room_appends_when_level_empty() {
        let options = base_options();
        let seed_counter = AtomicU64::new(1);
        let mut levels: Vec<Level<i64, i64>> = Vec::new();
        let run = SortedRun::from_memtable_snapshot(
            vec![rec(1, 10, false, 0), rec(2, 20, false, 1)],
            options.delete_mode,
            options.bloom_fpr,
            options.bloom_hash_functions,
            options.index_kind,
            1,
        );
        make_room(&mut levels, 0, run, &options, &seed_counter, 8).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].run_count(), 1);
        assert_eq!(levels[0].record_count(), 2);
    }

    #[test]
    fn make_room_cascades_when_capacity_exceeded() {
        let mut options = base_options();
        options.memtable_capacity = 2; // level 0 capacity = 2 * 2^1 = 4
        let seed_counter = AtomicU64::new(1);
        let mut levels: Vec<Level<i64, i64>> = Vec::new();

        let first = SortedRun::from_memtable_snapshot(
            vec![rec(1, 1, false, 0), rec(2, 2, false, 1), rec(3, 3, false, 2)],
            options.delete_mode,
            options.bloom_fpr,
            options.bloom_hash_functions,
            options.index_kind,
            1,
        );
        make_room(&mut levels, 0, first, &options, &seed_counter, 8).unwrap();
        assert_eq!(levels[0].run_count(), 1);

        // Leveling: level 0 can't accept a second run, so this should
        // cascade the merge of [first, second] into level 1.
        let second = SortedRun::from_memtable_snapshot(
            vec![rec(4, 4, false, 3)],
            options.delete_mode,
            options.bloom_fpr,
            options.bloom_hash_functions,
            options.index_kind,
            2,
        );
        make_room(&mut levels, 0, second, &options, &seed_counter, 8).unwrap();
        assert!(levels[0].is_empty());
        assert_eq!(levels[1].record_count(), 4);
    }

    #[test]
    fn cascade_depth_is_bounded() {
        let options = base_options();
        let seed_counter = AtomicU64::new(1);
        let mut levels: Vec<Level<i64, i64>> = Vec::new();
        let run = SortedRun::from_memtable_snapshot(
            vec![rec(1, 1, false, 0)],
            options.delete_mode,
            options.bloom_fpr,
            options.bloom_hash_functions,
            options.index_kind,
            1,
        );
        let err = make_room(&mut levels, 1, run, &options, &seed_counter, 0).unwrap_err();
        assert!(matches!(err, EngineError::CascadeDepthExceeded(0)));
    }
}
