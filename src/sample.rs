//! `SampleExecutor`: independent range sampling, weighted or uniform.
//!
//! Builds one sample-range descriptor per non-empty source -- the memtable
//! view covers every record it holds, a run's descriptor is its
//! `[lower, upper]` index window -- picks a source proportional to its
//! descriptor weight, draws a candidate from that descriptor's own domain
//! (whole-run alias in WIRS mode, a uniform index in Uniform mode), then
//! rejects the draw if it lands on a tombstone/delete-tagged slot, falls
//! outside the query range, or is shadowed by a tombstone in a newer
//! structure. Rejecting and redrawing is cheaper than rebuilding a
//! range-scoped alias table on every call.

use std::sync::Arc;

use crate::alias::AliasTable;
use crate::config::{DeleteMode, SampleMode};
use crate::error::EngineError;
use crate::memtable::MemTable;
use crate::record::Record;
use crate::rng::RngSource;
use crate::sorted_run::index::SplineKey;
use crate::sorted_run::{resolve_duplicates, SortedRun};
use crate::version::Version;

/// One candidate-producing source for a sampling query: either a memtable's
/// sorted, duplicate-resolved snapshot, or a level's run together with the
/// depth it lives at (needed to check whether a tombstone in a shallower,
/// newer level shadows a candidate drawn from here).
enum Source<'a, K, V> {
    Mem(&'a [Record<K, V>]),
    Run(&'a SortedRun<K, V>, usize),
}

impl<'a, K, V> Source<'a, K, V>
where
    K: Ord + Copy + std::hash::Hash + SplineKey,
    V: Copy + PartialEq,
{
    fn record_at(&self, idx: usize) -> Record<K, V> {
        match self {
            Source::Mem(recs) => recs[idx],
            Source::Run(run, _) => *run.record_at(idx),
        }
    }

    fn is_live(&self, idx: usize) -> bool {
        match self {
            Source::Mem(recs) => !recs[idx].is_tombstone(),
            Source::Run(run, _) => run.is_index_live(idx),
        }
    }

    fn in_range(&self, idx: usize, lower: &K, upper: &K) -> bool {
        match self {
            Source::Mem(recs) => recs[idx].key >= *lower && recs[idx].key <= *upper,
            Source::Run(run, _) => run.in_range(idx, lower, upper),
        }
    }

    /// Descriptor weight: for the memtable view this is the whole snapshot
    /// (a single descriptor covering every record it holds); for a run it
    /// is restricted to `[lower, upper]` via `make_sample_range`.
    fn descriptor_weight(&self, mode: SampleMode, lower: &K, upper: &K) -> u64 {
        match (self, mode) {
            (Source::Mem(recs), SampleMode::Wirs) => recs
                .iter()
                .filter(|r| !r.is_tombstone())
                .map(|r| r.weight as u64)
                .sum(),
            (Source::Mem(recs), SampleMode::Uniform) => recs.len() as u64,
            (Source::Run(run, _), SampleMode::Wirs) => run.weight_in_range(lower, upper),
            (Source::Run(run, _), SampleMode::Uniform) => match run.range_window(lower, upper) {
                Some((lo, hi)) => (hi - lo) as u64,
                None => 0,
            },
        }
    }

    fn sample_index_wirs(&self, rng: &mut dyn RngSource) -> Option<usize> {
        match self {
            Source::Mem(recs) => {
                let weights: Vec<u32> = recs
                    .iter()
                    .map(|r| if r.is_tombstone() { 0 } else { r.weight })
                    .collect();
                AliasTable::build(&weights).map(|t| t.sample(rng))
            }
            Source::Run(run, _) => run.sample_index(rng),
        }
    }

    /// Draws a uniformly-random index from this source's descriptor domain:
    /// the whole snapshot for a memtable, the `[lower, upper]` window for a
    /// run (see `SortedRun::sample_uniform_index`).
    fn sample_index_uniform(&self, lower: &K, upper: &K, rng: &mut dyn RngSource) -> Option<usize> {
        match self {
            Source::Mem(recs) => {
                if recs.is_empty() {
                    None
                } else {
                    Some(rng.uniform(recs.len()))
                }
            }
            Source::Run(run, _) => run.sample_uniform_index(lower, upper, rng),
        }
    }

    /// Depth to check for shadowing tombstones in strictly newer levels;
    /// `None` for a memtable source, since nothing in the version stack is
    /// newer than the active memtables.
    fn shallower_than(&self) -> Option<usize> {
        match self {
            Source::Mem(_) => None,
            Source::Run(_, depth) => Some(*depth),
        }
    }
}

fn is_shadowed<K, V>(mem_snapshots: &[Vec<Record<K, V>>], version: &Version<K, V>, key: K, shallower_than: Option<usize>) -> bool
where
    K: Ord + Copy + std::hash::Hash + SplineKey,
    V: Copy + PartialEq,
{
    if mem_snapshots
        .iter()
        .any(|snap| snap.iter().any(|r| r.key == key && r.is_tombstone()))
    {
        return true;
    }
    match shallower_than {
        Some(depth) => version.has_tombstone_below(&key, depth),
        None => false,
    }
}

/// Draws up to `k` distinct-by-draw `(key, value)` samples from `[lower,
/// upper]`, combining the active memtables and every run in `version`.
pub fn range_sample<K, V>(
    version: &Version<K, V>,
    memtables: &[Arc<MemTable<K, V>>],
    lower: K,
    upper: K,
    k: usize,
    mode: SampleMode,
    delete_mode: DeleteMode,
    rng: &mut dyn RngSource,
) -> Result<Vec<(K, V)>, EngineError>
where
    K: Ord + Copy + std::hash::Hash + SplineKey,
    V: Copy + PartialEq,
{
    if lower > upper {
        return Err(EngineError::InvalidRange);
    }
    if k == 0 {
        return Ok(Vec::new());
    }

    // Resolve same-key duplicates within each memtable snapshot before it
    // feeds either a `Source::Mem` or `is_shadowed`'s tombstone check --
    // otherwise a cancelled tombstone's still-unresolved sibling live copy
    // would make `is_shadowed` reject every draw of that key, even the one
    // copy the cancellation left standing (invariant 6).
    let mem_snapshots: Vec<Vec<Record<K, V>>> = memtables
        .iter()
        .map(|m| resolve_duplicates(m.snapshot_sorted(), delete_mode))
        .collect();

    let any_in_range = mem_snapshots
        .iter()
        .any(|snap| snap.iter().any(|r| !r.is_tombstone() && r.key >= lower && r.key <= upper))
        || version
            .levels
            .iter()
            .any(|level| level.runs().iter().any(|run| run.record_count_in_range(&lower, &upper) > 0));
    if !any_in_range {
        return Err(EngineError::InvalidRange);
    }

    let mut sources: Vec<Source<K, V>> = Vec::new();
    for snap in &mem_snapshots {
        if !snap.is_empty() {
            sources.push(Source::Mem(snap));
        }
    }
    for (depth, level) in version.levels.iter().enumerate() {
        for run in level.runs() {
            if !run.is_empty() {
                sources.push(Source::Run(run, depth));
            }
        }
    }

    let weights: Vec<u32> = sources
        .iter()
        .map(|s| s.descriptor_weight(mode, &lower, &upper).min(u32::MAX as u64) as u32)
        .collect();

    let top_alias = match AliasTable::build(&weights) {
        Some(a) => a,
        None => return Err(EngineError::InvalidRange),
    };

    let mut out = Vec::with_capacity(k);
    let max_attempts = k.saturating_mul(2000).saturating_add(10_000);
    let mut attempts = 0usize;

    while out.len() < k && attempts < max_attempts {
        attempts += 1;
        let src_idx = top_alias.sample(rng);
        let source = &sources[src_idx];

        let idx_opt = match mode {
            SampleMode::Wirs => source.sample_index_wirs(rng),
            SampleMode::Uniform => source.sample_index_uniform(&lower, &upper, rng),
        };
        let idx = match idx_opt {
            Some(idx) => idx,
            None => continue,
        };

        if !source.is_live(idx) || !source.in_range(idx, &lower, &upper) {
            continue;
        }
        let rec = source.record_at(idx);
        if is_shadowed(&mem_snapshots, version, rec.key, source.shallower_than()) {
            continue;
        }
        out.push((rec.key, rec.value));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexKind, Policy};
    use crate::level::Level;
    use crate::record::Header;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rec(key: i64, value: i64, weight: u32) -> Record<i64, i64> {
        Record {
            key,
            value,
            weight,
            header: Header::new(false, key as u64),
        }
    }

    #[test]
    fn empty_range_errors() {
        let version: Version<i64, i64> = Version::empty(0);
        let mut rng = StdRng::seed_from_u64(1);
        let err = range_sample(&version, &[], 5, 1, 3, SampleMode::Uniform, DeleteMode::Cancel, &mut rng)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange));
    }

    #[test]
    fn out_of_range_query_errors() {
        let mut level: Level<i64, i64> = Level::new(Policy::Leveling, 100);
        level.append_run(Arc::new(SortedRun::from_memtable_snapshot(
            vec![rec(1, 10, 1), rec(2, 20, 1)],
            DeleteMode::Cancel,
            0.01,
            7,
            IndexKind::Isam,
            1,
        )));
        let version = Version {
            levels: vec![level],
            version_num: 0,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let err = range_sample(&version, &[], 100, 200, 3, SampleMode::Uniform, DeleteMode::Cancel, &mut rng)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange));
    }

    #[test]
    fn uniform_sampling_stays_within_range() {
        let mut level: Level<i64, i64> = Level::new(Policy::Leveling, 100);
        level.append_run(Arc::new(SortedRun::from_memtable_snapshot(
            (0..50).map(|i| rec(i, i * 10, 1)).collect(),
            DeleteMode::Cancel,
            0.01,
            7,
            IndexKind::Isam,
            1,
        )));
        let version = Version {
            levels: vec![level],
            version_num: 0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let samples = range_sample(&version, &[], 10, 20, 50, SampleMode::Uniform, DeleteMode::Cancel, &mut rng)
            .unwrap();
        assert!(!samples.is_empty());
        for (k, _) in &samples {
            assert!((10..=20).contains(k));
        }
    }

    #[test]
    fn tombstoned_key_is_never_sampled() {
        let mut level: Level<i64, i64> = Level::new(Policy::Leveling, 100);
        let mut records: Vec<Record<i64, i64>> = (0..10).map(|i| rec(i, i * 10, 1)).collect();
        records[5] = Record {
            key: 5,
            value: 0,
            weight: 0,
            header: Header::new(true, 100),
        };
        level.append_run(Arc::new(SortedRun::from_memtable_snapshot(
            records,
            DeleteMode::Cancel,
            0.01,
            7,
            IndexKind::Isam,
            1,
        )));
        let version = Version {
            levels: vec![level],
            version_num: 0,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let samples = range_sample(&version, &[], 0, 9, 200, SampleMode::Uniform, DeleteMode::Cancel, &mut rng)
            .unwrap();
        assert!(samples.iter().all(|(k, _)| *k != 5));
    }

    #[test]
    fn duplicate_key_survives_single_cancellation_across_snapshot_and_run() {
        // Two independent live inserts of the same key, one delete --
        // exactly one copy is cancelled, and the surviving copy must still
        // be reachable by `range_sample`.
        let mt: MemTable<i64, i64> = MemTable::new(16, 8, 0.01, 7, 1);
        mt.append(5, 10, 3, false).unwrap();
        mt.append(5, 20, 5, false).unwrap();
        mt.append(5, 0, 0, true).unwrap();
        let version: Version<i64, i64> = Version::empty(0);
        let mut rng = StdRng::seed_from_u64(11);
        let samples = range_sample(
            &version,
            &[Arc::new(mt)],
            5,
            5,
            50,
            SampleMode::Wirs,
            DeleteMode::Cancel,
            &mut rng,
        )
        .unwrap();
        assert!(samples.iter().any(|(k, _)| *k == 5));
    }
}
