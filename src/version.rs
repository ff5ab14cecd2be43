//! Versioned, pinnable snapshots of the level structure.
//!
//! A reader takes a read lock just long enough to clone the `Arc`, then
//! releases it and works against an immutable snapshot while the compactor
//! installs new versions behind a write lock. The `Pin` guard exists
//! solely to make the "at most one unpin per successful pin" invariant a
//! property of the type system rather than a convention: `Pin` has no
//! public constructor and no public unpin method, so the only way to end a
//! pin is to drop the guard, which can happen exactly once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::level::Level;

/// An immutable snapshot of the level stack at a point in time.
pub struct Version<K, V> {
    pub levels: Vec<Level<K, V>>,
    pub version_num: u64,
}

impl<K, V> Version<K, V>
where
    K: Ord + Copy + std::hash::Hash + crate::sorted_run::index::SplineKey,
    V: Copy + PartialEq,
{
    pub fn empty(version_num: u64) -> Self {
        Self {
            levels: Vec::new(),
            version_num,
        }
    }

    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Walks levels newest-to-oldest, stopping as soon as either a live
    /// record or a shadowing tombstone is found -- a tombstone in a newer
    /// level must suppress a live copy still sitting in an older one.
    pub fn get(&self, key: K) -> Option<crate::record::Record<K, V>> {
        for level in &self.levels {
            match level.lookup(key) {
                crate::level::Lookup::Live(rec) => return Some(rec),
                crate::level::Lookup::Deleted => return None,
                crate::level::Lookup::NotFound => continue,
            }
        }
        None
    }

    /// A tombstone anywhere in a level strictly below `below_level`
    /// shadows `key` -- used by the sample executor's rejection check and
    /// by point lookups that need to distinguish "never written" from
    /// "deleted".
    pub fn has_tombstone_below(&self, key: &K, below_level: usize) -> bool {
        self.levels
            .iter()
            .take(below_level)
            .any(|level| level.has_tombstone(key))
    }

    pub fn has_tombstone_anywhere(&self, key: &K) -> bool {
        self.levels.iter().any(|level| level.has_tombstone(key))
    }

    pub fn record_count(&self) -> usize {
        self.levels.iter().map(|l| l.record_count()).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.levels.iter().map(|l| l.tombstone_count()).sum()
    }
}

/// RAII handle on a pinned `Version`. Holding one guarantees the pinned
/// version's runs stay reachable (via the `Arc`) even after the compactor
/// installs newer versions; it also increments the owning cell's live-pin
/// counter for the duration, which is what `VersionedCell::active_pin_count`
/// reports.
pub struct Pin<K, V> {
    version: Arc<Version<K, V>>,
    active_pins: Arc<AtomicUsize>,
}

impl<K, V> Pin<K, V> {
    pub fn version(&self) -> &Version<K, V> {
        &self.version
    }

    pub fn version_arc(&self) -> Arc<Version<K, V>> {
        Arc::clone(&self.version)
    }
}

impl<K, V> Drop for Pin<K, V> {
    fn drop(&mut self) {
        self.active_pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds the current version behind a lock and hands out pins.
pub struct VersionedCell<K, V> {
    current: RwLock<Arc<Version<K, V>>>,
    active_pins: Arc<AtomicUsize>,
    next_version_num: AtomicU64,
}

impl<K, V> VersionedCell<K, V>
where
    K: Ord + Copy + std::hash::Hash + crate::sorted_run::index::SplineKey,
    V: Copy + PartialEq,
{
    pub fn new(initial: Version<K, V>) -> Self {
        let next = initial.version_num + 1;
        Self {
            current: RwLock::new(Arc::new(initial)),
            active_pins: Arc::new(AtomicUsize::new(0)),
            next_version_num: AtomicU64::new(next),
        }
    }

    /// Pins the currently-installed version. The returned guard keeps that
    /// exact version alive and visible regardless of subsequent `install`
    /// calls.
    pub fn pin(&self) -> Pin<K, V> {
        let version = Arc::clone(&self.current.read());
        self.active_pins.fetch_add(1, Ordering::AcqRel);
        Pin {
            version,
            active_pins: Arc::clone(&self.active_pins),
        }
    }

    /// Takes a cheap snapshot `Arc` without bumping the pin counter; used
    /// internally by the compactor, which doesn't need the counter (it
    /// already serializes itself against concurrent compactions via its
    /// own lock).
    pub fn snapshot(&self) -> Arc<Version<K, V>> {
        Arc::clone(&self.current.read())
    }

    pub fn next_version_num(&self) -> u64 {
        self.next_version_num.fetch_add(1, Ordering::AcqRel)
    }

    /// Installs a newly-built version, making it visible to all future
    /// `pin`/`snapshot` calls. Versions already pinned by in-flight readers
    /// remain valid until their `Pin` guard drops.
    pub fn install(&self, new_version: Version<K, V>) {
        let mut guard = self.current.write();
        *guard = Arc::new(new_version);
    }

    pub fn active_pin_count(&self) -> usize {
        self.active_pins.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_and_drop_track_counter() {
        let cell: VersionedCell<i64, i64> = VersionedCell::new(Version::empty(0));
        assert_eq!(cell.active_pin_count(), 0);
        let p1 = cell.pin();
        assert_eq!(cell.active_pin_count(), 1);
        let p2 = cell.pin();
        assert_eq!(cell.active_pin_count(), 2);
        drop(p1);
        assert_eq!(cell.active_pin_count(), 1);
        drop(p2);
        assert_eq!(cell.active_pin_count(), 0);
    }

    #[test]
    fn pinned_version_survives_install() {
        let cell: VersionedCell<i64, i64> = VersionedCell::new(Version::empty(0));
        let pin = cell.pin();
        cell.install(Version::empty(1));
        assert_eq!(pin.version().version_num, 0);
        assert_eq!(cell.snapshot().version_num, 1);
    }
}
