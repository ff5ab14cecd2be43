//! `Engine`: the public facade tying memtables, the version stack, and the
//! background compactor together.
//!
//! A thin outer type holding configuration and a handle to the mutable
//! inner state, with writers and the compaction thread coordinating
//! through that shared state rather than through the caller.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::compact::Compactor;
use crate::config::{EngineOptions, SampleMode};
use crate::error::EngineError;
use crate::memtable::MemTable;
use crate::page_store::{InMemoryPageStore, PageStore};
use crate::rng::RngSource;
use crate::sample;
use crate::sorted_run::index::SplineKey;
use crate::version::{Version, VersionedCell};

/// The sampling-specialized LSM engine. Callers that need multiple handles
/// wrap it in their own `Arc<Engine<K, V>>`; the background compactor
/// thread is joined when the engine (and its internal
/// `Arc<Compactor<_, _>>`) is dropped.
pub struct Engine<K, V> {
    options: EngineOptions,
    memtables: Mutex<Vec<Arc<MemTable<K, V>>>>,
    active: AtomicUsize,
    /// Drained memtables the compactor has flushed and truncated, waiting
    /// to be handed back out by `rotate` instead of allocating a fresh
    /// instance every time -- the fixed-size pool the engine's lifecycle
    /// model expects, rather than one-shot-and-discard buffers.
    free_memtables: Arc<Mutex<Vec<Arc<MemTable<K, V>>>>>,
    versioned: Arc<VersionedCell<K, V>>,
    compactor: Arc<Compactor<K, V>>,
    #[allow(dead_code)]
    page_store: Arc<dyn PageStore>,
    seed_counter: AtomicU64,
    generation_counter: AtomicU64,
}

impl<K, V> Engine<K, V>
where
    K: Ord + Copy + std::hash::Hash + SplineKey + Send + Sync + 'static,
    V: Copy + PartialEq + Send + Sync + 'static,
{
    pub fn open(options: EngineOptions) -> Result<Self, EngineError> {
        options.validate().map_err(EngineError::InvalidConfig)?;

        let memtables: Vec<Arc<MemTable<K, V>>> = (0..options.memtable_count)
            .map(|i| {
                Arc::new(MemTable::with_generation(
                    options.memtable_capacity,
                    options.memtable_tombstone_capacity,
                    options.bloom_fpr,
                    options.bloom_hash_functions,
                    i as u64 + 1,
                    i as u64,
                ))
            })
            .collect();

        let free_memtables = Arc::new(Mutex::new(Vec::new()));
        let versioned = Arc::new(VersionedCell::new(Version::empty(0)));
        let compactor = Arc::new(Compactor::spawn(
            Arc::clone(&versioned),
            options.clone(),
            Arc::clone(&free_memtables),
        ));

        Ok(Self {
            options,
            memtables: Mutex::new(memtables),
            active: AtomicUsize::new(0),
            free_memtables,
            versioned,
            compactor,
            page_store: Arc::new(InMemoryPageStore::new()),
            seed_counter: AtomicU64::new(1_000),
            generation_counter: AtomicU64::new(1_000),
        })
    }

    /// Inserts or overwrites `key` with `value` and sampling `weight`.
    pub fn append(&self, key: K, value: V, weight: u32) -> Result<(), EngineError> {
        self.insert(key, value, weight, false)
    }

    /// Marks `(key, value)` deleted by writing a tombstone. `value` must
    /// match the live record for the delete to eventually resolve via
    /// `DeleteMode::Tag`; in `DeleteMode::Cancel` only the key matters.
    pub fn delete(&self, key: K, value: V) -> Result<(), EngineError> {
        self.insert(key, value, 0, true)
    }

    fn insert(&self, key: K, value: V, weight: u32, is_tombstone: bool) -> Result<(), EngineError> {
        let attempts_cap = self.options.memtable_count.saturating_mul(64).max(64);
        for _ in 0..attempts_cap {
            let idx = self.active.load(Ordering::Acquire) % self.memtables.lock().len();
            let table = Arc::clone(&self.memtables.lock()[idx]);
            match table.append(key, value, weight, is_tombstone) {
                Ok(()) => return Ok(()),
                Err(EngineError::TombstoneCapacityExhausted) => {
                    // The active table has no tombstone headroom left but
                    // may still have record headroom; rotating it out is
                    // the only way to make progress for a tombstone write.
                    self.rotate(idx);
                }
                Err(_) => self.rotate(idx),
            }
        }
        Err(EngineError::CapacityExhausted)
    }

    fn rotate(&self, observed_idx: usize) {
        let mut slots = self.memtables.lock();
        let len = slots.len();
        let current_idx = self.active.load(Ordering::Acquire) % len;
        if current_idx != observed_idx {
            // Someone else already rotated past this slot.
            return;
        }
        let next_idx = (current_idx + 1) % len;
        let generation = self.generation_counter.fetch_add(1, Ordering::Relaxed);
        let recycled = self.free_memtables.lock().pop();
        let fresh = match recycled {
            Some(mt) => {
                mt.set_generation(generation);
                mt
            }
            None => {
                let seed = self.seed_counter.fetch_add(1, Ordering::Relaxed);
                Arc::new(MemTable::with_generation(
                    self.options.memtable_capacity,
                    self.options.memtable_tombstone_capacity,
                    self.options.bloom_fpr,
                    self.options.bloom_hash_functions,
                    seed,
                    generation,
                ))
            }
        };
        let old = std::mem::replace(&mut slots[next_idx], fresh);
        self.active.store(next_idx, Ordering::Release);
        drop(slots);

        if old.mark_merging() {
            self.compactor.request_flush(old);
        }
    }

    /// Point lookup across every live memtable generation, newest-first,
    /// falling back to the pinned version.
    pub fn get(&self, key: K) -> Option<V> {
        let slots: Vec<Arc<MemTable<K, V>>> = self.memtables.lock().clone();
        let newest_mem_hit = slots
            .iter()
            .filter_map(|mt| mt.get(key).map(|r| (mt.generation(), *r)))
            .max_by_key(|(gen, _)| *gen);

        if let Some((_, rec)) = newest_mem_hit {
            return if rec.is_tombstone() { None } else { Some(rec.value) };
        }

        let pin = self.versioned.pin();
        pin.version().get(key).map(|rec| rec.value)
    }

    /// Draws up to `k` samples from `[lower, upper]`, using `mode` from
    /// the engine's configured `sample_mode` unless `mode_override` is
    /// given.
    pub fn range_sample(&self, lower: K, upper: K, k: usize) -> Result<Vec<(K, V)>, EngineError> {
        self.range_sample_with_mode(lower, upper, k, self.options.sample_mode)
    }

    pub fn range_sample_with_mode(
        &self,
        lower: K,
        upper: K,
        k: usize,
        mode: SampleMode,
    ) -> Result<Vec<(K, V)>, EngineError> {
        let slots: Vec<Arc<MemTable<K, V>>> = self.memtables.lock().clone();
        let pin = self.versioned.pin();
        let seed = self.seed_counter.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(seed);
        sample::range_sample(
            pin.version(),
            &slots,
            lower,
            upper,
            k,
            mode,
            self.options.delete_mode,
            &mut rng as &mut dyn RngSource,
        )
    }

    pub fn record_count(&self) -> usize {
        let slots = self.memtables.lock();
        let mem_count: usize = slots.iter().map(|m| m.record_count()).sum();
        mem_count + self.versioned.snapshot().record_count()
    }

    pub fn tombstone_count(&self) -> usize {
        let slots = self.memtables.lock();
        let mem_count: usize = slots.iter().map(|m| m.tombstone_count()).sum();
        mem_count + self.versioned.snapshot().tombstone_count()
    }

    pub fn height(&self) -> usize {
        self.versioned.snapshot().height()
    }

    /// Overall tombstone_count/record_count ratio across every memtable and
    /// level, the aggregate view of the per-level bound each level's own
    /// `tombstone_fraction` enforces individually during compaction.
    pub fn tombstone_fraction(&self) -> f64 {
        let records = self.record_count();
        if records == 0 {
            0.0
        } else {
            self.tombstone_count() as f64 / records as f64
        }
    }

    /// Fraction of the active memtable's record capacity currently used,
    /// a rough signal for callers deciding whether to throttle writers.
    pub fn memory_utilization(&self) -> f64 {
        let slots = self.memtables.lock();
        let idx = self.active.load(Ordering::Acquire) % slots.len();
        let table = &slots[idx];
        table.record_count() as f64 / table.capacity() as f64
    }

    pub fn active_pin_count(&self) -> usize {
        self.versioned.active_pin_count()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}
