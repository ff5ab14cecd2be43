//! Engine configuration, validated once at `Engine::open`.

use serde::{Deserialize, Serialize};

/// Merge policy for non-L0 levels: one run per level, or up to `scale_factor`
/// runs per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Policy {
    Leveling,
    Tiering,
}

/// Whether a deleted record is removed from a run via cancellation during
/// merge, or left in place with its delete-tag bit flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteMode {
    Cancel,
    Tag,
}

/// Distribution a `range_sample` draw is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleMode {
    Uniform,
    Wirs,
}

/// Which auxiliary locator a `SortedRun` builds for `lower_bound`/`upper_bound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Isam,
    Spline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// `B`: max records held by a single memtable.
    pub memtable_capacity: usize,
    /// `ts_cap`: max tombstones held by a single memtable.
    pub memtable_tombstone_capacity: usize,
    /// Number of rotating memtables; must be >= 2 so a writer always has
    /// somewhere to land while one memtable drains to disk.
    pub memtable_count: usize,
    /// `S`: level-to-level growth ratio.
    pub scale_factor: usize,
    pub policy: Policy,
    /// `τ`: max tombstone_count/capacity ratio tolerated in any level.
    pub tombstone_fraction: f64,
    pub bloom_fpr: f64,
    pub bloom_hash_functions: usize,
    pub sample_mode: SampleMode,
    pub delete_mode: DeleteMode,
    pub index_kind: IndexKind,
    /// Bound on `make_room` recursion depth. Defaults to the stack height
    /// observed when a cascade begins if left `None`.
    pub max_cascade_depth: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            memtable_capacity: 1024,
            memtable_tombstone_capacity: 256,
            memtable_count: 2,
            scale_factor: 2,
            policy: Policy::Leveling,
            tombstone_fraction: 0.2,
            bloom_fpr: 0.01,
            bloom_hash_functions: 7,
            sample_mode: SampleMode::Uniform,
            delete_mode: DeleteMode::Cancel,
            index_kind: IndexKind::Isam,
            max_cascade_depth: None,
        }
    }
}

impl EngineOptions {
    /// Validates the option set, returning a human-readable description of
    /// the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.memtable_capacity == 0 {
            return Err("memtable_capacity must be > 0".into());
        }
        if self.memtable_count < 2 {
            return Err("memtable_count must be >= 2".into());
        }
        if self.scale_factor < 2 {
            return Err("scale_factor must be >= 2".into());
        }
        if !(self.tombstone_fraction > 0.0 && self.tombstone_fraction <= 1.0) {
            return Err("tombstone_fraction must be in (0, 1]".into());
        }
        if !(self.bloom_fpr > 0.0 && self.bloom_fpr < 1.0) {
            return Err("bloom_fpr must be in (0, 1)".into());
        }
        if self.bloom_hash_functions == 0 {
            return Err("bloom_hash_functions must be > 0".into());
        }
        Ok(())
    }
}
