//! Error kinds for the engine, per the error-handling design: these are
//! conditions a caller reacts to, not panics.

use thiserror::Error;

/// Errors surfaced by the public `Engine` API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `append` failed because every rotating memtable is full and none has
    /// room yet. The caller should retry; `Engine::append` already retries
    /// internally in a bounded busy-wait, so this mostly escapes when that
    /// budget is exhausted.
    #[error("memtable capacity exhausted")]
    CapacityExhausted,

    /// A tombstone append was refused because it would exceed the
    /// memtable's tombstone capacity. Non-tombstone appends may still
    /// succeed against the same memtable.
    #[error("tombstone capacity exhausted")]
    TombstoneCapacityExhausted,

    /// `range_sample` was called with `lower > upper`, or the queried range
    /// contains no live records whatsoever.
    #[error("invalid sample range")]
    InvalidRange,

    /// The page store reported a failure while flushing a run. The
    /// compactor aborts the in-progress version and leaves the engine at
    /// the prior version.
    #[error("page store io error: {0}")]
    Io(#[from] std::io::Error),

    /// A version's pin counter would overflow. Internal invariant guard;
    /// should never trigger under the documented usage pattern (one
    /// `Pin` per successful `try_pin`).
    #[error("version pin counter exhausted")]
    PinExhaustion,

    /// A tombstone-fraction cascade recursed past the configured maximum
    /// depth. Cascades are otherwise unbounded; this is a defensive cap.
    #[error("compaction cascade exceeded max depth {0}")]
    CascadeDepthExceeded(usize),

    /// `EngineOptions::validate` rejected the configuration passed to
    /// `Engine::open`.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias for call sites that only need to propagate: wide
/// boundaries (the CLI's `main`) use `anyhow::Result`, while the engine's
/// public surface returns the narrower `EngineError`.
pub type AnyResult<T> = anyhow::Result<T>;
