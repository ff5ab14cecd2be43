//! A log-structured merge tree specialized for independent range sampling,
//! weighted (WIRS) or uniform, with point lookups, tombstone-based
//! deletion, and background compaction running alongside concurrent
//! writers.
//!
//! Start at [`Engine`] for the public surface; [`EngineOptions`] configures
//! it. `MemTable`, `SortedRun`, `Level`, and `Version` are the internal
//! building blocks, exposed for embedding scenarios that want to compose
//! them directly rather than go through `Engine`.

pub mod alias;
pub mod bloom;
pub mod compact;
pub mod config;
pub mod engine;
pub mod error;
pub mod level;
pub mod memtable;
pub mod page_store;
pub mod record;
pub mod rng;
pub mod sample;
pub mod sorted_run;
pub mod version;

pub use config::{DeleteMode, EngineOptions, IndexKind, Policy, SampleMode};
pub use engine::Engine;
pub use error::{AnyResult, EngineError};
pub use record::Record;

/// Initializes the crate's `tracing` subscriber from `RUST_LOG` (or
/// `info` if unset). Intended for binaries embedding this engine; library
/// consumers that already run their own subscriber should skip this and
/// install their own.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
