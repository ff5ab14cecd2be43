//! `PageStore`: the external persistence seam.
//!
//! Durable storage is explicitly out of scope for this engine -- a
//! `PageStore` is the collaborator a real deployment would plug in to
//! spill runs to disk. What lives here is the trait boundary itself,
//! separating engine logic from an on-disk block/manifest format, backed
//! by `InMemoryPageStore`, good enough for tests and for embedding
//! scenarios that don't need crash recovery.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::EngineError;

pub type PageId = u64;

/// Durable (or, for `InMemoryPageStore`, process-lifetime) storage for
/// opaque pages. The engine never interprets page contents; it only asks
/// for a fresh id, writes bytes to it, and reads them back. Pages are
/// handed back as `Bytes` rather than `Vec<u8>`, so a caller holding many
/// page handles doesn't pay a fresh allocation per read.
pub trait PageStore: Send + Sync {
    fn allocate(&self) -> PageId;
    fn write(&self, id: PageId, data: Bytes) -> Result<(), EngineError>;
    fn read(&self, id: PageId) -> Result<Bytes, EngineError>;
    fn free(&self, id: PageId);
}

#[derive(Default)]
pub struct InMemoryPageStore {
    pages: Mutex<HashMap<PageId, Bytes>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageStore for InMemoryPageStore {
    fn allocate(&self) -> PageId {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn write(&self, id: PageId, data: Bytes) -> Result<(), EngineError> {
        self.pages.lock().insert(id, data);
        Ok(())
    }

    fn read(&self, id: PageId) -> Result<Bytes, EngineError> {
        self.pages.lock().get(&id).cloned().ok_or_else(|| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("page {id} not found"),
            ))
        })
    }

    fn free(&self, id: PageId) {
        self.pages.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let store = InMemoryPageStore::new();
        let id = store.allocate();
        store.write(id, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(store.read(id).unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn read_missing_page_errors() {
        let store = InMemoryPageStore::new();
        assert!(store.read(42).is_err());
    }

    #[test]
    fn free_removes_page() {
        let store = InMemoryPageStore::new();
        let id = store.allocate();
        store.write(id, Bytes::from_static(b"x")).unwrap();
        store.free(id);
        assert!(store.read(id).is_err());
    }
}
