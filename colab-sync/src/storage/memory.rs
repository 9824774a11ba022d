//! In-process pending store.
//!
//! Survives a [`crate::session::SessionHandle`] being dropped, not a process
//! restart. Records go through the same checksummed encoding as the RocksDB
//! store so corruption handling can be exercised without a database.

use super::{PendingRecord, PendingStore};
use crate::error::SyncError;
use crate::protocol::DocumentName;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryPendingStore {
    records: Mutex<HashMap<DocumentName, Vec<u8>>>,
    /// When set, every write fails (quota exceeded, disk full).
    fail_writes: Mutex<bool>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `save_pending`/`clear_pending` calls fail.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    /// Whether any record is held for `document`.
    pub fn contains(&self, document: &DocumentName) -> bool {
        self.records.lock().contains_key(document)
    }

    /// Overwrite the raw stored bytes (corruption tests).
    pub fn put_raw(&self, document: &DocumentName, bytes: Vec<u8>) {
        self.records.lock().insert(document.clone(), bytes);
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        if *self.fail_writes.lock() {
            return Err(SyncError::Storage("pending store is read-only".into()));
        }
        Ok(())
    }
}

impl PendingStore for MemoryPendingStore {
    fn save_pending(&self, document: &DocumentName, blobs: &[Vec<u8>]) -> Result<(), SyncError> {
        self.check_writable()?;
        let bytes = PendingRecord::new(document, blobs).encode()?;
        self.records.lock().insert(document.clone(), bytes);
        Ok(())
    }

    fn load_pending(&self, document: &DocumentName) -> Result<Vec<Vec<u8>>, SyncError> {
        match self.records.lock().get(document) {
            Some(bytes) => Ok(PendingRecord::decode(document, bytes)?.blobs),
            None => Ok(Vec::new()),
        }
    }

    fn clear_pending(&self, document: &DocumentName) -> Result<(), SyncError> {
        self.check_writable()?;
        self.records.lock().remove(document);
        Ok(())
    }
}
