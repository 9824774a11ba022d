//! State shared by the components of one session.

use crate::backend::SyncBackend;
use crate::protocol::{ClientId, DocumentName};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// What every periodic component of a session needs to reach the store.
#[derive(Clone)]
pub struct SyncContext {
    pub document: DocumentName,
    pub client_id: ClientId,
    pub backend: Arc<dyn SyncBackend>,
    connected: Arc<AtomicBool>,
    counters: Arc<SyncCounters>,
}

impl SyncContext {
    /// A context for a fresh, not yet connected session.
    pub fn new(document: DocumentName, client_id: ClientId, backend: Arc<dyn SyncBackend>) -> Self {
        Self {
            document,
            client_id,
            backend,
            connected: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(SyncCounters::default()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn counters(&self) -> &SyncCounters {
        &self.counters
    }
}

/// Running totals, updated by the components as they work.
#[derive(Debug, Default)]
pub struct SyncCounters {
    published_batches: AtomicU64,
    published_blobs: AtomicU64,
    remote_applied: AtomicU64,
    own_skipped: AtomicU64,
    failed_applies: AtomicU64,
    snapshots_written: AtomicU64,
    presence_writes: AtomicU64,
}

impl SyncCounters {
    pub(crate) fn record_publish(&self, blobs: usize) {
        self.published_batches.fetch_add(1, Ordering::Relaxed);
        self.published_blobs.fetch_add(blobs as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_applied(&self) {
        self.remote_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_own_skipped(&self) {
        self.own_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_apply(&self) {
        self.failed_applies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot(&self) {
        self.snapshots_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_presence_write(&self) {
        self.presence_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            published_batches: self.published_batches.load(Ordering::Relaxed),
            published_blobs: self.published_blobs.load(Ordering::Relaxed),
            remote_applied: self.remote_applied.load(Ordering::Relaxed),
            own_skipped: self.own_skipped.load(Ordering::Relaxed),
            failed_applies: self.failed_applies.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            presence_writes: self.presence_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Successful appends to the update log.
    pub published_batches: u64,
    /// Local blobs covered by those appends (before merging).
    pub published_blobs: u64,
    pub remote_applied: u64,
    pub own_skipped: u64,
    pub failed_applies: u64,
    pub snapshots_written: u64,
    pub presence_writes: u64,
}
