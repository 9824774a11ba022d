//! Pending-update buffer.
//!
//! Holds local update blobs until the shared log has accepted them, and
//! mirrors the unconfirmed set to a [`PendingStore`] so a crash or reload
//! does not lose edits.
//!
//! ```text
//!  enqueue ──► queued ──drain_all──► in_flight ──acknowledge──► (gone)
//!                ▲                       │
//!                └──────── restore ──────┘
//! ```
//! The persisted record always equals `in_flight ++ queued`.

use crate::error::SyncError;
use crate::protocol::DocumentName;
use crate::storage::PendingStore;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct BufferState {
    /// Handed to the publisher, not yet acknowledged.
    in_flight: Vec<Vec<u8>>,
    /// Waiting for the next drain. Restored blobs go to the front.
    queued: VecDeque<Vec<u8>>,
}

impl BufferState {
    fn unconfirmed(&self) -> Vec<Vec<u8>> {
        self.in_flight.iter().chain(self.queued.iter()).cloned().collect()
    }
}

/// Ordered, durable queue of one document's unacknowledged local updates.
pub struct PendingBuffer {
    document: DocumentName,
    store: Arc<dyn PendingStore>,
    state: Mutex<BufferState>,
}

impl PendingBuffer {
    pub fn new(document: DocumentName, store: Arc<dyn PendingStore>) -> Self {
        Self { document, store, state: Mutex::new(BufferState::default()) }
    }

    /// Append a local update and persist the unconfirmed set.
    ///
    /// A persistence failure is logged; the blob stays buffered in memory and
    /// will be published regardless.
    pub fn enqueue(&self, blob: Vec<u8>) {
        let mut state = self.state.lock();
        state.queued.push_back(blob);
        self.write_through(&state);
    }

    /// Move every queued blob to the in-flight set and return them in order.
    ///
    /// Atomic with respect to [`enqueue`](Self::enqueue): a blob enqueued
    /// concurrently lands either in this batch or the next, never both.
    pub fn drain_all(&self) -> Vec<Vec<u8>> {
        let mut state = self.state.lock();
        let drained: Vec<Vec<u8>> = state.queued.drain(..).collect();
        state.in_flight.extend(drained.iter().cloned());
        drained
    }

    /// The in-flight batch was accepted: forget it and shrink the record.
    pub fn acknowledge(&self) {
        let mut state = self.state.lock();
        let count = state.in_flight.len();
        state.in_flight.clear();
        if state.queued.is_empty() {
            if let Err(e) = self.store.clear_pending(&self.document) {
                warn!("Failed to clear pending record for {}: {e}", self.document);
            }
        } else {
            self.write_through(&state);
        }
        debug!("Acknowledged {count} pending updates for {}", self.document);
    }

    /// The in-flight batch was rejected: queue it again ahead of newer blobs.
    ///
    /// The record on disk already contains these blobs, so nothing is written.
    pub fn restore(&self) {
        let mut state = self.state.lock();
        let in_flight = std::mem::take(&mut state.in_flight);
        for blob in in_flight.into_iter().rev() {
            state.queued.push_front(blob);
        }
    }

    /// Queue blobs recovered from a previous session without re-persisting
    /// them; the record they came from is still on disk.
    pub fn stage_recovered(&self, blobs: Vec<Vec<u8>>) {
        let mut state = self.state.lock();
        for blob in blobs.into_iter().rev() {
            state.queued.push_front(blob);
        }
    }

    /// Write the current unconfirmed set to the store.
    pub fn persist(&self) -> Result<(), SyncError> {
        let state = self.state.lock();
        self.save(&state)
    }

    /// Blobs persisted for this document by any session, oldest first.
    pub fn load_persisted(&self) -> Result<Vec<Vec<u8>>, SyncError> {
        self.store.load_pending(&self.document)
    }

    pub fn clear_persisted(&self) -> Result<(), SyncError> {
        self.store.clear_pending(&self.document)
    }

    // ─── Introspection ────────────────────────────────────────────────

    /// Blobs waiting for the next drain.
    pub fn len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queued.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Bytes across all unconfirmed blobs.
    pub fn total_bytes(&self) -> usize {
        let state = self.state.lock();
        state.in_flight.iter().chain(state.queued.iter()).map(Vec::len).sum()
    }

    pub fn document(&self) -> &DocumentName {
        &self.document
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn save(&self, state: &BufferState) -> Result<(), SyncError> {
        let unconfirmed = state.unconfirmed();
        if unconfirmed.is_empty() {
            self.store.clear_pending(&self.document)
        } else {
            self.store.save_pending(&self.document, &unconfirmed)
        }
    }

    fn write_through(&self, state: &BufferState) {
        if let Err(e) = self.save(state) {
            warn!("Failed to persist pending updates for {}: {e}", self.document);
        }
    }
}
