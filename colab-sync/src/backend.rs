//! The external store a session syncs through.
//!
//! [`SyncBackend`] is the only seam between the sync engine and the outside
//! world: snapshot storage, the shared incremental update log, and presence
//! records. Swapping polling for a push transport means swapping this trait's
//! implementation, nothing else.
//!
//! [`MemoryBackend`] keeps everything in process. It assigns strictly
//! increasing server timestamps, can inject failures and latency per
//! operation, and counts calls, which is what the test suite drives.

use crate::error::SyncError;
use crate::protocol::{
    ClientId, DocumentName, PresenceData, PresenceRecord, Snapshot, Timestamp, UpdateEntry,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Storage operations a sync session needs from the shared store.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Latest full snapshot of `document`, if one was ever written.
    async fn fetch_snapshot(&self, document: &DocumentName) -> Result<Option<Snapshot>, SyncError>;

    /// Overwrite the snapshot of `document` (latest wins).
    async fn write_snapshot(&self, document: &DocumentName, state: Vec<u8>) -> Result<(), SyncError>;

    /// Update-log entries created after `since` (all entries for `None`).
    async fn fetch_updates_since(
        &self,
        document: &DocumentName,
        since: Option<Timestamp>,
    ) -> Result<Vec<UpdateEntry>, SyncError>;

    /// Append one update blob to the log, tagged with the publishing session.
    async fn append_update(
        &self,
        document: &DocumentName,
        update: Vec<u8>,
        client_id: &ClientId,
    ) -> Result<(), SyncError>;

    /// Insert or replace the presence record of `client_id`.
    async fn write_presence(
        &self,
        document: &DocumentName,
        client_id: &ClientId,
        data: PresenceData,
    ) -> Result<(), SyncError>;

    async fn remove_presence(&self, document: &DocumentName, client_id: &ClientId) -> Result<(), SyncError>;

    /// Every presence record of `document`, stale ones included.
    async fn fetch_presence(&self, document: &DocumentName) -> Result<Vec<PresenceRecord>, SyncError>;
}

/// Backend operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    FetchSnapshot,
    WriteSnapshot,
    FetchUpdates,
    AppendUpdate,
    WritePresence,
    RemovePresence,
    FetchPresence,
}

#[derive(Default)]
struct DocumentRecords {
    snapshot: Option<Snapshot>,
    log: Vec<UpdateEntry>,
    presence: HashMap<ClientId, PresenceRecord>,
}

#[derive(Default)]
struct BackendState {
    documents: HashMap<DocumentName, DocumentRecords>,
    next_entry_id: u64,
    last_timestamp: Timestamp,
    failing: HashSet<BackendOp>,
    calls: HashMap<BackendOp, usize>,
}

impl BackendState {
    /// Server clock: wall time, bumped so no two writes share a timestamp.
    fn tick(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let next = if now > self.last_timestamp {
            now
        } else {
            Timestamp::from_millis(self.last_timestamp.as_millis() + 1)
        };
        self.last_timestamp = next;
        next
    }
}

/// In-process [`SyncBackend`].
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    latency: Mutex<Option<Duration>>,
    /// Fetch with `created_at >= since` instead of `>`.
    inclusive_fetch: Mutex<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Test controls ────────────────────────────────────────────────

    /// Make `op` fail with a backend error until [`recover`](Self::recover).
    pub fn fail(&self, op: BackendOp) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: BackendOp) {
        self.state.lock().failing.remove(&op);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Return entries at the watermark again, like a `>=` query would.
    pub fn set_inclusive_fetch(&self, inclusive: bool) {
        *self.inclusive_fetch.lock() = inclusive;
    }

    /// Append an entry with a caller-chosen timestamp and client id.
    pub fn insert_entry(
        &self,
        document: &DocumentName,
        update: Vec<u8>,
        client_id: ClientId,
        created_at: Timestamp,
    ) {
        let mut state = self.state.lock();
        let id = state.next_entry_id;
        state.next_entry_id += 1;
        if created_at > state.last_timestamp {
            state.last_timestamp = created_at;
        }
        state
            .documents
            .entry(document.clone())
            .or_default()
            .log
            .push(UpdateEntry { id, update, created_at, client_id });
    }

    /// Add a presence record with an explicit `last_seen`.
    pub fn insert_presence(&self, document: &DocumentName, record: PresenceRecord) {
        self.state
            .lock()
            .documents
            .entry(document.clone())
            .or_default()
            .presence
            .insert(record.client_id.clone(), record);
    }

    // ─── Inspection ───────────────────────────────────────────────────

    pub fn entries(&self, document: &DocumentName) -> Vec<UpdateEntry> {
        self.state
            .lock()
            .documents
            .get(document)
            .map(|d| d.log.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, document: &DocumentName) -> Option<Snapshot> {
        self.state.lock().documents.get(document).and_then(|d| d.snapshot.clone())
    }

    pub fn presence(&self, document: &DocumentName, client_id: &ClientId) -> Option<PresenceRecord> {
        self.state
            .lock()
            .documents
            .get(document)
            .and_then(|d| d.presence.get(client_id).cloned())
    }

    pub fn call_count(&self, op: BackendOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Count the call, wait out the latency, then check for an injected failure.
    async fn enter(&self, op: BackendOp) -> Result<(), SyncError> {
        *self.state.lock().calls.entry(op).or_insert(0) += 1;
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.state.lock().failing.contains(&op) {
            return Err(SyncError::Backend(format!("{op:?} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn fetch_snapshot(&self, document: &DocumentName) -> Result<Option<Snapshot>, SyncError> {
        self.enter(BackendOp::FetchSnapshot).await?;
        Ok(self.snapshot(document))
    }

    async fn write_snapshot(&self, document: &DocumentName, state: Vec<u8>) -> Result<(), SyncError> {
        self.enter(BackendOp::WriteSnapshot).await?;
        let mut guard = self.state.lock();
        let updated_at = guard.tick();
        guard.documents.entry(document.clone()).or_default().snapshot =
            Some(Snapshot { state, updated_at });
        Ok(())
    }

    async fn fetch_updates_since(
        &self,
        document: &DocumentName,
        since: Option<Timestamp>,
    ) -> Result<Vec<UpdateEntry>, SyncError> {
        self.enter(BackendOp::FetchUpdates).await?;
        let inclusive = *self.inclusive_fetch.lock();
        let state = self.state.lock();
        let Some(records) = state.documents.get(document) else {
            return Ok(Vec::new());
        };
        let entries = records
            .log
            .iter()
            .filter(|e| match since {
                None => true,
                Some(t) if inclusive => e.created_at >= t,
                Some(t) => e.created_at > t,
            })
            .cloned()
            .collect();
        Ok(entries)
    }

    async fn append_update(
        &self,
        document: &DocumentName,
        update: Vec<u8>,
        client_id: &ClientId,
    ) -> Result<(), SyncError> {
        self.enter(BackendOp::AppendUpdate).await?;
        let mut state = self.state.lock();
        let created_at = state.tick();
        let id = state.next_entry_id;
        state.next_entry_id += 1;
        state.documents.entry(document.clone()).or_default().log.push(UpdateEntry {
            id,
            update,
            created_at,
            client_id: client_id.clone(),
        });
        Ok(())
    }

    async fn write_presence(
        &self,
        document: &DocumentName,
        client_id: &ClientId,
        data: PresenceData,
    ) -> Result<(), SyncError> {
        self.enter(BackendOp::WritePresence).await?;
        let mut state = self.state.lock();
        let last_seen = state.tick();
        state.documents.entry(document.clone()).or_default().presence.insert(
            client_id.clone(),
            PresenceRecord { client_id: client_id.clone(), data, last_seen },
        );
        Ok(())
    }

    async fn remove_presence(&self, document: &DocumentName, client_id: &ClientId) -> Result<(), SyncError> {
        self.enter(BackendOp::RemovePresence).await?;
        if let Some(records) = self.state.lock().documents.get_mut(document) {
            records.presence.remove(client_id);
        }
        Ok(())
    }

    async fn fetch_presence(&self, document: &DocumentName) -> Result<Vec<PresenceRecord>, SyncError> {
        self.enter(BackendOp::FetchPresence).await?;
        Ok(self
            .state
            .lock()
            .documents
            .get(document)
            .map(|d| d.presence.values().cloned().collect())
            .unwrap_or_default())
    }
}
