//! Session lifecycle: join, steady-state loops, leave.
//!
//! ```text
//! join ──► ReplicatedDoc ──on_local_change──► PendingBuffer ──► PendingStore
//!   │           ▲                                  │
//!   │ snapshot  │ apply_remote                     │ drain_all
//!   │ recovered │                                  ▼
//!   │        Poller  (poll_interval)           Publisher (publish_interval)
//!   │           ▲                                  │
//!   │           └──── SyncBackend (shared log) ◄───┘
//!   │
//!   └──► SnapshotManager (snapshot_interval), PresenceTracker (heartbeat)
//! ```
//!
//! Each loop is its own tokio task. `leave` stops them, waits for any tick
//! still running, then flushes once more and withdraws presence.

use crate::backend::SyncBackend;
use crate::buffer::PendingBuffer;
use crate::context::{SessionStats, SyncContext};
use crate::doc::ReplicatedDoc;
use crate::error::SyncError;
use crate::poller::{PollReport, Poller};
use crate::presence::PresenceTracker;
use crate::protocol::{ClientId, ClientIdentity, CursorRange, DocumentName, PresenceRecord, Timestamp};
use crate::publisher::{PublishReport, Publisher};
use crate::snapshot::SnapshotManager;
use crate::storage::PendingStore;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often to fetch remote updates. Default: 2s.
    pub poll_interval: Duration,
    /// How often to publish buffered local updates. Default: 2s.
    pub publish_interval: Duration,
    /// How often to overwrite the stored snapshot. Default: 30s.
    pub snapshot_interval: Duration,
    /// Minimum spacing between cursor writes. Default: 16ms.
    pub presence_min_interval: Duration,
    /// Re-send presence this often so peers keep seeing us. Default: 10s.
    pub presence_heartbeat: Option<Duration>,
    /// Presence records older than this are not reported as peers. Default: 30s.
    pub presence_liveness: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2_000),
            publish_interval: Duration::from_millis(2_000),
            snapshot_interval: Duration::from_millis(30_000),
            presence_min_interval: Duration::from_millis(16),
            presence_heartbeat: Some(Duration::from_secs(10)),
            presence_liveness: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Short intervals, no heartbeat.
    pub fn for_testing() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            publish_interval: Duration::from_millis(50),
            snapshot_interval: Duration::from_millis(500),
            presence_min_interval: Duration::ZERO,
            presence_heartbeat: None,
            presence_liveness: Duration::from_secs(30),
        }
    }
}

/// Opens sync sessions against one backend and one local pending store.
pub struct SessionController {
    backend: Arc<dyn SyncBackend>,
    pending_store: Arc<dyn PendingStore>,
    config: SyncConfig,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        pending_store: Arc<dyn PendingStore>,
        config: SyncConfig,
    ) -> Self {
        Self { backend, pending_store, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Open a session on `document`.
    ///
    /// Loads the latest snapshot and any updates a previous session on this
    /// machine left unpublished, then starts the background loops. Backend
    /// failures here are logged; the session starts with whatever state could
    /// be recovered.
    pub async fn join(
        &self,
        document: impl Into<DocumentName>,
        identity: ClientIdentity,
    ) -> Result<SessionHandle, SyncError> {
        let document = document.into();
        let ctx = SyncContext::new(document.clone(), ClientId::generate(), Arc::clone(&self.backend));

        let doc = Arc::new(ReplicatedDoc::new());
        let buffer = Arc::new(PendingBuffer::new(document.clone(), Arc::clone(&self.pending_store)));
        let sink = Arc::clone(&buffer);
        doc.on_local_change(move |blob| sink.enqueue(blob.to_vec()))?;

        self.load_snapshot(&ctx, &doc).await;
        self.recover_pending(&document, &doc, &buffer);

        ctx.set_connected(true);

        let publisher = Arc::new(Publisher::new(ctx.clone(), Arc::clone(&buffer)));
        let poller = Arc::new(Poller::new(ctx.clone(), Arc::clone(&doc)));
        let snapshots = Arc::new(SnapshotManager::new(ctx.clone(), Arc::clone(&doc)));
        let presence = Arc::new(PresenceTracker::new(
            ctx.clone(),
            identity,
            self.config.presence_min_interval,
            self.config.presence_liveness,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(4);

        let p = Arc::clone(&poller);
        tasks.push(spawn_loop("poll", self.config.poll_interval, shutdown_rx.clone(), move || {
            let p = Arc::clone(&p);
            async move {
                if let Err(e) = p.tick().await {
                    warn!("Poll failed: {e}");
                }
            }
        }));

        let p = Arc::clone(&publisher);
        tasks.push(spawn_loop("publish", self.config.publish_interval, shutdown_rx.clone(), move || {
            let p = Arc::clone(&p);
            async move {
                if let Err(e) = p.tick().await {
                    warn!("Publish failed, will retry: {e}");
                }
            }
        }));

        let s = Arc::clone(&snapshots);
        tasks.push(spawn_loop("snapshot", self.config.snapshot_interval, shutdown_rx.clone(), move || {
            let s = Arc::clone(&s);
            async move {
                if let Err(e) = s.tick().await {
                    warn!("Snapshot failed, will retry: {e}");
                }
            }
        }));

        if let Some(heartbeat) = self.config.presence_heartbeat {
            let p = Arc::clone(&presence);
            tasks.push(spawn_loop("presence", heartbeat, shutdown_rx, move || {
                let p = Arc::clone(&p);
                async move { p.refresh().await }
            }));
        }

        presence.update(None).await;

        info!("Joined {} as {}", document, ctx.client_id);
        Ok(SessionHandle {
            ctx,
            doc,
            buffer,
            publisher,
            poller,
            snapshots,
            presence,
            shutdown,
            tasks,
            cursor_flush: parking_lot::Mutex::new(None),
        })
    }

    /// Close a session; see [`SessionHandle::leave`].
    pub async fn leave(&self, handle: SessionHandle) {
        handle.leave().await;
    }

    async fn load_snapshot(&self, ctx: &SyncContext, doc: &ReplicatedDoc) {
        match ctx.backend.fetch_snapshot(&ctx.document).await {
            Ok(Some(snapshot)) if !snapshot.is_empty() => match doc.apply_remote(&snapshot.state) {
                Ok(()) => debug!(
                    "Loaded snapshot of {} ({} bytes)",
                    ctx.document,
                    snapshot.state.len()
                ),
                Err(e) => warn!("Ignoring unreadable snapshot of {}: {e}", ctx.document),
            },
            Ok(_) => debug!("No snapshot for {}", ctx.document),
            Err(e) => warn!("Failed to fetch snapshot of {}: {e}", ctx.document),
        }
    }

    /// Re-stage what a previous session left unpublished and show it locally.
    fn recover_pending(&self, document: &DocumentName, doc: &ReplicatedDoc, buffer: &PendingBuffer) {
        let blobs = match buffer.load_persisted() {
            Ok(blobs) => blobs,
            Err(e @ SyncError::Corrupted { .. }) => {
                error!("{e}; discarding it");
                if let Err(e) = buffer.clear_persisted() {
                    warn!("Failed to discard corrupted pending record: {e}");
                }
                return;
            }
            Err(e) => {
                warn!("Failed to load pending updates for {document}: {e}");
                return;
            }
        };
        if blobs.is_empty() {
            return;
        }

        for blob in &blobs {
            if let Err(e) = doc.apply_remote(blob) {
                warn!("Recovered update for {document} does not apply: {e}");
            }
        }
        info!("Recovered {} pending updates for {document}", blobs.len());
        buffer.stage_recovered(blobs);
    }
}

/// A joined document. Dropping it stops the loops without the final flush;
/// call [`leave`](Self::leave) for a clean exit.
pub struct SessionHandle {
    ctx: SyncContext,
    doc: Arc<ReplicatedDoc>,
    buffer: Arc<PendingBuffer>,
    publisher: Arc<Publisher>,
    poller: Arc<Poller>,
    snapshots: Arc<SnapshotManager>,
    presence: Arc<PresenceTracker>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    /// Trailing write for a throttled cursor.
    cursor_flush: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Stop the loops, flush pending updates and a final snapshot, then
    /// withdraw presence. Failures are logged; pending updates that could not
    /// be published stay in the local store for the next session.
    pub async fn leave(self) {
        let pending_flush = self.cursor_flush.lock().take();
        if let Some(task) = pending_flush {
            task.abort();
            let _ = task.await;
        }
        let _ = self.shutdown.send(true);
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!("Sync loop for {} ended abnormally: {e}", self.ctx.document);
            }
        }

        if let Err(e) = self.publisher.tick().await {
            warn!("Final publish for {} failed, kept locally: {e}", self.ctx.document);
        }
        if let Err(e) = self.snapshots.tick().await {
            warn!("Final snapshot for {} failed: {e}", self.ctx.document);
        }
        self.presence.remove().await;

        self.ctx.set_connected(false);
        self.doc.clear_observers();
        info!("Left {} as {}", self.ctx.document, self.ctx.client_id);
    }

    /// Publish buffered local updates now.
    pub async fn sync_now(&self) -> Result<PublishReport, SyncError> {
        self.publisher.tick().await
    }

    /// Fetch and apply remote updates now.
    pub async fn poll_now(&self) -> Result<PollReport, SyncError> {
        self.poller.tick().await
    }

    /// Write a snapshot now.
    pub async fn save_now(&self) -> Result<bool, SyncError> {
        self.snapshots.tick().await
    }

    /// Publish the local cursor (rate-limited).
    ///
    /// Returns `false` when the write was throttled; the latest cursor then
    /// goes out once the rate limit allows it.
    pub async fn update_cursor(&self, cursor: Option<CursorRange>) -> bool {
        if self.presence.update(cursor).await {
            return true;
        }
        self.schedule_cursor_flush();
        false
    }

    /// Other live sessions in this document.
    pub async fn peers(&self) -> Vec<PresenceRecord> {
        self.presence.peers().await
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    /// Whether a publish is in flight.
    pub fn is_syncing(&self) -> bool {
        self.publisher.is_publishing()
    }

    pub fn client_id(&self) -> &ClientId {
        &self.ctx.client_id
    }

    pub fn document_name(&self) -> &DocumentName {
        &self.ctx.document
    }

    pub fn doc(&self) -> &Arc<ReplicatedDoc> {
        &self.doc
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Local updates not yet acknowledged by the shared log.
    pub fn pending_updates(&self) -> usize {
        self.buffer.len() + self.buffer.in_flight_len()
    }

    pub fn watermark(&self) -> Option<Timestamp> {
        self.poller.watermark()
    }

    pub fn stats(&self) -> SessionStats {
        self.ctx.counters().snapshot()
    }

    fn schedule_cursor_flush(&self) {
        let Some(mut wait) = self.presence.retry_after() else {
            return;
        };
        let mut slot = self.cursor_flush.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let presence = Arc::clone(&self.presence);
        let ctx = self.ctx.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(wait).await;
                presence.flush().await;
                match presence.retry_after() {
                    Some(next) if ctx.is_connected() => wait = next.max(Duration::from_millis(1)),
                    _ => break,
                }
            }
        }));
    }
}

/// Run `tick` every `period`, first one `period` from now, until `shutdown`
/// fires or its sender is dropped.
///
/// A tick that has started always runs to completion.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!("{name} loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOp, MemoryBackend};
    use crate::storage::MemoryPendingStore;

    fn controller() -> (Arc<MemoryBackend>, Arc<MemoryPendingStore>, SessionController) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(MemoryPendingStore::new());
        let controller = SessionController::new(backend.clone(), store.clone(), SyncConfig::for_testing());
        (backend, store, controller)
    }

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(2_000));
        assert_eq!(config.publish_interval, Duration::from_millis(2_000));
        assert_eq!(config.snapshot_interval, Duration::from_millis(30_000));
        assert_eq!(config.presence_min_interval, Duration::from_millis(16));
    }

    #[tokio::test]
    async fn test_join_loads_snapshot() {
        let (backend, _store, controller) = controller();
        let source = ReplicatedDoc::new();
        source.push_text("from snapshot");
        let document = DocumentName::new("deal-42");
        backend.write_snapshot(&document, source.encode_full_state()).await.unwrap();

        let session = controller.join(document, ClientIdentity::anonymous()).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(session.doc().text(), "from snapshot");
        // Snapshot content is remote: nothing to publish.
        assert_eq!(session.pending_updates(), 0);
        session.leave().await;
    }

    #[tokio::test]
    async fn test_join_survives_snapshot_failure() {
        let (backend, _store, controller) = controller();
        backend.fail(BackendOp::FetchSnapshot);
        let session = controller.join("deal-42", ClientIdentity::anonymous()).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(session.doc().text(), "");
        session.leave().await;
    }

    #[tokio::test]
    async fn test_join_writes_initial_presence() {
        let (backend, _store, controller) = controller();
        let session = controller
            .join("deal-42", ClientIdentity::user("user-1", "Alice"))
            .await
            .unwrap();
        let record = backend.presence(session.document_name(), session.client_id()).unwrap();
        assert_eq!(record.data.cursor, None);
        assert_eq!(record.data.display_name.as_deref(), Some("Alice"));
        session.leave().await;
    }

    #[tokio::test]
    async fn test_leave_flushes_and_disconnects() {
        let (backend, store, controller) = controller();
        let session = controller.join("deal-42", ClientIdentity::anonymous()).await.unwrap();
        let document = session.document_name().clone();
        let client_id = session.client_id().clone();
        session.doc().push_text("last words");

        controller.leave(session).await;

        let entries = backend.entries(&document);
        assert!(entries.iter().any(|e| e.client_id == client_id));
        assert!(backend.snapshot(&document).is_some());
        assert!(backend.presence(&document, &client_id).is_none());
        assert!(!store.contains(&document));
    }

    #[tokio::test]
    async fn test_corrupted_pending_record_discarded() {
        let (_backend, store, controller) = controller();
        let document = DocumentName::new("deal-42");
        store.put_raw(&document, vec![0xBA, 0xD0]);

        let session = controller.join(document.clone(), ClientIdentity::anonymous()).await.unwrap();
        assert_eq!(session.pending_updates(), 0);
        assert!(!store.contains(&document));
        session.leave().await;
    }

    #[tokio::test]
    async fn test_client_ids_unique_per_join() {
        let (_backend, _store, controller) = controller();
        let a = controller.join("deal-42", ClientIdentity::anonymous()).await.unwrap();
        let b = controller.join("deal-42", ClientIdentity::anonymous()).await.unwrap();
        assert_ne!(a.client_id(), b.client_id());
        a.leave().await;
        b.leave().await;
    }
}
