//! Multi-session sync tests against the in-memory backend.
//!
//! Verifies:
//! - Concurrent edits from several sessions converge
//! - Remote updates are never re-published
//! - A session skips its own log entries but still advances its watermark
//! - The watermark never regresses, even across undecodable entries
//! - Background loops deliver edits without manual ticks
//! - Overlapping publishes queue behind each other and `leave` waits for them

use colab_sync::{
    BackendOp, ClientId, ClientIdentity, DocumentName, MemoryBackend, MemoryPendingStore,
    PublishReport, ReplicatedDoc, SessionController, SessionHandle, SyncBackend, SyncConfig,
    Timestamp,
};
use std::sync::Arc;
use std::time::Duration;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Loops effectively off: every tick in these tests is driven by hand.
fn manual_config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_secs(3_600),
        publish_interval: Duration::from_secs(3_600),
        snapshot_interval: Duration::from_secs(3_600),
        ..SyncConfig::for_testing()
    }
}

struct Cluster {
    backend: Arc<MemoryBackend>,
    controller: SessionController,
}

impl Cluster {
    fn new(config: SyncConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let controller =
            SessionController::new(backend.clone(), Arc::new(MemoryPendingStore::new()), config);
        Self { backend, controller }
    }

    async fn join(&self, document: &str) -> SessionHandle {
        self.controller
            .join(document, ClientIdentity::anonymous())
            .await
            .unwrap()
    }
}

fn text_blob(text: &str) -> Vec<u8> {
    let doc = ReplicatedDoc::new();
    doc.push_text(text);
    doc.encode_full_state()
}

async fn sync_all(sessions: &[&SessionHandle]) {
    for s in sessions {
        s.sync_now().await.unwrap();
    }
    for s in sessions {
        s.poll_now().await.unwrap();
    }
}

// ─── Convergence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_clients_concurrent_insert_converge() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    let b = cluster.join("deal-42").await;

    a.doc().insert_text(0, "A");
    b.doc().insert_text(0, "B");
    sync_all(&[&a, &b]).await;

    assert_eq!(a.doc().text(), b.doc().text());
    assert_eq!(a.doc().text_len(), 2);
    assert!(a.doc().converged_with(b.doc()));

    a.leave().await;
    b.leave().await;
}

#[tokio::test]
async fn test_three_clients_interleaved_converge() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    let b = cluster.join("deal-42").await;
    let c = cluster.join("deal-42").await;

    a.doc().push_text("alpha ");
    b.doc().push_text("beta ");
    a.sync_now().await.unwrap();
    c.poll_now().await.unwrap();
    c.doc().insert_text(0, "gamma ");
    b.sync_now().await.unwrap();
    c.sync_now().await.unwrap();
    a.doc().push_text("again");
    a.sync_now().await.unwrap();

    // Poll in a different order than the publishes happened.
    c.poll_now().await.unwrap();
    a.poll_now().await.unwrap();
    b.poll_now().await.unwrap();

    assert!(a.doc().converged_with(b.doc()));
    assert!(b.doc().converged_with(c.doc()));
    for word in ["alpha", "beta", "gamma", "again"] {
        assert!(a.doc().text().contains(word), "missing {word}");
    }

    for s in [a, b, c] {
        s.leave().await;
    }
}

#[tokio::test]
async fn test_late_joiner_catches_up_from_snapshot_and_log() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    a.doc().push_text("before snapshot");
    a.sync_now().await.unwrap();
    a.save_now().await.unwrap();
    a.doc().push_text(", after snapshot");
    a.sync_now().await.unwrap();

    let late = cluster.join("deal-42").await;
    assert_eq!(late.doc().text(), "before snapshot");
    late.poll_now().await.unwrap();
    assert_eq!(late.doc().text(), "before snapshot, after snapshot");
    assert!(late.doc().converged_with(a.doc()));

    a.leave().await;
    late.leave().await;
}

#[tokio::test]
async fn test_documents_isolated() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-1").await;
    let b = cluster.join("deal-2").await;

    a.doc().push_text("only in deal-1");
    sync_all(&[&a, &b]).await;

    assert_eq!(b.doc().text(), "");
    a.leave().await;
    b.leave().await;
}

// ─── Echo suppression ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_remote_updates_not_republished() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    let b = cluster.join("deal-42").await;

    a.doc().push_text("hello");
    a.sync_now().await.unwrap();
    b.poll_now().await.unwrap();

    assert_eq!(b.doc().text(), "hello");
    assert_eq!(b.pending_updates(), 0);
    assert_eq!(b.sync_now().await.unwrap(), PublishReport::Idle);

    let document = DocumentName::new("deal-42");
    let entries = cluster.backend.entries(&document);
    assert_eq!(entries.len(), 1);
    assert_eq!(&entries[0].client_id, a.client_id());

    // Several more rounds stay quiet.
    for _ in 0..3 {
        sync_all(&[&a, &b]).await;
    }
    assert_eq!(cluster.backend.entries(&document).len(), 1);

    a.leave().await;
    b.leave().await;
}

#[tokio::test]
async fn test_own_update_skipped_watermark_advances() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;

    a.doc().push_text("X");
    a.sync_now().await.unwrap();
    let report = a.poll_now().await.unwrap();

    assert_eq!(report.skipped_own, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(a.doc().text(), "X");
    let entry = &cluster.backend.entries(&DocumentName::new("deal-42"))[0];
    assert_eq!(a.watermark(), Some(entry.created_at));
    assert_eq!(a.stats().own_skipped, 1);

    a.leave().await;
}

// ─── Watermark ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_watermark_monotonic_across_bad_entries() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    let document = DocumentName::new("deal-42");
    let other = ClientId::from_string("other-session");

    let base = Timestamp::now().as_millis() + 10_000;
    cluster.backend.insert_entry(&document, vec![0xFF, 0xFF, 0xFF], other.clone(), Timestamp::from_millis(base));
    cluster.backend.insert_entry(&document, text_blob("good"), other.clone(), Timestamp::from_millis(base + 5));

    let report = a.poll_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(a.watermark(), Some(Timestamp::from_millis(base + 5)));

    // An entry stamped before the watermark is never fetched.
    cluster.backend.insert_entry(&document, text_blob("late"), other, Timestamp::from_millis(base + 1));
    let report = a.poll_now().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(a.watermark(), Some(Timestamp::from_millis(base + 5)));
    assert_eq!(a.doc().text(), "good");
    assert_eq!(a.stats().failed_applies, 1);

    a.leave().await;
}

#[tokio::test]
async fn test_poll_failure_retried_next_tick() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    let b = cluster.join("deal-42").await;

    a.doc().push_text("eventually");
    a.sync_now().await.unwrap();

    cluster.backend.fail(BackendOp::FetchUpdates);
    assert!(b.poll_now().await.is_err());
    assert_eq!(b.watermark(), None);

    cluster.backend.recover(BackendOp::FetchUpdates);
    b.poll_now().await.unwrap();
    assert_eq!(b.doc().text(), "eventually");

    a.leave().await;
    b.leave().await;
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    let document = DocumentName::new("deal-42");
    let blob = text_blob("once");

    cluster.backend.append_update(&document, blob.clone(), &ClientId::from_string("x")).await.unwrap();
    cluster.backend.append_update(&document, blob, &ClientId::from_string("y")).await.unwrap();
    a.poll_now().await.unwrap();

    assert_eq!(a.doc().text(), "once");
    assert_eq!(a.stats().remote_applied, 2);
    a.leave().await;
}

// ─── Background loops ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_background_loops_deliver_edits() {
    let cluster = Cluster::new(SyncConfig::for_testing());
    let a = cluster.join("deal-42").await;
    let b = cluster.join("deal-42").await;

    a.doc().push_text("typed in A");
    b.doc().push_text("typed in B");
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(a.doc().converged_with(b.doc()));
    assert!(a.doc().text().contains("typed in A"));
    assert!(a.doc().text().contains("typed in B"));
    assert!(cluster.backend.snapshot(&DocumentName::new("deal-42")).is_some());

    a.leave().await;
    b.leave().await;
}

#[tokio::test(start_paused = true)]
async fn test_publish_retries_after_outage() {
    let cluster = Cluster::new(SyncConfig::for_testing());
    let a = cluster.join("deal-42").await;
    cluster.backend.fail(BackendOp::AppendUpdate);

    a.doc().push_text("offline edit");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.pending_updates(), 1);

    cluster.backend.recover(BackendOp::AppendUpdate);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.pending_updates(), 0);
    assert_eq!(cluster.backend.entries(&DocumentName::new("deal-42")).len(), 1);

    a.leave().await;
}

// ─── Concurrency ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_overlapping_publishes_make_one_append() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    cluster.backend.set_latency(Some(Duration::from_millis(100)));

    a.doc().push_text("once");
    let (first, second, syncing) = tokio::join!(a.sync_now(), a.sync_now(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.is_syncing()
    });

    assert!(syncing);
    assert!(matches!(first.unwrap(), PublishReport::Published { blobs: 1, .. }));
    assert_eq!(second.unwrap(), PublishReport::Idle);
    assert_eq!(cluster.backend.call_count(BackendOp::AppendUpdate), 1);
    assert!(!a.is_syncing());
    assert_eq!(a.pending_updates(), 0);

    a.leave().await;
}

#[tokio::test(start_paused = true)]
async fn test_edit_during_publish_goes_out_next() {
    let cluster = Cluster::new(manual_config());
    let a = cluster.join("deal-42").await;
    cluster.backend.set_latency(Some(Duration::from_millis(100)));

    a.doc().push_text("first");
    let (first, second) = tokio::join!(a.sync_now(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.doc().push_text(" second");
        a.sync_now().await
    });

    assert!(matches!(first.unwrap(), PublishReport::Published { blobs: 1, .. }));
    assert!(matches!(second.unwrap(), PublishReport::Published { blobs: 1, .. }));

    let entries = cluster.backend.entries(&DocumentName::new("deal-42"));
    assert_eq!(entries.len(), 2);
    let replica = ReplicatedDoc::new();
    for entry in &entries {
        replica.apply_remote(&entry.update).unwrap();
    }
    assert_eq!(replica.text(), "first second");

    a.leave().await;
}

#[tokio::test(start_paused = true)]
async fn test_leave_waits_for_inflight_publish() {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(MemoryPendingStore::new());
    let config = SyncConfig {
        poll_interval: Duration::from_secs(3_600),
        snapshot_interval: Duration::from_secs(3_600),
        ..SyncConfig::for_testing()
    };
    let controller = SessionController::new(backend.clone(), store.clone(), config);
    let a = controller.join("deal-42", ClientIdentity::anonymous()).await.unwrap();
    let document = a.document_name().clone();
    backend.set_latency(Some(Duration::from_millis(200)));

    a.doc().push_text("last words");
    // The publish loop ticks at 50ms and is still waiting on the store.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(a.is_syncing());
    assert!(backend.entries(&document).is_empty());

    a.leave().await;

    let entries = backend.entries(&document);
    assert_eq!(entries.len(), 1);
    assert_eq!(backend.call_count(BackendOp::AppendUpdate), 1);
    assert!(!store.contains(&document));
}
