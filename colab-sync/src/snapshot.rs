//! Periodic full-state snapshots.
//!
//! New sessions start from the snapshot instead of replaying the whole update
//! log. Every tick overwrites the stored snapshot with this replica's full
//! state; concurrent writers simply race and the latest write wins, which is
//! safe because any replica's state merges cleanly with the log.

use crate::context::SyncContext;
use crate::doc::ReplicatedDoc;
use crate::error::SyncError;
use log::debug;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct SnapshotManager {
    ctx: SyncContext,
    doc: Arc<ReplicatedDoc>,
    in_flight: Mutex<()>,
}

impl SnapshotManager {
    pub fn new(ctx: SyncContext, doc: Arc<ReplicatedDoc>) -> Self {
        Self { ctx, doc, in_flight: Mutex::new(()) }
    }

    /// Write the current full state. Returns `false` when not connected.
    pub async fn tick(&self) -> Result<bool, SyncError> {
        let _guard = self.in_flight.lock().await;
        if !self.ctx.is_connected() {
            return Ok(false);
        }

        let state = self.doc.encode_full_state();
        let bytes = state.len();
        self.ctx.backend.write_snapshot(&self.ctx.document, state).await?;
        self.ctx.counters().record_snapshot();
        debug!("Saved snapshot of {} ({bytes} bytes)", self.ctx.document);
        Ok(true)
    }
}
