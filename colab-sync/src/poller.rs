//! Remote update poller.
//!
//! Pulls update-log entries newer than the watermark and merges them into
//! the local replica with the remote origin, so they never reach the pending
//! buffer. Entries this session published itself are skipped.
//!
//! The watermark is the highest `created_at` seen so far. It advances past
//! every entry in a fetched batch, including skipped and failed ones, and
//! never moves backwards. A bad entry is therefore attempted exactly once.

use crate::context::SyncContext;
use crate::doc::ReplicatedDoc;
use crate::error::SyncError;
use crate::protocol::{Timestamp, UpdateEntry};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub applied: usize,
    pub skipped_own: usize,
    pub failed: usize,
}

pub struct Poller {
    ctx: SyncContext,
    doc: Arc<ReplicatedDoc>,
    watermark: parking_lot::Mutex<Option<Timestamp>>,
    in_flight: Mutex<()>,
}

impl Poller {
    pub fn new(ctx: SyncContext, doc: Arc<ReplicatedDoc>) -> Self {
        Self {
            ctx,
            doc,
            watermark: parking_lot::Mutex::new(None),
            in_flight: Mutex::new(()),
        }
    }

    /// Fetch and apply everything published by other sessions since the
    /// last observed entry.
    pub async fn tick(&self) -> Result<PollReport, SyncError> {
        let _guard = self.in_flight.lock().await;
        if !self.ctx.is_connected() {
            return Ok(PollReport::default());
        }

        let since = self.watermark();
        let mut entries = self
            .ctx
            .backend
            .fetch_updates_since(&self.ctx.document, since)
            .await?;

        // Backends that filter with `>=` hand back the watermark entry again.
        if let Some(since) = since {
            entries.retain(|e| e.created_at > since);
        }
        entries.sort_by_key(|e| e.created_at);

        let report = self.apply_batch(&entries);
        if let Some(newest) = entries.last() {
            self.advance_watermark(newest.created_at);
        }

        if report.fetched > 0 {
            debug!(
                "Polled {} for {}: {} applied, {} own, {} failed",
                report.fetched, self.ctx.document, report.applied, report.skipped_own, report.failed
            );
        }
        Ok(report)
    }

    fn apply_batch(&self, entries: &[UpdateEntry]) -> PollReport {
        let counters = self.ctx.counters();
        let mut report = PollReport { fetched: entries.len(), ..PollReport::default() };

        for entry in entries {
            if entry.client_id == self.ctx.client_id {
                report.skipped_own += 1;
                counters.record_own_skipped();
                continue;
            }
            match self.doc.apply_remote(&entry.update) {
                Ok(()) => {
                    report.applied += 1;
                    counters.record_remote_applied();
                }
                Err(e) => {
                    warn!(
                        "Skipping update {} from {} for {}: {e}",
                        entry.id, entry.client_id, self.ctx.document
                    );
                    report.failed += 1;
                    counters.record_failed_apply();
                }
            }
        }
        report
    }

    fn advance_watermark(&self, candidate: Timestamp) {
        let mut watermark = self.watermark.lock();
        if watermark.map_or(true, |current| candidate > current) {
            *watermark = Some(candidate);
        }
    }

    /// `created_at` of the newest entry observed, `None` before the first.
    pub fn watermark(&self) -> Option<Timestamp> {
        *self.watermark.lock()
    }
}
