//! Presence / awareness: who else is in the document and where their cursor is.
//!
//! ```text
//! editor cursor move
//!       │
//!       ▼
//! PresenceTracker::update(Some(range))   (rate-limited, 16ms default)
//!       │
//!       ▼
//! SyncBackend::write_presence(doc, client_id, data)
//!       │
//!       ▼   (other sessions)
//! PresenceTracker::peers()   (drops self and records older than the liveness window)
//! ```
//!
//! Presence is best effort. Nothing here returns an error: failed writes are
//! logged and dropped, a failed read yields no peers.

use crate::context::SyncContext;
use crate::protocol::{ClientIdentity, CursorRange, PresenceData, PresenceRecord, Timestamp};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Palette for user colours.
pub const USER_COLORS: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7",
    "#DDA0DD", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E9",
];

/// Stable palette colour for a user id.
///
/// Same hash as the web editor (`h = h * 31 + code_unit` over UTF-16, 32-bit
/// wrapping), so a user keeps their colour across clients.
pub fn color_for_user(user_id: &str) -> &'static str {
    let hash = user_id
        .encode_utf16()
        .fold(0i32, |h, unit| (h << 5).wrapping_sub(h).wrapping_add(unit as i32));
    USER_COLORS[(hash.unsigned_abs() as usize) % USER_COLORS.len()]
}

#[derive(Default)]
struct LocalPresence {
    last_write: Option<Instant>,
    /// Latest cursor handed to `update`, sent or not.
    cursor: Option<CursorRange>,
    /// `cursor` was throttled and has not reached the store yet.
    unsent: bool,
}

/// Publishes this session's cursor and reads everyone else's.
pub struct PresenceTracker {
    ctx: SyncContext,
    identity: ClientIdentity,
    min_interval: Duration,
    liveness: Duration,
    local: Mutex<LocalPresence>,
}

impl PresenceTracker {
    pub fn new(
        ctx: SyncContext,
        identity: ClientIdentity,
        min_interval: Duration,
        liveness: Duration,
    ) -> Self {
        Self {
            ctx,
            identity,
            min_interval,
            liveness,
            local: Mutex::new(LocalPresence::default()),
        }
    }

    /// Publish the local cursor. `None` means "present, no active position".
    ///
    /// Returns `false` when the call was throttled (or the session is not
    /// connected) and nothing was written. A throttled cursor is still kept
    /// as the latest one: [`flush`](Self::flush) and [`refresh`](Self::refresh)
    /// send it later.
    pub async fn update(&self, cursor: Option<CursorRange>) -> bool {
        if !self.ctx.is_connected() {
            return false;
        }
        {
            let mut local = self.local.lock();
            local.cursor = cursor;
            let now = Instant::now();
            if let Some(last) = local.last_write {
                if now.duration_since(last) < self.min_interval {
                    local.unsent = true;
                    return false;
                }
            }
            local.last_write = Some(now);
            local.unsent = false;
        }
        self.write(cursor).await;
        true
    }

    /// Time left before a throttled cursor may be sent, or `None` when
    /// nothing is waiting.
    pub fn retry_after(&self) -> Option<Duration> {
        let local = self.local.lock();
        if !local.unsent {
            return None;
        }
        let elapsed = local.last_write.map_or(self.min_interval, |last| last.elapsed());
        Some(self.min_interval.saturating_sub(elapsed))
    }

    /// Send the latest throttled cursor if the rate limit allows it now.
    ///
    /// Returns `true` when a write was made.
    pub async fn flush(&self) -> bool {
        if !self.ctx.is_connected() {
            return false;
        }
        let cursor = {
            let mut local = self.local.lock();
            if !local.unsent {
                return false;
            }
            let now = Instant::now();
            if let Some(last) = local.last_write {
                if now.duration_since(last) < self.min_interval {
                    return false;
                }
            }
            local.last_write = Some(now);
            local.unsent = false;
            local.cursor
        };
        self.write(cursor).await;
        true
    }

    /// Re-send the latest cursor regardless of the rate limit (heartbeat).
    pub async fn refresh(&self) {
        if !self.ctx.is_connected() {
            return;
        }
        let cursor = {
            let mut local = self.local.lock();
            local.last_write = Some(Instant::now());
            local.unsent = false;
            local.cursor
        };
        self.write(cursor).await;
    }

    /// Delete this session's presence record.
    pub async fn remove(&self) {
        match self
            .ctx
            .backend
            .remove_presence(&self.ctx.document, &self.ctx.client_id)
            .await
        {
            Ok(()) => debug!("Removed presence of {} in {}", self.ctx.client_id, self.ctx.document),
            Err(e) => warn!("Failed to remove presence of {}: {e}", self.ctx.client_id),
        }
    }

    /// Live presence records of the other sessions in this document.
    pub async fn peers(&self) -> Vec<PresenceRecord> {
        let records = match self.ctx.backend.fetch_presence(&self.ctx.document).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to fetch presence for {}: {e}", self.ctx.document);
                return Vec::new();
            }
        };

        let now = Timestamp::now();
        let liveness = u64::try_from(self.liveness.as_millis()).unwrap_or(u64::MAX);
        let mut peers: Vec<PresenceRecord> = records
            .into_iter()
            .filter(|r| r.client_id != self.ctx.client_id)
            .filter(|r| now.millis_since(r.last_seen) <= liveness)
            .collect();
        peers.sort_by(|a, b| a.client_id.as_str().cmp(b.client_id.as_str()));
        peers
    }

    /// Latest cursor handed to [`update`](Self::update), sent or not.
    pub fn local_cursor(&self) -> Option<CursorRange> {
        self.local.lock().cursor
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    async fn write(&self, cursor: Option<CursorRange>) {
        let data = PresenceData {
            user_id: self.identity.user_id.clone(),
            display_name: self.identity.display_name.clone(),
            color: self.identity.color.clone(),
            cursor,
        };
        match self
            .ctx
            .backend
            .write_presence(&self.ctx.document, &self.ctx.client_id, data)
            .await
        {
            Ok(()) => {
                self.ctx.counters().record_presence_write();
                trace!("Presence of {} -> {cursor:?}", self.ctx.client_id);
            }
            Err(e) => warn!("Failed to update presence of {}: {e}", self.ctx.client_id),
        }
    }
}
