//! Local update publisher.
//!
//! Each tick drains the pending buffer, merges the drained blobs into one
//! update and appends it to the shared log under this session's client id.
//! The buffer is acknowledged only after the append succeeds; on failure the
//! batch goes back to the front of the queue for the next tick.

use crate::buffer::PendingBuffer;
use crate::context::SyncContext;
use crate::error::SyncError;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::Update;

/// Result of one publish tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReport {
    /// Nothing buffered, or the session is not connected.
    Idle,
    /// `blobs` local updates went out as one append of `bytes` bytes.
    Published { blobs: usize, bytes: usize },
    /// Every drained blob was undecodable and has been dropped.
    Discarded { blobs: usize },
}

pub struct Publisher {
    ctx: SyncContext,
    buffer: Arc<PendingBuffer>,
    in_flight: Mutex<()>,
}

impl Publisher {
    pub fn new(ctx: SyncContext, buffer: Arc<PendingBuffer>) -> Self {
        Self { ctx, buffer, in_flight: Mutex::new(()) }
    }

    /// Publish everything buffered so far.
    ///
    /// Ticks are serialized: a tick started while another is running waits
    /// for it, then publishes whatever is left.
    pub async fn tick(&self) -> Result<PublishReport, SyncError> {
        let _guard = self.in_flight.lock().await;
        if !self.ctx.is_connected() || self.buffer.is_empty() {
            return Ok(PublishReport::Idle);
        }

        let blobs = self.buffer.drain_all();
        let count = blobs.len();
        let Some(merged) = merge_blobs(&blobs) else {
            warn!(
                "Dropping {count} undecodable pending updates for {}",
                self.ctx.document
            );
            self.buffer.acknowledge();
            return Ok(PublishReport::Discarded { blobs: count });
        };

        let bytes = merged.len();
        match self
            .ctx
            .backend
            .append_update(&self.ctx.document, merged, &self.ctx.client_id)
            .await
        {
            Ok(()) => {
                self.buffer.acknowledge();
                self.ctx.counters().record_publish(count);
                debug!(
                    "Published {count} updates ({bytes} bytes) for {}",
                    self.ctx.document
                );
                Ok(PublishReport::Published { blobs: count, bytes })
            }
            Err(e) => {
                self.buffer.restore();
                Err(e)
            }
        }
    }

    /// Whether a tick is running right now.
    pub fn is_publishing(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }
}

/// Merge update blobs into one equivalent blob.
///
/// A single decodable blob is returned untouched. Undecodable blobs are
/// skipped with a warning; `None` means nothing decodable was left.
pub fn merge_blobs(blobs: &[Vec<u8>]) -> Option<Vec<u8>> {
    if let [single] = blobs {
        return match Update::decode_v1(single) {
            Ok(_) => Some(single.clone()),
            Err(e) => {
                warn!("Skipping undecodable pending update ({} bytes): {e}", single.len());
                None
            }
        };
    }

    let mut decoded = Vec::with_capacity(blobs.len());
    for (idx, blob) in blobs.iter().enumerate() {
        match Update::decode_v1(blob) {
            Ok(update) => decoded.push(update),
            Err(e) => warn!("Skipping undecodable pending update #{idx} ({} bytes): {e}", blob.len()),
        }
    }

    match decoded.len() {
        0 => None,
        _ => Some(Update::merge_updates(decoded).encode_v1()),
    }
}
