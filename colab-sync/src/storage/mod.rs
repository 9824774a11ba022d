//! Local durable storage for pending (unacknowledged) updates.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  save / load / clear  ┌──────────────────────────┐
//! │ PendingBuffer │ ────────────────────► │ dyn PendingStore         │
//! │ (in-memory)   │                       ├──────────────────────────┤
//! └───────────────┘                       │ MemoryPendingStore       │
//!                                         │ RocksPendingStore        │
//!                                         │   CF "pending": one      │
//!                                         │   checksummed, LZ4       │
//!                                         │   record per document    │
//!                                         └──────────────────────────┘
//! ```
//!
//! The store only ever holds the *unconfirmed* set. A successful publish
//! clears it; a crash leaves it behind for the next session to recover.

pub mod memory;
pub mod record;
pub mod rocks;

pub use memory::MemoryPendingStore;
pub use record::PendingRecord;
pub use rocks::{PendingStoreConfig, RocksPendingStore};

use crate::error::SyncError;
use crate::protocol::DocumentName;

/// Durable key-value slot for a document's pending update blobs.
///
/// Calls are synchronous: they run from inside the document's change
/// observer, which cannot await.
pub trait PendingStore: Send + Sync {
    /// Replace the persisted blobs for `document` with `blobs`.
    fn save_pending(&self, document: &DocumentName, blobs: &[Vec<u8>]) -> Result<(), SyncError>;

    /// Blobs persisted for `document`, oldest first. Empty when none.
    fn load_pending(&self, document: &DocumentName) -> Result<Vec<Vec<u8>>, SyncError>;

    /// Drop the persisted record for `document`.
    fn clear_pending(&self, document: &DocumentName) -> Result<(), SyncError>;
}
