//! # colab-sync: Polling-based CRDT document synchronization
//!
//! Keeps a local Yjs replica (via `yrs`) consistent with every other client
//! editing the same document, through a shared store that holds a snapshot,
//! an append-only update log and presence records. There is no push channel:
//! remote changes are discovered by polling.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  local edits   ┌───────────────┐   persist   ┌──────────────┐
//! │ ReplicatedDoc│ ─────────────► │ PendingBuffer │ ──────────► │ PendingStore │
//! │ (yrs::Doc)   │                └───────┬───────┘             │ (RocksDB)    │
//! └──────▲───────┘                        │ drain + merge       └──────────────┘
//!        │ apply (remote origin)          ▼
//! ┌──────┴───────┐                ┌───────────────┐
//! │ Poller       │ ◄── fetch ──── │ SyncBackend   │ ◄── append ── Publisher
//! │ (watermark)  │                │ snapshot, log,│ ◄── overwrite ─ SnapshotManager
//! └──────────────┘                │ presence      │ ◄── upsert ─── PresenceTracker
//!                                 └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: join / leave and the periodic loops
//! - [`doc`]: origin-tagged replica
//! - [`buffer`]: durable pending-update queue
//! - [`publisher`], [`poller`], [`snapshot`], [`presence`]: the periodic components
//! - [`backend`]: the store seam, plus an in-memory implementation
//! - [`storage`]: local durable storage for pending updates
//! - [`protocol`]: identifiers and records exchanged with the store

pub mod backend;
pub mod buffer;
pub mod context;
pub mod doc;
pub mod error;
pub mod poller;
pub mod presence;
pub mod protocol;
pub mod publisher;
pub mod session;
pub mod snapshot;
pub mod storage;

// Re-exports for convenience
pub use backend::{BackendOp, MemoryBackend, SyncBackend};
pub use buffer::PendingBuffer;
pub use context::{SessionStats, SyncContext};
pub use doc::{ChangeNotification, ChangeOrigin, ReplicatedDoc};
pub use error::SyncError;
pub use poller::{PollReport, Poller};
pub use presence::{color_for_user, PresenceTracker, USER_COLORS};
pub use protocol::{
    ClientId, ClientIdentity, CursorRange, DocumentName, PresenceData, PresenceRecord, Snapshot,
    Timestamp, UpdateEntry,
};
pub use publisher::{merge_blobs, PublishReport, Publisher};
pub use session::{SessionController, SessionHandle, SyncConfig};
pub use snapshot::SnapshotManager;
pub use storage::{
    MemoryPendingStore, PendingRecord, PendingStore, PendingStoreConfig, RocksPendingStore,
};
