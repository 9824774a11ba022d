//! Data exchanged between a sync session and the external store.
//!
//! Everything here is plain data: identifiers, update-log entries, snapshots
//! and presence records. The CRDT payloads themselves are opaque Yjs v1
//! update blobs (`Vec<u8>`).

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Logical key of a replicated document. Every sync operation is scoped to one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentName(String);

impl DocumentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DocumentName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Session-scoped correlation token.
///
/// Tags the updates this session publishes (so the poller can skip them)
/// and keys its presence record. Generated per join, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Length of the random base36 suffix.
    const SUFFIX_LEN: usize = 7;

    /// Fresh id: `<unix-millis>-<7 random base36 chars>`.
    pub fn generate() -> Self {
        let mut entropy = Uuid::new_v4().as_u128();
        let mut suffix = String::with_capacity(Self::SUFFIX_LEN);
        for _ in 0..Self::SUFFIX_LEN {
            let digit = (entropy % 36) as u32;
            entropy /= 36;
            // digit < 36, always a valid base36 char
            suffix.push(char::from_digit(digit, 36).unwrap_or('0'));
        }
        Self(format!("{}-{suffix}", Timestamp::now().as_millis()))
    }

    /// Wrap an existing id (ids read back from the store, tests).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch, as assigned by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(millis as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self` (zero if `earlier` is later).
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// One entry of the shared incremental update log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEntry {
    /// Store-assigned identifier.
    pub id: u64,
    /// Yjs v1 update blob.
    pub update: Vec<u8>,
    /// Server timestamp; drives the poller watermark.
    pub created_at: Timestamp,
    /// Session that published the entry.
    pub client_id: ClientId,
}

/// Full encoded document state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: Vec<u8>,
    pub updated_at: Timestamp,
}

impl Snapshot {
    /// A missing or zero-length state carries nothing to merge.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

/// Text selection in document positions. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn new(anchor: u32, head: u32) -> Self {
        Self { anchor, head }
    }

    pub fn caret(position: u32) -> Self {
        Self::new(position, position)
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// Payload of a presence write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceData {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub color: Option<String>,
    /// `None` means "no active position", not "gone".
    pub cursor: Option<CursorRange>,
}

/// A presence record as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub data: PresenceData,
    /// Time of the last write, assigned by the store.
    pub last_seen: Timestamp,
}

/// Display metadata of the person behind a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub color: Option<String>,
}

impl ClientIdentity {
    /// Identity for a known user, with the user's stable palette colour.
    pub fn user(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = crate::presence::color_for_user(&user_id).to_string();
        Self {
            user_id: Some(user_id),
            display_name: Some(display_name.into()),
            color: Some(color),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}
