//! Error type shared by every sync component.
//!
//! None of these errors cross the session API during steady state: loops log
//! them and retry on the next tick. They are returned from the lower-level
//! building blocks (document, buffer, stores, backend) so callers can decide.

use crate::protocol::DocumentName;

/// Sync errors.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// The external store rejected or failed a call (network, database, auth).
    Backend(String),
    /// Local durable storage failed (RocksDB, quota, I/O).
    Storage(String),
    /// An update blob could not be decoded.
    Decode(String),
    /// A decoded update could not be integrated into the document.
    Apply(String),
    /// Serialization of a persisted record failed.
    Encode(String),
    /// The document refused an observer registration.
    Observe(String),
    /// A persisted pending record failed its integrity check.
    Corrupted { document: DocumentName },
    /// The session is not (or no longer) connected.
    NotConnected,
}

impl SyncError {
    /// Whether retrying on the next tick can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Backend(_) | SyncError::Storage(_) | SyncError::NotConnected)
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Backend(e) => write!(f, "Backend error: {e}"),
            SyncError::Storage(e) => write!(f, "Local storage error: {e}"),
            SyncError::Decode(e) => write!(f, "Update decode error: {e}"),
            SyncError::Apply(e) => write!(f, "Update apply error: {e}"),
            SyncError::Encode(e) => write!(f, "Encode error: {e}"),
            SyncError::Observe(e) => write!(f, "Observer registration failed: {e}"),
            SyncError::Corrupted { document } => {
                write!(f, "Pending record for {document} is corrupted")
            }
            SyncError::NotConnected => write!(f, "Session is not connected"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<rocksdb::Error> for SyncError {
    fn from(e: rocksdb::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<yrs::encoding::read::Error> for SyncError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
