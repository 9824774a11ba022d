//! Checksummed on-disk form of a document's pending updates.
//!
//! One record per document, rewritten whole on every change:
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ PendingRecord                               │
//! │   document : "deal-42"                      │
//! │   blobs    : [ blob | blob | blob | ... ]   │
//! │   saved_at : unix millis                    │
//! │   checksum : FNV-1a over all of the above   │
//! └────────────────────────────────────────────┘
//! ```
//! A record that fails to decode or verify is reported as
//! [`SyncError::Corrupted`]; the store never hands back partial blobs.

use crate::error::SyncError;
use crate::protocol::{DocumentName, Timestamp};
use serde::{Deserialize, Serialize};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Pending update blobs of one document, in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub document: String,
    pub blobs: Vec<Vec<u8>>,
    pub saved_at: u64,
    pub checksum: u32,
}

impl PendingRecord {
    pub fn new(document: &DocumentName, blobs: &[Vec<u8>]) -> Self {
        let document = document.as_str().to_string();
        let blobs = blobs.to_vec();
        let saved_at = Timestamp::now().as_millis();
        let checksum = Self::compute_checksum(&document, &blobs, saved_at);
        Self { document, blobs, saved_at, checksum }
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(&self.document, &self.blobs, self.saved_at)
    }

    /// Total payload bytes across all blobs.
    pub fn payload_len(&self) -> usize {
        self.blobs.iter().map(Vec::len).sum()
    }

    fn compute_checksum(document: &str, blobs: &[Vec<u8>], saved_at: u64) -> u32 {
        let mut hash = FNV_OFFSET;
        let mut mix = |byte: u8| {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        };
        document.bytes().for_each(&mut mix);
        saved_at.to_le_bytes().into_iter().for_each(&mut mix);
        // Length prefixes keep ["ab","c"] and ["a","bc"] apart.
        for blob in blobs {
            (blob.len() as u64).to_le_bytes().into_iter().for_each(&mut mix);
            blob.iter().copied().for_each(&mut mix);
        }
        hash
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Encode(e.to_string()))
    }

    /// Decode and verify. Any failure means the record cannot be trusted.
    pub fn decode(document: &DocumentName, bytes: &[u8]) -> Result<Self, SyncError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|_| SyncError::Corrupted { document: document.clone() })?;
        if !record.verify() || record.document != document.as_str() {
            return Err(SyncError::Corrupted { document: document.clone() });
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentName {
        DocumentName::new("deal-42")
    }

    #[test]
    fn test_record_create_verify() {
        let record = PendingRecord::new(&doc(), &[b"e1".to_vec(), b"e2".to_vec()]);
        assert!(record.verify());
        assert_eq!(record.payload_len(), 4);
    }

    #[test]
    fn test_record_checksum_integrity() {
        let record = PendingRecord::new(&doc(), &[vec![1, 2, 3, 4]]);

        let mut corrupted = record.clone();
        corrupted.blobs[0][0] = 255;
        assert!(!corrupted.verify());

        let mut corrupted = record.clone();
        corrupted.document = "deal-43".into();
        assert!(!corrupted.verify());
    }

    #[test]
    fn test_record_blob_boundaries_matter() {
        let a = PendingRecord::new(&doc(), &[b"ab".to_vec(), b"c".to_vec()]);
        let mut b = a.clone();
        b.blobs = vec![b"a".to_vec(), b"bc".to_vec()];
        assert!(!b.verify());
    }

    #[test]
    fn test_record_decode_rejects_garbage() {
        let err = PendingRecord::decode(&doc(), &[0xFF; 10]).unwrap_err();
        assert!(matches!(err, SyncError::Corrupted { .. }));
    }

    #[test]
    fn test_record_decode_rejects_other_document() {
        let bytes = PendingRecord::new(&doc(), &[b"x".to_vec()]).encode().unwrap();
        let other = DocumentName::new("deal-7");
        assert!(PendingRecord::decode(&other, &bytes).is_err());
        assert!(PendingRecord::decode(&doc(), &bytes).is_ok());
    }
}
