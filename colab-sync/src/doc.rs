//! Replicated document state.
//!
//! A thin wrapper over `yrs::Doc` that makes the origin of every change
//! explicit. Local edits run in transactions tagged [`ChangeOrigin::Local`],
//! updates fetched from the shared log in transactions tagged
//! [`ChangeOrigin::Remote`]. Subscribers registered through
//! [`ReplicatedDoc::on_local_change`] only ever see the former, which is what
//! keeps a session from re-publishing what it just received.

use crate::error::SyncError;
use parking_lot::Mutex;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, TextRef, Transact,
    TransactionMut, Update,
};

/// Root text shared by all collaborators.
const CONTENT_TEXT: &str = "content";

const LOCAL_ORIGIN: &str = "local";
const REMOTE_ORIGIN: &str = "remote";

/// Where a change to the document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Produced by this session's editor.
    Local,
    /// Received from another session through the update log or a snapshot.
    Remote,
}

impl ChangeOrigin {
    fn as_origin(self) -> Origin {
        match self {
            ChangeOrigin::Local => Origin::from(LOCAL_ORIGIN),
            ChangeOrigin::Remote => Origin::from(REMOTE_ORIGIN),
        }
    }

    /// Untagged transactions count as local.
    fn classify(origin: Option<&Origin>) -> Self {
        match origin {
            Some(o) if o.as_ref() == REMOTE_ORIGIN.as_bytes() => ChangeOrigin::Remote,
            _ => ChangeOrigin::Local,
        }
    }
}

/// Emitted once per committed transaction that changed the document.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub origin: ChangeOrigin,
    /// Yjs v1 update blob describing exactly this change.
    pub update: Vec<u8>,
}

/// One session's replica of a document.
pub struct ReplicatedDoc {
    doc: Doc,
    content: TextRef,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ReplicatedDoc {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Replica with a fixed CRDT peer id (deterministic tests).
    pub fn with_peer_id(peer_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(peer_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let content = doc.get_or_insert_text(CONTENT_TEXT);
        Self { doc, content, subscriptions: Mutex::new(Vec::new()) }
    }

    // ─── Mutation ─────────────────────────────────────────────────────

    /// Run `mutation` inside a transaction tagged as local.
    ///
    /// Change callbacks fire when the transaction commits, before this returns.
    /// They must not open another transaction on the same document.
    pub fn apply_local<F, R>(&self, mutation: F) -> R
    where
        F: FnOnce(&mut TransactionMut, &TextRef) -> R,
    {
        let mut txn = self.doc.transact_mut_with(ChangeOrigin::Local.as_origin());
        mutation(&mut txn, &self.content)
    }

    /// Merge an update blob received from elsewhere.
    ///
    /// Applying a blob that is already integrated is a no-op.
    pub fn apply_remote(&self, blob: &[u8]) -> Result<(), SyncError> {
        let update = Update::decode_v1(blob)?;
        let mut txn = self.doc.transact_mut_with(ChangeOrigin::Remote.as_origin());
        txn.apply_update(update).map_err(|e| SyncError::Apply(e.to_string()))
    }

    /// Insert `chunk` at character `index` of the shared text.
    pub fn insert_text(&self, index: u32, chunk: &str) {
        self.apply_local(|txn, text| text.insert(txn, index, chunk));
    }

    /// Append `chunk` to the end of the shared text.
    pub fn push_text(&self, chunk: &str) {
        self.apply_local(|txn, text| text.push(txn, chunk));
    }

    pub fn remove_text(&self, index: u32, len: u32) {
        self.apply_local(|txn, text| text.remove_range(txn, index, len));
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    pub fn text_len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    /// The whole document as one v1 update (what a snapshot stores).
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Whether both replicas have integrated the same operations.
    pub fn converged_with(&self, other: &ReplicatedDoc) -> bool {
        self.state_vector() == other.state_vector() && self.text() == other.text()
    }

    // ─── Observation ──────────────────────────────────────────────────

    /// Call `callback` for every committed change, local or remote.
    pub fn observe_changes<F>(&self, callback: F) -> Result<(), SyncError>
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        let subscription = self
            .doc
            .observe_update_v1(move |txn, event| {
                callback(&ChangeNotification {
                    origin: ChangeOrigin::classify(txn.origin()),
                    update: event.update.clone(),
                });
            })
            .map_err(|e| SyncError::Observe(format!("{e:?}")))?;
        self.subscriptions.lock().push(subscription);
        Ok(())
    }

    /// Call `callback` with the update blob of every local change.
    pub fn on_local_change<F>(&self, callback: F) -> Result<(), SyncError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.observe_changes(move |change| {
            if change.origin == ChangeOrigin::Local {
                callback(&change.update);
            }
        })
    }

    /// Drop every registered observer.
    pub fn clear_observers(&self) {
        self.subscriptions.lock().clear();
    }
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}
