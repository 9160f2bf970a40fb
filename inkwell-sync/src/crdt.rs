//! CRDT state container.
//!
//! Sessions, the scheduler and the wire protocol only ever see opaque
//! byte buffers: full snapshots, deltas and state vectors. [`CrdtState`]
//! is the narrow seam between them and the replication algorithm, so a
//! different CRDT can be dropped in without touching session logic.
//!
//! [`YrsState`] backs the trait with a Yrs `Doc` using the v1 update
//! encoding, which is byte-compatible with Yjs clients.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

/// Outcome of merging one delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedDelta {
    /// Whether the merge changed the replica (false for re-delivered deltas).
    pub changed: bool,
    /// Size of the incoming delta in bytes.
    pub len: usize,
}

/// CRDT errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CrdtError {
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

/// A mergeable document replica behind opaque byte buffers.
///
/// Implementations must make [`apply_delta`](CrdtState::apply_delta)
/// commutative, associative and idempotent, and must leave the replica
/// untouched when the delta cannot be parsed.
pub trait CrdtState: Send + Sync {
    /// Merge a delta produced by any replica of the same document.
    fn apply_delta(&mut self, delta: &[u8]) -> Result<AppliedDelta, CrdtError>;

    /// Encode the changes this replica has that the peer described by
    /// `peer_state_vector` is missing. An empty vector means "nothing".
    fn encode_delta(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, CrdtError>;

    /// Encode the full state as a single delta.
    fn encode_full(&self) -> Vec<u8>;

    /// Compact summary of the updates this replica has incorporated.
    fn state_vector(&self) -> Vec<u8>;
}

/// Constructor used by the registry to seed a replica from stored bytes.
pub type ReplicaFactory = fn(&[u8]) -> Result<Box<dyn CrdtState>, CrdtError>;

/// Default [`ReplicaFactory`]: a [`YrsState`] seeded from the snapshot.
pub fn yrs_replica(snapshot: &[u8]) -> Result<Box<dyn CrdtState>, CrdtError> {
    Ok(Box::new(YrsState::from_snapshot(snapshot)?))
}

/// Yrs-backed replica.
pub struct YrsState {
    doc: Doc,
}

impl YrsState {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a replica from a full snapshot. Empty bytes produce an empty
    /// document (a record created by the CRUD layer before any edit).
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CrdtError> {
        let state = Self::new();
        if snapshot.is_empty() {
            return Ok(state);
        }
        let update = Update::decode_v1(snapshot)
            .map_err(|e| CrdtError::MalformedSnapshot(e.to_string()))?;
        let mut txn = state.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CrdtError::MalformedSnapshot(e.to_string()))?;
        drop(txn);
        Ok(state)
    }

    /// Underlying Yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Run a local edit and return the delta it produced.
    pub fn edit<F>(&self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let mut txn = self.doc.transact_mut();
        f(&mut txn);
        txn.encode_update_v1()
    }
}

impl YrsState {
    /// Encoded form of the updates and deletions yrs holds back until the
    /// blocks they depend on arrive. These count as state even though the
    /// snapshot does not show them yet.
    fn pending(&self) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
        let txn = self.doc.transact();
        let store = txn.store();
        let update = store.pending_update().map(|pending| {
            let mut bytes = pending.update.state_vector().encode_v1();
            bytes.extend(pending.update.delete_set().encode_v1());
            bytes.extend(pending.missing.encode_v1());
            bytes
        });
        let deletes = store.pending_ds().map(|ds| ds.encode_v1());
        (update, deletes)
    }
}

impl Default for YrsState {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtState for YrsState {
    fn apply_delta(&mut self, delta: &[u8]) -> Result<AppliedDelta, CrdtError> {
        // Decode before opening a write transaction so garbage never
        // touches the document.
        let update =
            Update::decode_v1(delta).map_err(|e| CrdtError::MalformedDelta(e.to_string()))?;

        let before = (self.doc.transact().snapshot(), self.pending());
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CrdtError::MalformedDelta(e.to_string()))?;
        }
        let after = (self.doc.transact().snapshot(), self.pending());

        Ok(AppliedDelta {
            changed: before != after,
            len: delta.len(),
        })
    }

    fn encode_delta(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let sv = if peer_state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(peer_state_vector)
                .map_err(|e| CrdtError::MalformedStateVector(e.to_string()))?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    fn encode_full(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }
}
