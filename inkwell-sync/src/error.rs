//! Errors surfaced by sessions, the registry and the service.

use crate::crdt::CrdtError;
use crate::protocol::{DocumentId, ProtocolError, UserId};
use crate::storage::StoreError;

/// Session-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Attach to an id that has no persisted record.
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    /// The permission gate refused the attach.
    #[error("permission denied for user {user} on document {doc}")]
    PermissionDenied { user: UserId, doc: DocumentId },

    /// A delta that failed to parse. The connection stays open.
    #[error("malformed delta: {0}")]
    MalformedDelta(String),

    /// Load or save failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The peer or session is gone.
    #[error("transport closed")]
    TransportClosed,

    /// Per-document connection limit reached.
    #[error("session full: {doc} already has {limit} connections")]
    SessionFull { doc: DocumentId, limit: usize },

    /// Wire-level error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Listener or WebSocket handshake failure.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(doc) => SyncError::DocumentNotFound(doc),
            other => SyncError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<CrdtError> for SyncError {
    fn from(err: CrdtError) -> Self {
        SyncError::MalformedDelta(err.to_string())
    }
}

impl SyncError {
    /// Text sent to the client in `AuthFailed` / `Close`.
    pub fn client_reason(&self) -> String {
        match self {
            SyncError::DocumentNotFound(_) => "document not found".to_string(),
            SyncError::PermissionDenied { .. } => "permission denied".to_string(),
            SyncError::SessionFull { .. } => "session full".to_string(),
            SyncError::StoreUnavailable(_) => "store unavailable".to_string(),
            other => other.to_string(),
        }
    }
}
