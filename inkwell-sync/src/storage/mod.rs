//! Persistent storage contract and its implementations.
//!
//! ```text
//! ┌─────────────────┐  load on first attach   ┌────────────────────┐
//! │ SessionRegistry │ ──────────────────────► │                    │
//! └─────────────────┘                         │  DocumentStore     │
//! ┌─────────────────┐  save on flush          │  ├─ RocksStore     │
//! │ DocumentSession │ ──────────────────────► │  └─ MemoryStore    │
//! └─────────────────┘                         │                    │
//! ┌─────────────────┐  load_access on attach  │  AccessSource      │
//! │ AclGate         │ ──────────────────────► │                    │
//! └─────────────────┘                         └────────────────────┘
//! ```
//!
//! The engine never creates or deletes records through [`DocumentStore`];
//! that belongs to the CRUD layer (`create_document` / `delete_document`
//! on the concrete stores).

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::protocol::{DocumentId, UserId};

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// A document record as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDocument {
    pub content: Vec<u8>,
    pub version: u64,
    /// Seconds since the Unix epoch.
    pub updated_at: u64,
}

/// Load/save contract consumed by the sync engine.
pub trait DocumentStore: Send + Sync {
    /// Read the record for `doc_id`, or [`StoreError::NotFound`].
    fn load(&self, doc_id: &DocumentId) -> Result<PersistedDocument, StoreError>;

    /// Overwrite the content of an existing record and set its version.
    ///
    /// Must fail with [`StoreError::NotFound`] instead of creating a record
    /// when `doc_id` is unknown.
    fn save(&self, doc_id: &DocumentId, content: &[u8], version: u64) -> Result<(), StoreError>;
}

/// Who may open a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAccess {
    pub owner: UserId,
    pub collaborators: Vec<UserId>,
    pub is_public: bool,
}

impl DocumentAccess {
    pub fn private(owner: impl Into<UserId>) -> Self {
        Self {
            owner: owner.into(),
            collaborators: Vec::new(),
            is_public: false,
        }
    }

    pub fn with_collaborator(mut self, user: impl Into<UserId>) -> Self {
        self.collaborators.push(user.into());
        self
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    /// Owner, collaborator or public document.
    pub fn permits(&self, user: &UserId) -> bool {
        self.is_public || &self.owner == user || self.collaborators.contains(user)
    }
}

/// Source of access-control records.
pub trait AccessSource: Send + Sync {
    /// `Ok(None)` when the document has no access record.
    fn load_access(&self, doc_id: &DocumentId) -> Result<Option<DocumentAccess>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("document already exists: {0}")]
    AlreadyExists(DocumentId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
