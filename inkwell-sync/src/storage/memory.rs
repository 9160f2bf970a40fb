//! In-memory store for tests and storage-less deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{unix_now, AccessSource, DocumentAccess, DocumentStore, PersistedDocument, StoreError};
use crate::protocol::DocumentId;

#[derive(Default)]
struct Tables {
    documents: HashMap<DocumentId, PersistedDocument>,
    access: HashMap<DocumentId, DocumentAccess>,
}

/// `HashMap`-backed [`DocumentStore`] with call counters and fault injection.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    loads: AtomicU64,
    saves: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// CRUD-layer create: an empty document at version 1.
    pub fn create_document(&self, doc_id: &DocumentId) -> Result<(), StoreError> {
        self.insert_document(doc_id, Vec::new(), 1)
    }

    /// Insert a record with explicit content and version.
    pub fn insert_document(
        &self,
        doc_id: &DocumentId,
        content: Vec<u8>,
        version: u64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if tables.documents.contains_key(doc_id) {
            return Err(StoreError::AlreadyExists(doc_id.clone()));
        }
        tables.documents.insert(
            doc_id.clone(),
            PersistedDocument {
                content,
                version,
                updated_at: unix_now(),
            },
        );
        Ok(())
    }

    /// CRUD-layer delete. Live sessions notice on their next flush.
    pub fn delete_document(&self, doc_id: &DocumentId) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        tables.access.remove(doc_id);
        tables
            .documents
            .remove(doc_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(doc_id.clone()))
    }

    pub fn put_access(&self, doc_id: &DocumentId, access: DocumentAccess) -> Result<(), StoreError> {
        self.tables()?.access.insert(doc_id.clone(), access);
        Ok(())
    }

    /// Current record, bypassing the load counter.
    pub fn get(&self, doc_id: &DocumentId) -> Option<PersistedDocument> {
        self.tables().ok()?.documents.get(doc_id).cloned()
    }

    /// Make every load and save fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of load calls.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, doc_id: &DocumentId) -> Result<PersistedDocument, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.tables()?
            .documents
            .get(doc_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(doc_id.clone()))
    }

    fn save(&self, doc_id: &DocumentId, content: &[u8], version: u64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tables = self.tables()?;
        let record = tables
            .documents
            .get_mut(doc_id)
            .ok_or_else(|| StoreError::NotFound(doc_id.clone()))?;
        record.content = content.to_vec();
        record.version = version;
        record.updated_at = unix_now();
        drop(tables);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl AccessSource for MemoryStore {
    fn load_access(&self, doc_id: &DocumentId) -> Result<Option<DocumentAccess>, StoreError> {
        self.check_available()?;
        Ok(self.tables()?.access.get(doc_id).cloned())
    }
}
