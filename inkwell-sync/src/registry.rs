//! Process-wide map from document id to live session.
//!
//! ```text
//!            map lock (brief)            slot lock (per document)
//! attach ──► get-or-insert Slot ──────► Vacant  → gate, load, create session
//!                                       Live    → gate, join
//!                                       Retired → retry with a fresh slot
//!
//! detach ──► session.leave ─ 0 left? ─► slot lock → recheck → close_and_flush
//!                                                 → remove from map → Retired
//! ```
//!
//! The map lock is never held across a store call. Session creation and
//! eviction for one document are serialized on that document's slot, so
//! concurrent first attaches load once, and an attach that arrives during
//! eviction waits and then creates a fresh session.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::crdt::{yrs_replica, ReplicaFactory};
use crate::error::SyncError;
use crate::permission::{Access, PermissionGate};
use crate::protocol::{DocumentId, UserId};
use crate::scheduler::FlushReason;
use crate::session::{DocumentSession, SessionSettings};
use crate::storage::{DocumentStore, StoreError};

enum SlotState {
    /// No session yet; the slot holder creates it.
    Vacant,
    Live(Arc<DocumentSession>),
    /// Removed from the map; holders must look up again.
    Retired,
}

struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Vacant),
        })
    }
}

pub struct SessionRegistry {
    slots: Mutex<HashMap<DocumentId, Arc<Slot>>>,
    store: Arc<dyn DocumentStore>,
    gate: Arc<dyn PermissionGate>,
    settings: SessionSettings,
    replica_factory: ReplicaFactory,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gate: Arc<dyn PermissionGate>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            store,
            gate,
            settings,
            replica_factory: yrs_replica,
        }
    }

    pub fn from_config(
        config: &ServerConfig,
        store: Arc<dyn DocumentStore>,
        gate: Arc<dyn PermissionGate>,
    ) -> Self {
        Self::new(store, gate, SessionSettings::from_config(config))
    }

    /// Use a different CRDT implementation for new sessions.
    pub fn with_replica_factory(mut self, factory: ReplicaFactory) -> Self {
        self.replica_factory = factory;
        self
    }

    /// Attach `user` to `doc_id`, creating the session on first use.
    pub async fn attach(&self, doc_id: &DocumentId, user: &UserId) -> Result<Connection, SyncError> {
        loop {
            let slot = {
                let mut slots = self.slots.lock().await;
                slots.entry(doc_id.clone()).or_insert_with(Slot::new).clone()
            };

            let mut state = slot.state.lock().await;
            let session = match &*state {
                SlotState::Retired => continue,
                SlotState::Live(session) => {
                    self.check_access(user, doc_id)?;
                    session.clone()
                }
                SlotState::Vacant => match self.create_session(doc_id, user).await {
                    Ok(session) => {
                        *state = SlotState::Live(session.clone());
                        session
                    }
                    Err(e) => {
                        self.retire(doc_id, &slot, &mut state).await;
                        return Err(e);
                    }
                },
            };

            // Joining under the slot lock keeps eviction from running in between.
            let result = Connection::open(session.clone(), user.clone()).await;
            if result.is_err() && session.connection_count().await == 0 {
                // A fresh session that nobody managed to join.
                let _ = session.close_and_flush(FlushReason::Eviction).await;
                self.retire(doc_id, &slot, &mut state).await;
            }
            return result;
        }
    }

    async fn create_session(
        &self,
        doc_id: &DocumentId,
        user: &UserId,
    ) -> Result<Arc<DocumentSession>, SyncError> {
        let record = match self.store.load(doc_id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                log::info!("Attach to unknown document {doc_id} refused");
                return Err(SyncError::DocumentNotFound(doc_id.clone()));
            }
            Err(e) => return Err(SyncError::StoreUnavailable(e.to_string())),
        };

        self.check_access(user, doc_id)?;

        let replica = (self.replica_factory)(&record.content).map_err(|e| {
            log::error!("Stored snapshot for {doc_id} is unreadable: {e}");
            SyncError::StoreUnavailable(format!("unreadable snapshot: {e}"))
        })?;

        let session = DocumentSession::new(
            doc_id.clone(),
            replica,
            record.version,
            Arc::clone(&self.store),
            self.settings.clone(),
        );
        session.spawn_timer();
        log::info!("Session for {doc_id} created at v{}", record.version);
        Ok(session)
    }

    fn check_access(&self, user: &UserId, doc_id: &DocumentId) -> Result<(), SyncError> {
        match self.gate.check_access(user, doc_id) {
            Access::Allowed => Ok(()),
            Access::Denied => {
                log::info!("User {user} denied access to {doc_id}");
                Err(SyncError::PermissionDenied {
                    user: user.clone(),
                    doc: doc_id.clone(),
                })
            }
        }
    }

    /// Detach a connection. If it was the last one, the session is flushed
    /// (if dirty) and removed before this returns.
    ///
    /// A failed final flush is returned, but the session is removed anyway.
    pub async fn detach(&self, mut connection: Connection) -> Result<(), SyncError> {
        connection.disconnect();
        let session = connection.session().clone();
        let doc_id = session.doc_id().clone();
        let remaining = session.leave(connection.id()).await;
        log::info!("Connection {} left {doc_id} ({remaining} remaining)", connection.id());
        drop(connection);

        if remaining > 0 {
            return Ok(());
        }

        let Some(slot) = self.slots.lock().await.get(&doc_id).cloned() else {
            return Ok(());
        };
        let mut state = slot.state.lock().await;
        match &*state {
            SlotState::Live(live) if Arc::ptr_eq(live, &session) => {}
            _ => return Ok(()),
        }
        // Someone may have joined while we waited for the slot.
        if session.connection_count().await > 0 {
            return Ok(());
        }

        let result = session.close_and_flush(FlushReason::Eviction).await;
        self.retire(&doc_id, &slot, &mut state).await;
        match &result {
            Ok(version) => log::info!("Session for {doc_id} evicted at v{version}"),
            Err(e) => log::error!("Session for {doc_id} evicted with unsaved changes: {e}"),
        }
        result.map(|_| ())
    }

    /// Remove `slot` from the map (if it is still the registered one) and
    /// mark it retired. Caller holds the slot lock.
    async fn retire(&self, doc_id: &DocumentId, slot: &Arc<Slot>, state: &mut SlotState) {
        let mut slots = self.slots.lock().await;
        if slots.get(doc_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(doc_id);
        }
        *state = SlotState::Retired;
    }

    /// Flush and close every session. Returns the failures.
    pub async fn shutdown(&self) -> Vec<(DocumentId, SyncError)> {
        let slots: Vec<(DocumentId, Arc<Slot>)> = {
            let slots = self.slots.lock().await;
            slots.iter().map(|(id, s)| (id.clone(), s.clone())).collect()
        };

        let mut failures = Vec::new();
        for (doc_id, slot) in slots {
            let mut state = slot.state.lock().await;
            if let SlotState::Live(session) = &*state {
                if let Err(e) = session.close_and_flush(FlushReason::Shutdown).await {
                    log::error!("Final flush of {doc_id} failed: {e}");
                    failures.push((doc_id.clone(), e));
                }
            }
            self.retire(&doc_id, &slot, &mut state).await;
        }
        failures
    }

    /// Live session for `doc_id`, if any.
    pub async fn session(&self, doc_id: &DocumentId) -> Option<Arc<DocumentSession>> {
        let slot = self.slots.lock().await.get(doc_id).cloned()?;
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Live(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub async fn session_count(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if matches!(&*slot.state.lock().await, SlotState::Live(_)) {
                count += 1;
            }
        }
        count
    }

    pub async fn connection_count(&self) -> usize {
        let mut total = 0;
        for session in self.sessions().await {
            total += session.connection_count().await;
        }
        total
    }

    async fn sessions(&self) -> Vec<Arc<DocumentSession>> {
        let slots: Vec<Arc<Slot>> = self.slots.lock().await.values().cloned().collect();
        let mut sessions = Vec::new();
        for slot in slots {
            if let SlotState::Live(session) = &*slot.state.lock().await {
                sessions.push(session.clone());
            }
        }
        sessions
    }
}
