//! Live in-memory representative of one document.
//!
//! A `DocumentSession` owns the CRDT replica, the set of attached
//! connections with their awareness state, and the flush schedule. Every
//! mutation, flush and eviction step runs under the session's single
//! `tokio::sync::Mutex`, so they happen one at a time in arrival order.
//!
//! ```text
//!   apply_update ──┐
//!   set_awareness ─┤                    ┌──────────────┐
//!   flush (timer) ─┼──► Mutex<State> ──►│ CrdtState    │
//!   close_and_flush┘         │          │ FlushSchedule│
//!                            │          │ peers        │
//!                            ▼          └──────────────┘
//!                     BroadcastGroup ──► connections
//! ```
//!
//! The flush timer is a task owned by the session. It only reads deadlines
//! and flushes under the same lock, and exits once the session is closed,
//! so a stale timer can never flush an evicted session.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::awareness::{parse_local_state, AwarenessError, AwarenessUpdate};
use crate::broadcast::{BroadcastGroup, BroadcastStats, Outbound};
use crate::config::ServerConfig;
use crate::crdt::{AppliedDelta, CrdtState};
use crate::error::SyncError;
use crate::protocol::{DocumentId, SaveStatus, SyncMessage, UserId};
use crate::scheduler::{FlushPolicy, FlushReason, FlushSchedule, ScheduleState};
use crate::storage::DocumentStore;

/// Per-session tunables, usually taken from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub policy: FlushPolicy,
    pub degraded_after_failures: u32,
    pub max_connections: usize,
    pub max_awareness_bytes: usize,
    pub broadcast_capacity: usize,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            policy: config.persistence.flush_policy(),
            degraded_after_failures: config.persistence.degraded_after_failures.max(1),
            max_connections: config.max_connections_per_document,
            max_awareness_bytes: config.max_awareness_bytes,
            broadcast_capacity: config.broadcast_capacity,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Everything a new connection needs, captured atomically with its
/// subscription so no broadcast falls between them.
pub struct JoinTicket {
    pub receiver: broadcast::Receiver<Arc<Outbound>>,
    pub state_vector: Vec<u8>,
    pub awareness: Vec<AwarenessUpdate>,
    pub version: u64,
}

struct Peer {
    user_id: UserId,
    color: &'static str,
    awareness: Option<Value>,
}

struct SessionState {
    crdt: Box<dyn CrdtState>,
    version: u64,
    schedule: FlushSchedule,
    peers: HashMap<Uuid, Peer>,
    consecutive_failures: u32,
    degraded: bool,
    closed: bool,
    flushes: u64,
}

pub struct DocumentSession {
    doc_id: DocumentId,
    state: Mutex<SessionState>,
    broadcast: BroadcastGroup,
    store: Arc<dyn DocumentStore>,
    settings: SessionSettings,
    timer_wake: Notify,
}

impl DocumentSession {
    /// Build a session around a replica seeded from the store at `version`.
    pub fn new(
        doc_id: DocumentId,
        crdt: Box<dyn CrdtState>,
        version: u64,
        store: Arc<dyn DocumentStore>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            doc_id,
            state: Mutex::new(SessionState {
                crdt,
                version,
                schedule: FlushSchedule::new(),
                peers: HashMap::new(),
                consecutive_failures: 0,
                degraded: false,
                closed: false,
                flushes: 0,
            }),
            broadcast: BroadcastGroup::new(settings.broadcast_capacity),
            store,
            settings,
            timer_wake: Notify::new(),
        })
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Start the flush timer task. It ends when the session is closed.
    pub fn spawn_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_timer().await })
    }

    async fn run_timer(&self) {
        loop {
            let deadline = {
                let state = self.state.lock().await;
                if state.closed {
                    break;
                }
                state.schedule.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => {}
                        _ = self.timer_wake.notified() => continue,
                    }
                }
                None => {
                    self.timer_wake.notified().await;
                    continue;
                }
            }

            let mut state = self.state.lock().await;
            if state.closed {
                break;
            }
            if let Some(reason) = state.schedule.due(Instant::now()) {
                // Failures are already logged and counted; the schedule is re-armed.
                let _ = self.flush_locked(&mut state, reason);
            }
        }
        log::debug!("Flush timer for {} stopped", self.doc_id);
    }

    // ─── Connections ──────────────────────────────────────────────────

    /// Register a connection and subscribe it to the session's broadcasts.
    pub async fn join(
        &self,
        connection_id: Uuid,
        user_id: UserId,
        color: &'static str,
    ) -> Result<JoinTicket, SyncError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SyncError::TransportClosed);
        }
        if state.peers.len() >= self.settings.max_connections {
            return Err(SyncError::SessionFull {
                doc: self.doc_id.clone(),
                limit: self.settings.max_connections,
            });
        }

        let awareness = state
            .peers
            .iter()
            .filter_map(|(id, peer)| {
                peer.awareness.as_ref().map(|s| {
                    AwarenessUpdate::new(*id, peer.user_id.clone(), Some(s.clone()))
                })
            })
            .collect();

        state.peers.insert(
            connection_id,
            Peer {
                user_id,
                color,
                awareness: None,
            },
        );

        Ok(JoinTicket {
            receiver: self.broadcast.subscribe(),
            state_vector: state.crdt.state_vector(),
            awareness,
            version: state.version,
        })
    }

    /// Remove a connection and tell the others it left. Returns how many remain.
    pub async fn leave(&self, connection_id: Uuid) -> usize {
        let mut state = self.state.lock().await;
        if let Some(peer) = state.peers.remove(&connection_id) {
            if peer.awareness.is_some() {
                self.send_awareness(&AwarenessUpdate::removed(connection_id, peer.user_id));
            }
        }
        state.peers.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    // ─── Document content ─────────────────────────────────────────────

    /// Merge a client delta, mark the session dirty and relay it to the
    /// other connections. A malformed delta changes nothing.
    pub async fn apply_update(&self, origin: Uuid, delta: &[u8]) -> Result<AppliedDelta, SyncError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SyncError::TransportClosed);
        }

        let applied = state.crdt.apply_delta(delta)?;
        if !applied.changed {
            // Empty sync replies and re-delivered deltas: nothing to store or relay.
            log::trace!("Redundant delta ({} bytes) on {}", applied.len, self.doc_id);
            return Ok(applied);
        }
        state.schedule.on_mutation(Instant::now(), &self.settings.policy);
        self.timer_wake.notify_one();

        let msg = SyncMessage::update(origin, self.doc_id.clone(), delta.to_vec());
        self.broadcast.broadcast(origin, &msg)?;
        Ok(applied)
    }

    /// Delta a peer with `state_vector` is missing; the full state when the
    /// vector cannot be parsed.
    pub async fn encode_delta_for(&self, state_vector: &[u8]) -> Vec<u8> {
        let state = self.state.lock().await;
        match state.crdt.encode_delta(state_vector) {
            Ok(delta) => delta,
            Err(e) => {
                log::warn!("Bad state vector for {}: {e}; sending full state", self.doc_id);
                state.crdt.encode_full()
            }
        }
    }

    pub async fn encode_full(&self) -> Vec<u8> {
        self.state.lock().await.crdt.encode_full()
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.state.lock().await.crdt.state_vector()
    }

    // ─── Awareness ────────────────────────────────────────────────────

    /// Validate and store a connection's presence, then relay it.
    pub async fn set_awareness(&self, connection_id: Uuid, payload: &[u8]) -> Result<(), AwarenessError> {
        let mut state = self.state.lock().await;
        let Some(peer) = state.peers.get_mut(&connection_id) else {
            return Ok(());
        };
        let value = parse_local_state(payload, peer.color, self.settings.max_awareness_bytes)?;
        peer.awareness = value.clone();
        let update = AwarenessUpdate::new(connection_id, peer.user_id.clone(), value);
        self.send_awareness(&update);
        Ok(())
    }

    fn send_awareness(&self, update: &AwarenessUpdate) {
        let result = update
            .encode()
            .map(|payload| SyncMessage::awareness(update.connection_id, self.doc_id.clone(), payload))
            .and_then(|msg| self.broadcast.broadcast(update.connection_id, &msg));
        if let Err(e) = result {
            log::warn!("Dropping awareness update on {}: {e}", self.doc_id);
        }
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Flush now if dirty. Returns the persisted version.
    pub async fn flush(&self, reason: FlushReason) -> Result<u64, SyncError> {
        let mut state = self.state.lock().await;
        if !state.schedule.is_dirty() {
            return Ok(state.version);
        }
        self.flush_locked(&mut state, reason)
    }

    /// Final flush-if-dirty, then close. The session is closed even when
    /// the flush fails; the failure is returned to the caller.
    pub async fn close_and_flush(&self, reason: FlushReason) -> Result<u64, SyncError> {
        let mut state = self.state.lock().await;
        let result = if state.schedule.is_dirty() {
            self.flush_locked(&mut state, reason)
        } else {
            Ok(state.version)
        };
        state.closed = true;
        self.timer_wake.notify_one();
        result
    }

    fn flush_locked(&self, state: &mut SessionState, reason: FlushReason) -> Result<u64, SyncError> {
        let snapshot = state.crdt.encode_full();
        let next = state.version + 1;

        match self.store.save(&self.doc_id, &snapshot, next) {
            Ok(()) => {
                state.version = next;
                state.schedule.mark_flushed();
                state.flushes += 1;
                state.consecutive_failures = 0;
                log::debug!(
                    "Flushed {} v{} ({} bytes, {:?})",
                    self.doc_id,
                    next,
                    snapshot.len(),
                    reason
                );
                if std::mem::replace(&mut state.degraded, false) {
                    log::info!("Persistence recovered for {}", self.doc_id);
                    self.send_save_status(&SaveStatus::Saved { version: next });
                }
                Ok(next)
            }
            Err(e) => {
                state.consecutive_failures += 1;
                state.schedule.on_failure(Instant::now(), &self.settings.policy);
                self.timer_wake.notify_one();
                log::warn!(
                    "Flush of {} failed ({} in a row, {:?}): {e}",
                    self.doc_id,
                    state.consecutive_failures,
                    reason
                );
                if !state.degraded
                    && state.consecutive_failures >= self.settings.degraded_after_failures
                {
                    state.degraded = true;
                    self.send_save_status(&SaveStatus::Degraded {
                        failures: state.consecutive_failures,
                        reason: e.to_string(),
                    });
                }
                Err(SyncError::StoreUnavailable(e.to_string()))
            }
        }
    }

    fn send_save_status(&self, status: &SaveStatus) {
        let result = SyncMessage::save_status(self.doc_id.clone(), status)
            .and_then(|msg| self.broadcast.broadcast(Uuid::nil(), &msg));
        if let Err(e) = result {
            log::warn!("Dropping save status on {}: {e}", self.doc_id);
        }
    }

    // ─── Introspection ────────────────────────────────────────────────

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    pub async fn schedule_state(&self) -> ScheduleState {
        self.state.lock().await.schedule.state()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.schedule.is_dirty()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Successful flushes since the session was created.
    pub async fn flush_count(&self) -> u64 {
        self.state.lock().await.flushes
    }

    pub async fn save_status(&self) -> SaveStatus {
        let state = self.state.lock().await;
        if state.degraded {
            SaveStatus::Degraded {
                failures: state.consecutive_failures,
                reason: "store unavailable".to_string(),
            }
        } else {
            SaveStatus::Saved {
                version: state.version,
            }
        }
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    /// Account for frames a lagging connection missed.
    pub(crate) fn record_lag(&self, skipped: u64) {
        self.broadcast.record_lag(skipped);
    }
}
