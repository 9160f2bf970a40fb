//! # inkwell-sync: Collaborative document synchronization engine
//!
//! Keeps many clients editing one document in step over WebSocket and
//! persists the merged CRDT state without write storms.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncService      │
//! │ (per user)  │     Binary Proto    │ (accept loop)    │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │ attach / detach
//!                                              ▼
//!                                     ┌──────────────────┐    PermissionGate
//!                                     │ SessionRegistry  │ ◄── (owner / collab
//!                                     └────────┬─────────┘      / public)
//!                                              │ one per document
//!                                              ▼
//!                                     ┌──────────────────┐
//!                                     │ DocumentSession  │── BroadcastGroup
//!                                     │  CrdtState (yrs) │
//!                                     │  FlushSchedule   │── DocumentStore
//!                                     └──────────────────┘   (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`crdt`]: Opaque CRDT replica interface and the `yrs` implementation
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`awareness`]: Presence payloads and user colours
//! - [`broadcast`]: Per-document fan-out with backpressure
//! - [`connection`]: Per-client sync state machine
//! - [`session`]: Live in-memory document with flush bookkeeping
//! - [`scheduler`]: Debounce / max-debounce flush policy
//! - [`registry`]: Document id → session map with single-creator attach
//! - [`permission`]: Access checks on attach
//! - [`storage`]: Load/save contract, RocksDB and in-memory stores
//! - [`server`]: WebSocket service with start/stop/status
//! - [`client`]: WebSocket sync client

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod crdt;
pub mod error;
pub mod permission;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{user_color, AwarenessError, AwarenessUpdate};
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound};
pub use client::{ClientState, SyncClient, SyncEvent};
pub use config::{AccessPolicy, ConfigError, PersistenceConfig, ServerConfig};
pub use connection::{Connection, SyncState};
pub use crdt::{AppliedDelta, CrdtError, CrdtState, YrsState};
pub use error::SyncError;
pub use permission::{gate_for, Access, AclGate, AllowAll, PermissionGate, Permissive};
pub use protocol::{
    AuthReply, AuthRequest, DocumentId, MessageType, ProtocolError, SaveStatus, SyncMessage,
    UserId,
};
pub use registry::SessionRegistry;
pub use scheduler::{FlushPolicy, FlushReason, FlushSchedule, ScheduleState};
pub use server::{ServerStats, ServiceStatus, SyncService};
pub use session::{DocumentSession, JoinTicket, SessionSettings};
pub use storage::{
    AccessSource, DocumentAccess, DocumentMetadata, DocumentStore, MemoryStore,
    PersistedDocument, RocksStore, StoreConfig, StoreError,
};
