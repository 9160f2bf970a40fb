//! Binary protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ msg_type │ sender    │ doc_id       │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf-8  │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! `sender` is the connection id that originated the message, or the nil
//! UUID for messages produced by the server itself. CRDT payloads
//! (state vectors and deltas) are passed through untouched in the Yjs v1
//! update encoding.
//!
//! Per-connection ordering:
//! ```text
//! client                         server
//!   │── Auth{user} ───────────────▶│  PermissionGate
//!   │◀──────────── AuthFailed+Close│  (denied / not found)
//!   │◀─────────── Authenticated ───│
//!   │◀─────────── SyncStep1{sv} ───│
//!   │── SyncStep1{sv} ────────────▶│
//!   │◀─────────── SyncStep2{Δ} ────│
//!   │── SyncStep2{Δ} ─────────────▶│  Synced
//!   │◀══════ Update / Awareness ══▶│
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, stable document identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Authenticated user identifier (issued by the external auth layer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector opening the two-step handshake
    SyncStep1 = 1,
    /// Delta answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT delta
    Update = 3,
    /// Presence (cursor, name, colour); never persisted
    Awareness = 4,
    /// Client asks to attach to `doc_id`
    Auth = 5,
    /// Attach accepted
    Authenticated = 6,
    /// Attach refused; the server closes right after
    AuthFailed = 7,
    /// Degraded / recovered persistence indicator
    SaveStatus = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
    /// Orderly close with a reason
    Close = 11,
}

/// Payload of an `Auth` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub user_id: UserId,
}

/// Payload of an `Authenticated` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthReply {
    pub connection_id: Uuid,
    pub user_id: UserId,
    /// Stable display colour (`#rrggbb`) assigned to the user
    pub color: String,
    /// Persisted version the session was seeded from or last flushed
    pub version: u64,
}

/// Payload of a `SaveStatus` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveStatus {
    /// Latest state is durable at this version
    Saved { version: u64 },
    /// Consecutive flushes failed; edits are held in memory and retried
    Degraded { failures: u32, reason: String },
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub sender: Uuid,
    pub doc_id: DocumentId,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, sender: Uuid, doc_id: DocumentId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            sender,
            doc_id,
            payload,
        }
    }

    /// Client request to attach to a document.
    pub fn auth(doc_id: DocumentId, request: &AuthRequest) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Auth, Uuid::nil(), doc_id, encode_payload(request)?))
    }

    /// Server acceptance of an `Auth`.
    pub fn authenticated(doc_id: DocumentId, reply: &AuthReply) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::Authenticated,
            Uuid::nil(),
            doc_id,
            encode_payload(reply)?,
        ))
    }

    /// Server refusal of an `Auth`; the payload is a UTF-8 reason.
    pub fn auth_failed(doc_id: DocumentId, reason: &str) -> Self {
        Self::new(MessageType::AuthFailed, Uuid::nil(), doc_id, reason.as_bytes().to_vec())
    }

    /// Create a sync step 1 (state vector).
    pub fn sync_step1(sender: Uuid, doc_id: DocumentId, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, sender, doc_id, state_vector)
    }

    /// Create a sync step 2 (delta the peer is missing).
    pub fn sync_step2(sender: Uuid, doc_id: DocumentId, delta: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, sender, doc_id, delta)
    }

    /// Create an incremental update.
    pub fn update(sender: Uuid, doc_id: DocumentId, delta: Vec<u8>) -> Self {
        Self::new(MessageType::Update, sender, doc_id, delta)
    }

    /// Create an awareness message from an already-encoded JSON payload.
    pub fn awareness(sender: Uuid, doc_id: DocumentId, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, sender, doc_id, payload)
    }

    /// Create a save status notification.
    pub fn save_status(doc_id: DocumentId, status: &SaveStatus) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::SaveStatus,
            Uuid::nil(),
            doc_id,
            encode_payload(status)?,
        ))
    }

    /// Create a ping message.
    pub fn ping(sender: Uuid) -> Self {
        Self::new(MessageType::Ping, sender, DocumentId::default(), Vec::new())
    }

    /// Create a pong message.
    pub fn pong(sender: Uuid) -> Self {
        Self::new(MessageType::Pong, sender, DocumentId::default(), Vec::new())
    }

    /// Create a close message; the payload is a UTF-8 reason.
    pub fn close(doc_id: DocumentId, reason: &str) -> Self {
        Self::new(MessageType::Close, Uuid::nil(), doc_id, reason.as_bytes().to_vec())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an `Auth` payload.
    pub fn auth_request(&self) -> Result<AuthRequest, ProtocolError> {
        self.expect(MessageType::Auth)?;
        decode_payload(&self.payload)
    }

    /// Parse an `Authenticated` payload.
    pub fn auth_reply(&self) -> Result<AuthReply, ProtocolError> {
        self.expect(MessageType::Authenticated)?;
        decode_payload(&self.payload)
    }

    /// Parse a `SaveStatus` payload.
    pub fn save_status_value(&self) -> Result<SaveStatus, ProtocolError> {
        self.expect(MessageType::SaveStatus)?;
        decode_payload(&self.payload)
    }

    /// Reason text carried by `AuthFailed` and `Close`.
    pub fn reason(&self) -> Result<String, ProtocolError> {
        match self.msg_type {
            MessageType::AuthFailed | MessageType::Close => String::from_utf8(self.payload.clone())
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
            other => Err(ProtocolError::UnexpectedMessage(other)),
        }
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::UnexpectedMessage(self.msg_type));
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
}
