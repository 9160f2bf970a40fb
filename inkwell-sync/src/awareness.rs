//! Presence ("awareness") payloads.
//!
//! Awareness is ephemeral: cursor, selection, display name and colour.
//! It is relayed to the other connections of a session and handed to
//! newcomers as a snapshot, but it is never written to the store.
//!
//! ```text
//! client ── Awareness{ state JSON } ──▶ server
//!                                         │ size / shape check
//!                                         │ stamp connection + user
//!                                         │ fill "color" if absent
//!                                         ▼
//!                          Awareness{ AwarenessUpdate JSON } ──▶ peers
//! ```
//!
//! The state is arbitrary client JSON, so payloads are encoded with
//! `serde_json` rather than bincode.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{ProtocolError, UserId};

/// Palette user colours are picked from.
pub const USER_COLORS: [&str; 8] = [
    "#ef4444", "#f97316", "#eab308", "#22c55e", "#06b6d4", "#3b82f6", "#8b5cf6", "#ec4899",
];

/// Stable display colour for a user.
///
/// The hash is a 31-multiplier rolling hash over UTF-16 code units with
/// 32-bit wrapping, so the same id maps to the same colour as in browser
/// clients that compute it locally.
pub fn user_color(user: &UserId) -> &'static str {
    let hash = user
        .as_str()
        .encode_utf16()
        .fold(0i32, |acc, unit| {
            (acc << 5).wrapping_sub(acc).wrapping_add(i32::from(unit))
        });
    USER_COLORS[(hash.unsigned_abs() % USER_COLORS.len() as u32) as usize]
}

/// Presence change for one connection, as relayed to peers.
///
/// `state == None` means the connection left (or cleared its presence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub connection_id: Uuid,
    pub user_id: UserId,
    pub state: Option<Value>,
}

impl AwarenessUpdate {
    pub fn new(connection_id: Uuid, user_id: UserId, state: Option<Value>) -> Self {
        Self {
            connection_id,
            user_id,
            state,
        }
    }

    /// Removal notice sent when a connection detaches.
    pub fn removed(connection_id: Uuid, user_id: UserId) -> Self {
        Self::new(connection_id, user_id, None)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Rejected awareness payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AwarenessError {
    #[error("awareness payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("awareness payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("awareness state must be a JSON object or null")]
    NotAnObject,
}

/// Validate a client's awareness payload and fill in its colour.
///
/// Returns `None` for an explicit `null` (presence cleared).
pub fn parse_local_state(
    payload: &[u8],
    color: &str,
    max_bytes: usize,
) -> Result<Option<Value>, AwarenessError> {
    if payload.len() > max_bytes {
        return Err(AwarenessError::TooLarge {
            len: payload.len(),
            max: max_bytes,
        });
    }

    let value: Value =
        serde_json::from_slice(payload).map_err(|e| AwarenessError::InvalidJson(e.to_string()))?;

    match value {
        Value::Null => Ok(None),
        Value::Object(mut map) => {
            map.entry("color")
                .or_insert_with(|| Value::String(color.to_string()));
            Ok(Some(Value::Object(map)))
        }
        _ => Err(AwarenessError::NotAnObject),
    }
}
