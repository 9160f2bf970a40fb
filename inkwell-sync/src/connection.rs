//! Per-client sync state machine.
//!
//! ```text
//! Connecting ──transport up──► Authenticating ──gate passes──► Syncing
//!                                   │                             │ both SyncStep2
//!                                   │ denied / not found          ▼ exchanged
//!                                   └──────────► Disconnected ◄── Synced
//!                                                     ▲  transport close
//! ```
//!
//! The service owns the first two states (no session exists yet). A
//! [`Connection`] is created by the registry once the attach succeeded and
//! starts in `Syncing` with its opening messages queued.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::awareness::user_color;
use crate::broadcast::Outbound;
use crate::error::SyncError;
use crate::protocol::{AuthReply, DocumentId, MessageType, SyncMessage, UserId};
use crate::session::DocumentSession;

/// Sync progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Connecting,
    Authenticating,
    Syncing,
    Synced,
    Disconnected,
}

/// One client's live attachment to a document session.
pub struct Connection {
    id: Uuid,
    user_id: UserId,
    color: &'static str,
    session: Arc<DocumentSession>,
    state: SyncState,
    /// We answered the client's SyncStep1.
    step2_sent: bool,
    /// The client answered our SyncStep1.
    step2_received: bool,
    receiver: broadcast::Receiver<Arc<Outbound>>,
    opening: Vec<SyncMessage>,
}

impl Connection {
    /// Join `session` and queue Authenticated, our SyncStep1 and the
    /// current awareness of the other connections.
    pub(crate) async fn open(session: Arc<DocumentSession>, user_id: UserId) -> Result<Self, SyncError> {
        let id = Uuid::new_v4();
        let color = user_color(&user_id);
        let ticket = session.join(id, user_id.clone(), color).await?;
        let doc_id = session.doc_id().clone();

        let reply = AuthReply {
            connection_id: id,
            user_id: user_id.clone(),
            color: color.to_string(),
            version: ticket.version,
        };
        let mut opening = vec![
            SyncMessage::authenticated(doc_id.clone(), &reply)?,
            SyncMessage::sync_step1(Uuid::nil(), doc_id.clone(), ticket.state_vector),
        ];
        for update in &ticket.awareness {
            opening.push(SyncMessage::awareness(
                update.connection_id,
                doc_id.clone(),
                update.encode()?,
            ));
        }

        log::info!("User {user_id} attached to {doc_id} as {id}");

        Ok(Self {
            id,
            user_id,
            color,
            session,
            state: SyncState::Syncing,
            step2_sent: false,
            step2_received: false,
            receiver: ticket.receiver,
            opening,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn color(&self) -> &'static str {
        self.color
    }

    pub fn doc_id(&self) -> &DocumentId {
        self.session.doc_id()
    }

    pub fn session(&self) -> &Arc<DocumentSession> {
        &self.session
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Messages to send right after attaching. Empty on later calls.
    pub fn opening_messages(&mut self) -> Vec<SyncMessage> {
        std::mem::take(&mut self.opening)
    }

    /// Process one client message and return the direct replies.
    ///
    /// `MalformedDelta` leaves the connection usable; the caller decides
    /// whether to keep reading.
    pub async fn handle(&mut self, msg: SyncMessage) -> Result<Vec<SyncMessage>, SyncError> {
        if self.state == SyncState::Disconnected {
            return Err(SyncError::TransportClosed);
        }

        let is_doc_message = !matches!(msg.msg_type, MessageType::Ping | MessageType::Close);
        if is_doc_message && &msg.doc_id != self.doc_id() {
            log::warn!(
                "Connection {} sent {:?} for {} while attached to {}",
                self.id,
                msg.msg_type,
                msg.doc_id,
                self.doc_id()
            );
            return Ok(Vec::new());
        }

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let delta = self.session.encode_delta_for(&msg.payload).await;
                self.step2_sent = true;
                self.advance();
                Ok(vec![SyncMessage::sync_step2(Uuid::nil(), self.doc_id().clone(), delta)])
            }
            MessageType::SyncStep2 => {
                self.session.apply_update(self.id, &msg.payload).await?;
                self.step2_received = true;
                self.advance();
                Ok(Vec::new())
            }
            MessageType::Update => {
                self.session.apply_update(self.id, &msg.payload).await?;
                Ok(Vec::new())
            }
            MessageType::Awareness => {
                if let Err(e) = self.session.set_awareness(self.id, &msg.payload).await {
                    log::warn!("Ignoring awareness from {}: {e}", self.id);
                }
                Ok(Vec::new())
            }
            MessageType::Ping => Ok(vec![SyncMessage::pong(Uuid::nil())]),
            MessageType::Close => {
                self.state = SyncState::Disconnected;
                Ok(Vec::new())
            }
            other => {
                log::debug!("Unhandled message type from {}: {other:?}", self.id);
                Ok(Vec::new())
            }
        }
    }

    fn advance(&mut self) {
        if self.state == SyncState::Syncing && self.step2_sent && self.step2_received {
            self.state = SyncState::Synced;
            log::debug!("Connection {} synced on {}", self.id, self.doc_id());
        }
    }

    /// Next encoded frame from the other connections, or `None` once the
    /// session's channel is gone. Our own frames are skipped. A lagging
    /// receiver gets a full-state SyncStep2 in place of what it missed.
    pub async fn next_outbound(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) if frame.origin == self.id => continue,
                Ok(frame) => return Some(frame.bytes.clone()),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Connection {} lagged by {skipped} messages; resyncing", self.id);
                    self.session.record_lag(skipped);
                    let full = self.session.encode_full().await;
                    let msg = SyncMessage::sync_step2(Uuid::nil(), self.doc_id().clone(), full);
                    match msg.encode() {
                        Ok(bytes) => return Some(bytes),
                        Err(e) => {
                            log::error!("Failed to encode resync for {}: {e}", self.id);
                            continue;
                        }
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Mark the connection gone. The registry calls this from `detach`.
    pub(crate) fn disconnect(&mut self) {
        self.state = SyncState::Disconnected;
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == SyncState::Disconnected
    }
}
