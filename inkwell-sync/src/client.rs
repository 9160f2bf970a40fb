//! WebSocket sync client.
//!
//! Keeps a local [`YrsState`] replica in step with the service:
//! - sends `Auth`, then runs the two-step handshake from its side
//! - applies remote updates and relays local edits
//! - surfaces awareness, save status and close reasons as [`SyncEvent`]s

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::TransactionMut;

use crate::awareness::AwarenessUpdate;
use crate::crdt::{CrdtState, YrsState};
use crate::protocol::{
    AuthReply, AuthRequest, DocumentId, MessageType, ProtocolError, SaveStatus, SyncMessage, UserId,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    /// Authenticated; handshake in progress
    Syncing,
    /// Server state received and our missing changes sent
    Synced,
    /// Attach refused (not found / denied / full)
    Rejected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Authenticated(AuthReply),
    AuthFailed(String),
    /// Server's SyncStep2 applied to the local replica
    StateSynced,
    /// Another connection's delta, already applied locally
    RemoteUpdate { origin: Uuid, delta: Vec<u8> },
    RemoteAwareness(AwarenessUpdate),
    SaveStatus(SaveStatus),
    Pong,
    /// Server closed the session with a reason
    Closed(String),
    Disconnected,
}

/// The sync client.
pub struct SyncClient {
    user_id: UserId,
    doc_id: DocumentId,
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    connection_id: Arc<RwLock<Option<Uuid>>>,
    replica: Arc<Mutex<YrsState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(user_id: impl Into<UserId>, doc_id: impl Into<DocumentId>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            doc_id: doc_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            connection_id: Arc::new(RwLock::new(None)),
            replica: Arc::new(Mutex::new(YrsState::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket, send `Auth` and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ClientState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let auth = SyncMessage::auth(
            self.doc_id.clone(),
            &AuthRequest {
                user_id: self.user_id.clone(),
            },
        )?;
        out_tx
            .send(auth.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Reader task: drive the handshake and apply remote changes
        let reader = Reader {
            doc_id: self.doc_id.clone(),
            state: self.state.clone(),
            connection_id: self.connection_id.clone(),
            replica: self.replica.clone(),
            out_tx: out_tx.downgrade(),
            event_tx: self.event_tx.clone(),
        };
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) => {
                            if !reader.handle(msg).await {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader.finish().await;
        });

        Ok(())
    }

    /// Drop the outgoing channel; the writer closes the socket.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    /// Run a local edit, then send the resulting delta as an `Update`.
    pub async fn edit<F>(&self, f: F) -> Result<Vec<u8>, ProtocolError>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let delta = self.replica.lock().await.edit(f);
        self.send_update(delta.clone()).await?;
        Ok(delta)
    }

    /// Send raw delta bytes as an `Update`.
    pub async fn send_update(&self, delta: Vec<u8>) -> Result<(), ProtocolError> {
        let sender = self.connection_id().await.unwrap_or_else(Uuid::nil);
        self.send(&SyncMessage::update(sender, self.doc_id.clone(), delta)).await
    }

    /// Publish presence; `None` clears it.
    pub async fn send_awareness(&self, state: Option<&serde_json::Value>) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(&state).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let sender = self.connection_id().await.unwrap_or_else(Uuid::nil);
        self.send(&SyncMessage::awareness(sender, self.doc_id.clone(), payload)).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let sender = self.connection_id().await.unwrap_or_else(Uuid::nil);
        self.send(&SyncMessage::ping(sender)).await
    }

    /// Send an arbitrary frame, bypassing message construction.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(bytes).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        self.send_raw(msg.encode()?).await
    }

    pub async fn connection_state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Id assigned by the server in `Authenticated`.
    pub async fn connection_id(&self) -> Option<Uuid> {
        *self.connection_id.read().await
    }

    /// Local replica.
    pub fn replica(&self) -> Arc<Mutex<YrsState>> {
        self.replica.clone()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// State shared with the reader task.
struct Reader {
    doc_id: DocumentId,
    state: Arc<RwLock<ClientState>>,
    connection_id: Arc<RwLock<Option<Uuid>>>,
    replica: Arc<Mutex<YrsState>>,
    /// Weak so that `disconnect` alone shuts the writer down
    out_tx: mpsc::WeakSender<Vec<u8>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Reader {
    /// Returns false when the server ended the session.
    async fn handle(&self, msg: SyncMessage) -> bool {
        let event = match msg.msg_type {
            MessageType::Authenticated => match msg.auth_reply() {
                Ok(reply) => {
                    *self.connection_id.write().await = Some(reply.connection_id);
                    *self.state.write().await = ClientState::Syncing;
                    let sv = self.replica.lock().await.state_vector();
                    self.reply(SyncMessage::sync_step1(reply.connection_id, self.doc_id.clone(), sv))
                        .await;
                    Some(SyncEvent::Authenticated(reply))
                }
                Err(e) => {
                    log::warn!("Bad Authenticated payload: {e}");
                    None
                }
            },
            MessageType::AuthFailed => {
                *self.state.write().await = ClientState::Rejected;
                Some(SyncEvent::AuthFailed(msg.reason().unwrap_or_default()))
            }
            MessageType::SyncStep1 => {
                let delta = {
                    let replica = self.replica.lock().await;
                    replica
                        .encode_delta(&msg.payload)
                        .unwrap_or_else(|_| replica.encode_full())
                };
                let sender = self.connection_id.read().await.unwrap_or_else(Uuid::nil);
                self.reply(SyncMessage::sync_step2(sender, self.doc_id.clone(), delta))
                    .await;
                None
            }
            MessageType::SyncStep2 => {
                if let Err(e) = self.replica.lock().await.apply_delta(&msg.payload) {
                    log::warn!("Server state rejected: {e}");
                    return true;
                }
                let mut state = self.state.write().await;
                if *state == ClientState::Syncing {
                    *state = ClientState::Synced;
                }
                Some(SyncEvent::StateSynced)
            }
            MessageType::Update => match self.replica.lock().await.apply_delta(&msg.payload) {
                Ok(_) => Some(SyncEvent::RemoteUpdate {
                    origin: msg.sender,
                    delta: msg.payload,
                }),
                Err(e) => {
                    log::warn!("Remote update rejected: {e}");
                    None
                }
            },
            MessageType::Awareness => AwarenessUpdate::decode(&msg.payload)
                .ok()
                .map(SyncEvent::RemoteAwareness),
            MessageType::SaveStatus => msg.save_status_value().ok().map(SyncEvent::SaveStatus),
            MessageType::Pong => Some(SyncEvent::Pong),
            MessageType::Close => {
                let _ = self
                    .event_tx
                    .send(SyncEvent::Closed(msg.reason().unwrap_or_default()))
                    .await;
                return false;
            }
            other => {
                log::debug!("Unhandled message type from server: {other:?}");
                None
            }
        };

        if let Some(event) = event {
            let _ = self.event_tx.send(event).await;
        }
        true
    }

    async fn reply(&self, msg: SyncMessage) {
        let Some(tx) = self.out_tx.upgrade() else {
            return;
        };
        match msg.encode() {
            Ok(bytes) => {
                let _ = tx.send(bytes).await;
            }
            Err(e) => log::error!("Failed to encode reply: {e}"),
        }
    }

    async fn finish(self) {
        {
            let mut state = self.state.write().await;
            if *state != ClientState::Rejected {
                *state = ClientState::Disconnected;
            }
        }
        let _ = self.event_tx.send(SyncEvent::Disconnected).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("alice", "d1", "ws://localhost:1234");
        assert_eq!(client.user_id().as_str(), "alice");
        assert_eq!(client.doc_id().as_str(), "d1");
        assert_eq!(client.server_url(), "ws://localhost:1234");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("alice", "d1", "ws://localhost:1234");
        assert_eq!(client.connection_state().await, ClientState::Disconnected);
        assert_eq!(client.connection_id().await, None);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = SyncClient::new("alice", "d1", "ws://localhost:1234");
        assert_eq!(client.send_ping().await, Err(ProtocolError::ConnectionClosed));
        assert!(client.send_update(vec![1, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new("alice", "d1", format!("ws://127.0.0.1:{port}"));
        assert!(matches!(client.connect().await, Err(ProtocolError::Transport(_))));
        assert_eq!(client.connection_state().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("alice", "d1", "ws://localhost:1234");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
