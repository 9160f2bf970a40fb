//! WebSocket sync service with start / stop / status.
//!
//! ```text
//! TcpListener ── accept ──► handle_connection (one task per socket)
//!                              │ Authenticating: first frame must be Auth
//!                              │ registry.attach ──✗──► AuthFailed + Close
//!                              ▼
//!                           serve loop (select!)
//!                              ├── ws frame ─────► Connection::handle ─► replies
//!                              ├── broadcast ────► ws frame
//!                              └── shutdown ─────► Close
//!                              │
//!                              ▼
//!                           registry.detach (always)
//! ```
//!
//! `stop` signals every connection, waits for them to detach (the last
//! one on each document flushes it), then closes whatever sessions remain.
//! Sockets still upgrading or authenticating are dropped on `stop` too.
//!
//! The service does not verify identities. The gate trusts the `user_id`
//! carried by `Auth`, so deployments must put the listener behind a layer
//! (reverse proxy, auth service) that authenticates the user and supplies
//! that id.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::{AccessPolicy, ServerConfig};
use crate::connection::Connection;
use crate::error::SyncError;
use crate::permission::{gate_for, PermissionGate};
use crate::protocol::{DocumentId, MessageType, SyncMessage};
use crate::registry::SessionRegistry;
use crate::storage::{AccessSource, DocumentStore, MemoryStore, RocksStore, StoreConfig};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Administrative view of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub running: bool,
    pub address: Option<SocketAddr>,
    pub connections: usize,
    pub documents: usize,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_attaches: u64,
    pub malformed_messages: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_attaches: AtomicU64,
    malformed_messages: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            rejected_attaches: self.rejected_attaches.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
        }
    }
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Shared state handed to every connection task.
struct Shared {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: AtomicServerStats,
}

/// The sync service.
pub struct SyncService {
    shared: Arc<Shared>,
    running: Mutex<Option<RunningServer>>,
}

impl SyncService {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        gate: Arc<dyn PermissionGate>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::from_config(&config, store, gate));
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                stats: AtomicServerStats::default(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Gate built from `config.access_policy` over `access`.
    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        access: Arc<dyn AccessSource>,
    ) -> Self {
        let gate = gate_for(config.access_policy, access);
        Self::new(config, store, gate)
    }

    /// RocksDB at `config.storage_path`, or an in-memory store when unset.
    pub fn open(config: ServerConfig) -> Result<Self, SyncError> {
        match config.storage_path.clone() {
            Some(path) => {
                let store = Arc::new(RocksStore::open(StoreConfig::new(path))?);
                Ok(Self::with_store(config, store.clone(), store))
            }
            None => {
                log::warn!("No storage path configured; documents live in memory only");
                if config.access_policy == AccessPolicy::Enforce {
                    log::warn!(
                        "In-memory store starts with no documents or grants; every attach is refused under the enforce policy"
                    );
                }
                let store = Arc::new(MemoryStore::new());
                Ok(Self::with_store(config, store.clone(), store))
            }
        }
    }

    /// Bind and start accepting. Returns the bound address; a second call
    /// while running returns the existing one.
    pub async fn start(&self) -> Result<SocketAddr, SyncError> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Ok(server.addr);
        }

        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&self.shared), shutdown_rx));

        log::info!("Sync service listening on {addr}");
        *running = Some(RunningServer {
            addr,
            shutdown,
            accept_task,
        });
        Ok(addr)
    }

    /// Stop accepting, close every connection and flush every session.
    /// Returns the first flush failure, after everything is closed.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let Some(server) = self.running.lock().await.take() else {
            return Ok(());
        };

        log::info!("Sync service on {} stopping", server.addr);
        let _ = server.shutdown.send(true);
        if let Err(e) = server.accept_task.await {
            log::error!("Accept loop ended abnormally: {e}");
        }

        let failures = self.shared.registry.shutdown().await;
        log::info!("Sync service stopped");
        match failures.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn status(&self) -> ServiceStatus {
        let address = self.running.lock().await.as_ref().map(|s| s.addr);
        ServiceStatus {
            running: address.is_some(),
            address,
            connections: self.shared.registry.connection_count().await,
            documents: self.shared.registry.session_count().await,
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats.snapshot()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("New TCP connection from {addr}");
                    let shared = Arc::clone(&shared);
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, shared, shutdown).await {
                            log::debug!("Connection from {addr} ended: {e}");
                        }
                    });
                }
                Err(e) => log::warn!("Accept failed: {e}"),
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }
    drop(listener);
    while tasks.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SyncError> {
    // A socket that never upgrades must not hold up `stop`.
    let ws = tokio::select! {
        upgraded = timeout(shared.config.auth_timeout, tokio_tungstenite::accept_async(stream)) => match upgraded {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return Err(SyncError::Io(e.to_string())),
            Err(_) => {
                log::info!("Connection from {addr} never completed the WebSocket handshake");
                return Err(SyncError::TransportClosed);
            }
        },
        _ = stopping(&mut shutdown) => return Err(SyncError::TransportClosed),
    };
    let (mut sink, mut source) = ws.split();

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let result = authenticate_and_serve(&mut sink, &mut source, addr, &shared, &mut shutdown).await;

    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    let _ = sink.close().await;
    result
}

async fn authenticate_and_serve(
    sink: &mut WsSink,
    source: &mut WsSource,
    addr: SocketAddr,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SyncError> {
    // Authenticating: the first frame must be Auth.
    let first = tokio::select! {
        first = timeout(shared.config.auth_timeout, next_message(source, &shared.stats)) => match first {
            Ok(Some(msg)) => msg,
            Ok(None) => return Err(SyncError::TransportClosed),
            Err(_) => {
                log::info!("Connection from {addr} sent no Auth in time");
                reject(sink, DocumentId::default(), "authentication timeout").await;
                return Err(SyncError::TransportClosed);
            }
        },
        _ = stopping(shutdown) => {
            reject(sink, DocumentId::default(), "server shutting down").await;
            return Err(SyncError::TransportClosed);
        }
    };
    if first.msg_type != MessageType::Auth {
        reject(sink, first.doc_id, "expected auth").await;
        return Err(SyncError::TransportClosed);
    }
    let request = match first.auth_request() {
        Ok(request) => request,
        Err(e) => {
            reject(sink, first.doc_id, "invalid auth").await;
            return Err(e.into());
        }
    };

    let doc_id = first.doc_id;
    let mut conn = match shared.registry.attach(&doc_id, &request.user_id).await {
        Ok(conn) => conn,
        Err(e) => {
            shared.stats.rejected_attaches.fetch_add(1, Ordering::Relaxed);
            log::info!("Attach of {} to {doc_id} from {addr} refused: {e}", request.user_id);
            reject(sink, doc_id, &e.client_reason()).await;
            return Err(e);
        }
    };

    let result = serve(&mut conn, sink, source, shared, shutdown).await;
    if let Err(e) = shared.registry.detach(conn).await {
        log::error!("Detach from {doc_id} reported: {e}");
    }
    result
}

/// Synced loop: relay frames in both directions until either side closes.
async fn serve(
    conn: &mut Connection,
    sink: &mut WsSink,
    source: &mut WsSource,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SyncError> {
    for msg in conn.opening_messages() {
        send(sink, &msg).await?;
    }

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    shared.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    let msg = match SyncMessage::decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            shared.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Undecodable frame from {}: {e}", conn.id());
                            continue;
                        }
                    };
                    match conn.handle(msg).await {
                        Ok(replies) => {
                            for reply in &replies {
                                send(sink, reply).await?;
                            }
                        }
                        Err(SyncError::MalformedDelta(e)) => {
                            shared.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Rejected delta from {}: {e}", conn.id());
                        }
                        Err(SyncError::TransportClosed) => break,
                        Err(e) => log::warn!("Message from {} failed: {e}", conn.id()),
                    }
                    if conn.is_disconnected() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    sink.send(Message::Pong(data)).await.map_err(|_| SyncError::TransportClosed)?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("WebSocket error on {}: {e}", conn.id());
                    break;
                }
            },
            outbound = conn.next_outbound() => match outbound {
                Some(bytes) => {
                    sink.send(Message::Binary(bytes.into()))
                        .await
                        .map_err(|_| SyncError::TransportClosed)?;
                }
                None => break,
            },
            _ = stopping(shutdown) => {
                let _ = send(sink, &SyncMessage::close(conn.doc_id().clone(), "server shutting down")).await;
                break;
            }
        }
    }
    Ok(())
}

/// Resolves once `stop` has been signalled, including before the call.
async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

/// Next decodable protocol message, skipping control frames.
async fn next_message(source: &mut WsSource, stats: &AtomicServerStats) -> Option<SyncMessage> {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                stats.total_messages.fetch_add(1, Ordering::Relaxed);
                stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                match SyncMessage::decode(&data) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Undecodable frame before auth: {e}");
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), SyncError> {
    let bytes = msg.encode()?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|_| SyncError::TransportClosed)
}

/// AuthFailed followed by Close; errors are irrelevant, the socket is going away.
async fn reject(sink: &mut WsSink, doc_id: DocumentId, reason: &str) {
    let _ = send(sink, &SyncMessage::auth_failed(doc_id.clone(), reason)).await;
    let _ = send(sink, &SyncMessage::close(doc_id, reason)).await;
}
