//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real service and connect real clients,
//! verifying attach, the handshake, relay and debounced persistence.

use inkwell_sync::client::{ClientState, SyncClient, SyncEvent};
use inkwell_sync::config::{PersistenceConfig, ServerConfig};
use inkwell_sync::crdt::YrsState;
use inkwell_sync::protocol::{DocumentId, SyncMessage};
use inkwell_sync::server::SyncService;
use inkwell_sync::storage::{DocumentAccess, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};
use yrs::{GetString, Text, Transact, WriteTxn};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16, debounce: Duration) -> ServerConfig {
    ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        broadcast_capacity: 64,
        persistence: PersistenceConfig {
            debounce,
            max_debounce: debounce * 10,
            degraded_after_failures: 3,
        },
        ..ServerConfig::default()
    }
}

/// Start a service on a free port backed by a memory store.
async fn start_test_server_with(debounce: Duration) -> (SyncService, Arc<MemoryStore>, String) {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let service = SyncService::with_store(test_config(port, debounce), store.clone(), store.clone());
    let addr = service.start().await.unwrap();
    (service, store, format!("ws://{addr}"))
}

async fn start_test_server() -> (SyncService, Arc<MemoryStore>, String) {
    start_test_server_with(Duration::from_millis(100)).await
}

/// Create an empty public document.
fn seed(store: &MemoryStore, doc: &str) {
    let doc_id = DocumentId::new(doc);
    store.create_document(&doc_id).unwrap();
    store
        .put_access(&doc_id, DocumentAccess::private("owner").public())
        .unwrap();
}

/// Wait for the first event matching `pred`, skipping the rest.
async fn wait_for<F>(rx: &mut mpsc::Receiver<SyncEvent>, pred: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Connect and wait for the server state to be applied locally.
async fn connect_synced(url: &str, user: &str, doc: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(user, doc, url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut rx, |e| matches!(e, SyncEvent::StateSynced)).await;
    (client, rx)
}

async fn replica_text(client: &SyncClient) -> String {
    let replica = client.replica();
    let replica = replica.lock().await;
    let text = replica.doc().get_or_insert_text("content");
    let txn = replica.doc().transact();
    text.get_string(&txn)
}

fn snapshot_text(snapshot: &[u8]) -> String {
    let state = YrsState::from_snapshot(snapshot).unwrap();
    let text = state.doc().get_or_insert_text("content");
    let txn = state.doc().transact();
    text.get_string(&txn)
}

/// Poll the store until `pred` holds for `doc`.
async fn wait_for_store<F>(store: &MemoryStore, doc: &str, pred: F)
where
    F: Fn(u64, &str) -> bool,
{
    let doc_id = DocumentId::new(doc);
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(persisted) = store.get(&doc_id) {
            if pred(persisted.version, &snapshot_text(&persisted.content)) {
                return;
            }
        }
        assert!(Instant::now() < deadline, "store never reached the expected state");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (service, _store, url) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_authenticates_with_color() {
    let (service, store, url) = start_test_server().await;
    seed(&store, "d1");

    let mut client = SyncClient::new("alice", "d1", &url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match wait_for(&mut rx, |e| matches!(e, SyncEvent::Authenticated(_))).await {
        SyncEvent::Authenticated(reply) => {
            assert_eq!(reply.user_id.as_str(), "alice");
            assert_eq!(reply.color, "#ef4444");
            assert_eq!(reply.version, 1);
            assert_eq!(client.connection_id().await, Some(reply.connection_id));
        }
        other => panic!("Expected Authenticated, got {other:?}"),
    }
    wait_for(&mut rx, |e| matches!(e, SyncEvent::StateSynced)).await;
    assert_eq!(client.connection_state().await, ClientState::Synced);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_clients_edit_and_persist() {
    let (service, store, url) = start_test_server().await;
    seed(&store, "d1");

    let (a, mut a_rx) = connect_synced(&url, "alice", "d1").await;
    a.edit(|txn| {
        let text = txn.get_or_insert_text("content");
        text.insert(txn, 0, "hello");
    })
    .await
    .unwrap();

    // Give the update time to reach the session before B attaches.
    sleep(Duration::from_millis(50)).await;

    let (b, _b_rx) = connect_synced(&url, "bob", "d1").await;
    assert_eq!(replica_text(&b).await, "hello");

    b.edit(|txn| {
        let text = txn.get_or_insert_text("content");
        text.push(txn, " world");
    })
    .await
    .unwrap();

    wait_for(&mut a_rx, |e| matches!(e, SyncEvent::RemoteUpdate { .. })).await;
    assert_eq!(replica_text(&a).await, "hello world");

    wait_for_store(&store, "d1", |version, text| version >= 2 && text == "hello world").await;

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_edits_are_debounced_into_one_save() {
    let (service, store, url) = start_test_server_with(Duration::from_millis(300)).await;
    seed(&store, "d1");

    let (a, _rx) = connect_synced(&url, "alice", "d1").await;
    let saves_before = store.save_count();
    for i in 0..10 {
        a.edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.push(txn, &i.to_string());
        })
        .await
        .unwrap();
    }

    wait_for_store(&store, "d1", |_, text| text == "0123456789").await;
    sleep(Duration::from_millis(400)).await;
    assert!(store.save_count() - saves_before <= 2);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_auth_failed_for_unknown_document() {
    let (service, _store, url) = start_test_server().await;

    let mut client = SyncClient::new("alice", "missing", &url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match wait_for(&mut rx, |e| matches!(e, SyncEvent::AuthFailed(_))).await {
        SyncEvent::AuthFailed(reason) => assert_eq!(reason, "document not found"),
        other => panic!("Expected AuthFailed, got {other:?}"),
    }
    wait_for(&mut rx, |e| matches!(e, SyncEvent::Disconnected)).await;
    assert_eq!(client.connection_state().await, ClientState::Rejected);
    assert_eq!(service.stats().rejected_attaches, 1);
    assert_eq!(service.status().await.documents, 0);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_auth_failed_for_denied_user() {
    let (service, store, url) = start_test_server().await;
    let doc_id = DocumentId::new("d1");
    store.create_document(&doc_id).unwrap();
    store
        .put_access(&doc_id, DocumentAccess::private("alice").with_collaborator("bob"))
        .unwrap();

    let (_bob, _rx) = connect_synced(&url, "bob", "d1").await;

    let mut mallory = SyncClient::new("mallory", "d1", &url);
    let mut rx = mallory.take_event_rx().unwrap();
    mallory.connect().await.unwrap();
    match wait_for(&mut rx, |e| matches!(e, SyncEvent::AuthFailed(_))).await {
        SyncEvent::AuthFailed(reason) => assert_eq!(reason, "permission denied"),
        other => panic!("Expected AuthFailed, got {other:?}"),
    }

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_first_frame_must_be_auth() {
    let (service, store, url) = start_test_server().await;
    seed(&store, "d1");

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let ping = SyncMessage::ping(uuid::Uuid::nil()).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let frame = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let msg = match frame {
        Message::Binary(data) => SyncMessage::decode(&data).unwrap(),
        other => panic!("Expected binary frame, got {other:?}"),
    };
    assert_eq!(msg.reason().unwrap(), "expected auth");

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_awareness_relay_adds_color() {
    let (service, store, url) = start_test_server().await;
    seed(&store, "d1");

    let (alice, _a_rx) = connect_synced(&url, "alice", "d1").await;
    let (_bob, mut b_rx) = connect_synced(&url, "bob", "d1").await;

    alice
        .send_awareness(Some(&serde_json::json!({ "cursor": 3 })))
        .await
        .unwrap();

    match wait_for(&mut b_rx, |e| matches!(e, SyncEvent::RemoteAwareness(_))).await {
        SyncEvent::RemoteAwareness(update) => {
            assert_eq!(update.user_id.as_str(), "alice");
            let state = update.state.unwrap();
            assert_eq!(state["cursor"], 3);
            assert_eq!(state["color"], "#ef4444");
        }
        other => panic!("Expected RemoteAwareness, got {other:?}"),
    }

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_leaving_peer_presence_is_removed() {
    let (service, store, url) = start_test_server().await;
    seed(&store, "d1");

    let (mut alice, _a_rx) = connect_synced(&url, "alice", "d1").await;
    let (_bob, mut b_rx) = connect_synced(&url, "bob", "d1").await;

    alice
        .send_awareness(Some(&serde_json::json!({ "cursor": 1 })))
        .await
        .unwrap();
    wait_for(&mut b_rx, |e| matches!(e, SyncEvent::RemoteAwareness(u) if u.state.is_some())).await;

    alice.disconnect();
    match wait_for(&mut b_rx, |e| matches!(e, SyncEvent::RemoteAwareness(u) if u.state.is_none())).await {
        SyncEvent::RemoteAwareness(update) => assert_eq!(update.user_id.as_str(), "alice"),
        other => panic!("Expected removal, got {other:?}"),
    }

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_update_keeps_connection() {
    let (service, store, url) = start_test_server().await;
    seed(&store, "d1");

    let (client, mut rx) = connect_synced(&url, "alice", "d1").await;
    client.send_update(vec![0x02, 0x81]).await.unwrap();
    client.send_ping().await.unwrap();

    wait_for(&mut rx, |e| matches!(e, SyncEvent::Pong)).await;
    assert_eq!(client.connection_state().await, ClientState::Synced);
    assert_eq!(service.stats().malformed_messages, 1);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_tracks_connections_and_documents() {
    let (service, store, url) = start_test_server().await;
    seed(&store, "d1");
    seed(&store, "d2");

    let (mut a, _a_rx) = connect_synced(&url, "alice", "d1").await;
    let (mut b, _b_rx) = connect_synced(&url, "bob", "d1").await;
    let (mut c, _c_rx) = connect_synced(&url, "carol", "d2").await;

    let status = service.status().await;
    assert!(status.running);
    assert_eq!(status.connections, 3);
    assert_eq!(status.documents, 2);
    assert_eq!(service.stats().total_connections, 3);

    a.disconnect();
    b.disconnect();
    c.disconnect();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let status = service.status().await;
        if status.connections == 0 && status.documents == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "sessions were not evicted: {status:?}");
        sleep(Duration::from_millis(20)).await;
    }

    service.stop().await.unwrap();
    assert!(!service.status().await.running);
}

/// Poll status until no session is left open.
async fn wait_for_eviction(service: &SyncService) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while service.status().await.documents != 0 {
        assert!(Instant::now() < deadline, "session was not evicted");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_reader_session_does_not_save() {
    let (service, store, url) = start_test_server().await;
    seed(&store, "d1");

    let (mut writer, _w_rx) = connect_synced(&url, "alice", "d1").await;
    writer
        .edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, "written once");
        })
        .await
        .unwrap();
    wait_for_store(&store, "d1", |_, text| text == "written once").await;
    writer.disconnect();
    wait_for_eviction(&service).await;

    let saves = store.save_count();
    let version = store.get(&DocumentId::new("d1")).unwrap().version;

    // Reader's SyncStep2 reply carries nothing the server lacks.
    let (mut reader, _r_rx) = connect_synced(&url, "bob", "d1").await;
    assert_eq!(replica_text(&reader).await, "written once");
    sleep(Duration::from_millis(300)).await;
    reader.disconnect();
    wait_for_eviction(&service).await;

    assert_eq!(store.save_count(), saves);
    assert_eq!(store.get(&DocumentId::new("d1")).unwrap().version, version);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_flushes_pending_edits() {
    let (service, store, url) = start_test_server_with(Duration::from_secs(30)).await;
    seed(&store, "d1");

    let (client, mut rx) = connect_synced(&url, "alice", "d1").await;
    client
        .edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, "unsaved");
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(snapshot_text(&store.get(&DocumentId::new("d1")).unwrap().content), "");

    service.stop().await.unwrap();

    let persisted = store.get(&DocumentId::new("d1")).unwrap();
    assert_eq!(snapshot_text(&persisted.content), "unsaved");
    assert!(persisted.version >= 2);

    match wait_for(&mut rx, |e| matches!(e, SyncEvent::Closed(_))).await {
        SyncEvent::Closed(reason) => assert_eq!(reason, "server shutting down"),
        other => panic!("Expected Closed, got {other:?}"),
    }
}
