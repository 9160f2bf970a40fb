//! Persistence integration tests.
//!
//! Verifies:
//! - Edits made over WebSocket survive a service restart on RocksDB
//! - Versions only move forward across sessions
//! - Documents stay isolated from each other
//! - A reopened database serves what the previous process flushed

use inkwell_sync::client::{SyncClient, SyncEvent};
use inkwell_sync::config::{PersistenceConfig, ServerConfig};
use inkwell_sync::crdt::YrsState;
use inkwell_sync::protocol::DocumentId;
use inkwell_sync::server::SyncService;
use inkwell_sync::storage::{DocumentAccess, DocumentStore, RocksStore, StoreConfig, StoreError};

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};
use yrs::{GetString, Text, Transact, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

/// Reopen once the previous handle's background tasks have let go of the lock.
async fn reopen_store(path: &Path) -> Arc<RocksStore> {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match RocksStore::open(StoreConfig::for_testing(path)) {
            Ok(store) => return Arc::new(store),
            Err(e) if Instant::now() < deadline => {
                log::debug!("store still locked: {e}");
                sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("could not reopen store: {e}"),
        }
    }
}

fn seed(store: &RocksStore, doc: &str) {
    let doc_id = DocumentId::new(doc);
    store.create_document(&doc_id).unwrap();
    store.put_access(&doc_id, &DocumentAccess::private(doc)).unwrap();
}

async fn start_service(store: Arc<RocksStore>) -> (SyncService, String) {
    let config = ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        persistence: PersistenceConfig {
            debounce: Duration::from_millis(50),
            max_debounce: Duration::from_millis(500),
            degraded_after_failures: 3,
        },
        ..ServerConfig::default()
    };
    let service = SyncService::with_store(config, store.clone(), store);
    let addr = service.start().await.unwrap();
    (service, format!("ws://{addr}"))
}

async fn connect_synced(url: &str, user: &str, doc: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(user, doc, url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    timeout(Duration::from_secs(3), async {
        while let Some(event) = rx.recv().await {
            if matches!(event, SyncEvent::StateSynced) {
                return;
            }
        }
        panic!("disconnected before sync");
    })
    .await
    .expect("timed out waiting for sync");
    (client, rx)
}

async fn append(client: &SyncClient, chunk: &str) {
    client
        .edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.push(txn, chunk);
        })
        .await
        .unwrap();
}

async fn replica_text(client: &SyncClient) -> String {
    let replica = client.replica();
    let replica = replica.lock().await;
    let text = replica.doc().get_or_insert_text("content");
    let txn = replica.doc().transact();
    text.get_string(&txn)
}

fn stored_text(store: &RocksStore, doc: &str) -> (u64, String) {
    let persisted = store.load(&DocumentId::new(doc)).unwrap();
    let state = YrsState::from_snapshot(&persisted.content).unwrap();
    let text = state.doc().get_or_insert_text("content");
    let txn = state.doc().transact();
    (persisted.version, text.get_string(&txn))
}

// ─── Restart ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_edits_survive_service_restart() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    seed(&store, "notes");

    let (service, url) = start_service(store.clone()).await;
    let (client, _rx) = connect_synced(&url, "notes", "notes").await;
    append(&client, "Hello, persistence world!").await;
    sleep(Duration::from_millis(50)).await;
    service.stop().await.unwrap();

    let (version, text) = stored_text(&store, "notes");
    assert_eq!(text, "Hello, persistence world!");
    assert!(version >= 2);

    let (service, url) = start_service(store.clone()).await;
    let (client, _rx) = connect_synced(&url, "notes", "notes").await;
    assert_eq!(replica_text(&client).await, "Hello, persistence world!");
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_versions_increase_across_sessions() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    seed(&store, "log");

    let mut last_version = stored_text(&store, "log").0;
    for i in 0..3 {
        let (service, url) = start_service(store.clone()).await;
        let (client, _rx) = connect_synced(&url, "log", "log").await;
        append(&client, &format!("[{i}]")).await;
        sleep(Duration::from_millis(50)).await;
        service.stop().await.unwrap();

        let (version, _) = stored_text(&store, "log");
        assert!(version > last_version, "version {version} did not advance past {last_version}");
        last_version = version;
    }
    assert_eq!(stored_text(&store, "log").1, "[0][1][2]");
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    seed(&store, "left");
    seed(&store, "right");

    let (service, url) = start_service(store.clone()).await;
    let (left, _l) = connect_synced(&url, "left", "left").await;
    let (right, _r) = connect_synced(&url, "right", "right").await;
    append(&left, "L").await;
    append(&right, "R").await;
    sleep(Duration::from_millis(50)).await;
    service.stop().await.unwrap();

    assert_eq!(stored_text(&store, "left").1, "L");
    assert_eq!(stored_text(&store, "right").1, "R");
}

#[tokio::test]
async fn test_deleted_document_is_not_resurrected() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    seed(&store, "gone");

    let (service, url) = start_service(store.clone()).await;
    let (client, _rx) = connect_synced(&url, "gone", "gone").await;
    store.delete_document(&DocumentId::new("gone")).unwrap();
    append(&client, "late edit").await;
    sleep(Duration::from_millis(50)).await;

    // Flushes fail from here on; the failure is logged by the eviction.
    let _ = service.stop().await;
    assert!(matches!(
        store.load(&DocumentId::new("gone")),
        Err(StoreError::NotFound(_))
    ));
}

// ─── Reopen ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reopened_database_serves_flushed_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let store = open_store(&path);
        seed(&store, "draft");
        let (service, url) = start_service(store.clone()).await;
        let (client, _rx) = connect_synced(&url, "draft", "draft").await;
        append(&client, "written before restart").await;
        sleep(Duration::from_millis(50)).await;
        service.stop().await.unwrap();
        store.sync().unwrap();
    }

    let store = reopen_store(&path).await;
    assert_eq!(store.list_documents().unwrap(), vec![DocumentId::new("draft")]);
    assert_eq!(stored_text(&store, "draft").1, "written before restart");

    let (service, url) = start_service(store.clone()).await;
    let (client, _rx) = connect_synced(&url, "draft", "draft").await;
    assert_eq!(replica_text(&client).await, "written before restart");
    service.stop().await.unwrap();
}
