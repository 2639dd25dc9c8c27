//! Persistence integration tests over the RocksDB backend.
//!
//! Verifies:
//! - Session snapshot survives process restart (store reopen)
//! - Periodic persistence writes while editing continues
//! - Teardown persist captures the last edits
//! - Multi-document isolation within one database
//! - Rejoin after restore merges cleanly with live peers

use codraft::{
    CollabSession, LocalRelay, PersistedSnapshot, RocksStore, SessionConfig, SnapshotStore,
    StoreConfig,
};

use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;
use yrs::{Text, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: impl Into<std::path::PathBuf>) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

async fn open_session(
    relay: &LocalRelay,
    store: Arc<RocksStore>,
    doc_id: Uuid,
) -> CollabSession {
    let config = SessionConfig {
        sync_wait: Duration::from_millis(50),
        persist_interval: Duration::from_secs(60),
        ..SessionConfig::new(doc_id, "Ada")
    };
    CollabSession::open(
        config,
        Arc::new(relay.channel(doc_id)),
        store as Arc<dyn SnapshotStore>,
    )
    .await
    .unwrap()
}

fn append(session: &CollabSession, text: &str) {
    session.edit(|txn| {
        let root = txn.get_or_insert_text("content");
        let end = root.len(txn);
        root.insert(txn, end, text);
    });
}

// ─── Restart survival ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_content_survives_store_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let relay = LocalRelay::new(64);
    let doc_id = Uuid::new_v4();

    {
        let store = open_store(&path);
        let session = open_session(&relay, store, doc_id).await;
        append(&session, "survives restart");
        session.close().await.unwrap();
    }

    let store = open_store(&path);
    let session = open_session(&relay, store, doc_id).await;
    assert_eq!(session.doc().text_content("content"), "survives restart");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_teardown_persist_captures_last_edit() {
    let dir = tempdir().unwrap();
    let relay = LocalRelay::new(64);
    let doc_id = Uuid::new_v4();
    let store = open_store(dir.path().join("db"));

    let session = open_session(&relay, store.clone(), doc_id).await;
    append(&session, "first ");
    append(&session, "last");
    session.close().await.unwrap();

    let snapshot = store.get(doc_id).unwrap().unwrap();
    let fresh = codraft::DocumentStore::new(doc_id);
    fresh.restore(&snapshot.state).unwrap();
    assert_eq!(fresh.text_content("content"), "first last");
}

// ─── Periodic persistence ────────────────────────────────────────────────────

#[tokio::test]
async fn test_periodic_persist_runs_while_editing() {
    let dir = tempdir().unwrap();
    let relay = LocalRelay::new(64);
    let doc_id = Uuid::new_v4();
    let store = open_store(dir.path().join("db"));

    let config = SessionConfig {
        sync_wait: Duration::from_millis(50),
        persist_interval: Duration::from_millis(50),
        ..SessionConfig::new(doc_id, "Ada")
    };
    let session = CollabSession::open(
        config,
        Arc::new(relay.channel(doc_id)),
        store.clone() as Arc<dyn SnapshotStore>,
    )
    .await
    .unwrap();

    append(&session, "tick ");
    tokio::time::sleep(Duration::from_millis(180)).await;
    append(&session, "tock");

    // At least one timer-driven write happened before close.
    assert!(store.clock(doc_id).unwrap().unwrap_or(0) >= 1);
    session.close().await.unwrap();
}

// ─── Isolation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_documents_isolated_in_one_database() {
    let dir = tempdir().unwrap();
    let relay = LocalRelay::new(64);
    let store = open_store(dir.path().join("db"));
    let (doc_a, doc_b) = (Uuid::new_v4(), Uuid::new_v4());

    let a = open_session(&relay, store.clone(), doc_a).await;
    let b = open_session(&relay, store.clone(), doc_b).await;
    append(&a, "alpha");
    append(&b, "beta");
    a.close().await.unwrap();
    b.close().await.unwrap();

    let relay2 = LocalRelay::new(64);
    let a2 = open_session(&relay2, store.clone(), doc_a).await;
    let b2 = open_session(&relay2, store, doc_b).await;
    assert_eq!(a2.doc().text_content("content"), "alpha");
    assert_eq!(b2.doc().text_content("content"), "beta");
    a2.close().await.unwrap();
    b2.close().await.unwrap();
}

// ─── Rejoin semantics ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rejoin_from_snapshot_merges_with_live_peer() {
    let dir = tempdir().unwrap();
    let relay = LocalRelay::new(64);
    let doc_id = Uuid::new_v4();
    let store = open_store(dir.path().join("db"));

    // First life: write, persist, leave.
    let first = open_session(&relay, store.clone(), doc_id).await;
    append(&first, "persisted ");
    first.close().await.unwrap();

    // A peer keeps editing while we are gone.
    let peer = open_session(&relay, store.clone(), doc_id).await;
    append(&peer, "while away ");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Second life: snapshot plus handshake covers both histories.
    let second = open_session(&relay, store, doc_id).await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    let content = second.doc().text_content("content");
    assert!(content.contains("persisted "));
    assert!(content.contains("while away "));
    assert_eq!(second.doc().snapshot(), peer.doc().snapshot());

    peer.close().await.unwrap();
    second.close().await.unwrap();
}

// ─── Raw store behavior ──────────────────────────────────────────────────────

#[test]
fn test_large_snapshot_roundtrip() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc_id = Uuid::new_v4();

    let state: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    store
        .upsert(doc_id, &PersistedSnapshot { state: state.clone(), clock: 1 })
        .unwrap();

    assert_eq!(store.get(doc_id).unwrap().unwrap().state, state);
}
