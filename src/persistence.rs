//! Persistence manager: snapshot-based durability for a document session.
//!
//! Persistence is decoupled from the update stream. Instead of an
//! append-only update log, the manager writes a point-in-time full
//! snapshot on a timer and on clean shutdown, so a rejoin always starts
//! from one blob plus whatever live deltas arrive afterward. Writes run on
//! the blocking pool and never hold the document's mutation path — a local
//! edit issued while a persist is in flight completes immediately.
//!
//! The [`PersistedSnapshot`] clock is a coarse progress indicator only;
//! conflicts are resolved by the CRDT, never by the clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::document::DocumentStore;

/// Durable serialization of a document's full state.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSnapshot {
    /// Full CRDT state (update v1 against the empty state vector).
    pub state: Vec<u8>,
    /// Monotonically non-decreasing write counter.
    pub clock: u64,
}

/// Persistence errors. Non-fatal by design: editing never blocks on a
/// failed write, the next scheduled tick retries.
#[derive(Debug, Clone)]
pub enum PersistenceError {
    /// Backend read/write failure.
    Storage(String),
    /// Snapshot bytes failed to decode on load.
    Corrupt(String),
    /// Final persist did not finish within the shutdown grace period.
    Timeout,
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Storage(e) => write!(f, "Storage error: {e}"),
            PersistenceError::Corrupt(e) => write!(f, "Corrupt snapshot: {e}"),
            PersistenceError::Timeout => write!(f, "Persist timed out during shutdown"),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Key-value snapshot backend, keyed by document id.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, doc_id: Uuid) -> Result<Option<PersistedSnapshot>, PersistenceError>;
    fn upsert(&self, doc_id: Uuid, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError>;
}

/// In-memory snapshot store for tests and hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<Uuid, PersistedSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn get(&self, doc_id: Uuid) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        Ok(self.snapshots.lock().unwrap().get(&doc_id).cloned())
    }

    fn upsert(&self, doc_id: Uuid, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(doc_id, snapshot.clone());
        Ok(())
    }
}

/// Drives snapshot persistence for one document session.
pub struct PersistenceManager {
    doc: Arc<DocumentStore>,
    store: Arc<dyn SnapshotStore>,
    clock: Arc<AtomicU64>,
    shut_down: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Serializes writes: an older snapshot must never land after a newer
    /// one on the blocking pool.
    write_lock: tokio::sync::Mutex<()>,
}

impl PersistenceManager {
    pub fn new(doc: Arc<DocumentStore>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            doc,
            store,
            clock: Arc::new(AtomicU64::new(0)),
            shut_down: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the last snapshot into the document store, if one exists.
    ///
    /// Call once at session start, before accepting local mutations.
    /// Returns whether a snapshot was found.
    pub fn load_initial(&self) -> Result<bool, PersistenceError> {
        match self.store.get(self.doc.doc_id())? {
            Some(snapshot) => {
                self.doc
                    .restore(&snapshot.state)
                    .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
                self.clock.store(snapshot.clock, Ordering::SeqCst);
                log::info!(
                    "doc {}: restored snapshot at clock {}",
                    self.doc.doc_id(),
                    snapshot.clock
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write a point-in-time snapshot. Idempotent; safe to call while
    /// local edits continue — the snapshot is taken before the write is
    /// handed to the blocking pool. Overlapping calls (host plus timer)
    /// queue behind the write lock and commit in clock order; the
    /// document's mutation path never touches this lock.
    pub async fn persist_now(&self) -> Result<(), PersistenceError> {
        let _write = self.write_lock.lock().await;
        let snapshot = PersistedSnapshot {
            state: self.doc.snapshot(),
            clock: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let store = self.store.clone();
        let doc_id = self.doc.doc_id();

        tokio::task::spawn_blocking(move || store.upsert(doc_id, &snapshot))
            .await
            .map_err(|e| PersistenceError::Storage(e.to_string()))?
    }

    /// Start timer-driven persistence. Replaces any previous schedule.
    pub fn schedule_periodic(self: &Arc<Self>, interval: Duration) {
        self.cancel();
        let manager = Arc::downgrade(self);
        let shut_down = self.shut_down.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                // Skip the write when the session was torn down between
                // ticks.
                if shut_down.load(Ordering::SeqCst) {
                    break;
                }
                let Some(manager) = manager.upgrade() else { break };
                if let Err(e) = manager.persist_now().await {
                    log::warn!("periodic persist failed (will retry next tick): {e}");
                }
            }
        });
        *self.timer.lock().unwrap() = Some(handle);
    }

    /// Stop timer-driven persistence.
    pub fn cancel(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Final best-effort persist, attempted exactly once, bounded by
    /// `grace`. A write still in flight when the grace period expires
    /// finishes in the background; the error is reported, not raised.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), PersistenceError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(()); // already shut down
        }
        self.cancel();

        match tokio::time::timeout(grace, self.persist_now()).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "doc {}: final persist exceeded {}ms grace, detaching",
                    self.doc.doc_id(),
                    grace.as_millis()
                );
                Err(PersistenceError::Timeout)
            }
        }
    }

    /// Current persistence clock.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Origin;
    use yrs::{Text, WriteTxn};

    fn doc_with_text(doc_id: Uuid, text: &str) -> Arc<DocumentStore> {
        let doc = Arc::new(DocumentStore::new(doc_id));
        let origin = Origin::Local { client_id: doc.client_id() };
        doc.apply_local(origin, |txn| {
            let root = txn.get_or_insert_text("content");
            root.insert(txn, 0, text);
        });
        doc
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let doc_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());

        let doc = doc_with_text(doc_id, "durable");
        let manager = PersistenceManager::new(doc, store.clone());
        manager.persist_now().await.unwrap();
        assert_eq!(manager.clock(), 1);

        // Fresh session over the same store.
        let doc2 = Arc::new(DocumentStore::new(doc_id));
        let manager2 = PersistenceManager::new(doc2.clone(), store);
        assert!(manager2.load_initial().unwrap());
        assert_eq!(doc2.text_content("content"), "durable");
        assert_eq!(manager2.clock(), 1);
    }

    #[tokio::test]
    async fn test_load_initial_absent() {
        let doc = Arc::new(DocumentStore::new(Uuid::new_v4()));
        let manager = PersistenceManager::new(doc, Arc::new(MemoryStore::new()));
        assert!(!manager.load_initial().unwrap());
    }

    #[tokio::test]
    async fn test_clock_monotonic_across_persists() {
        let doc = doc_with_text(Uuid::new_v4(), "x");
        let manager = PersistenceManager::new(doc, Arc::new(MemoryStore::new()));

        manager.persist_now().await.unwrap();
        manager.persist_now().await.unwrap();
        manager.persist_now().await.unwrap();
        assert_eq!(manager.clock(), 3);
    }

    /// Store whose writes block long enough to overlap with local edits.
    struct SlowStore {
        inner: MemoryStore,
        write_delay: Duration,
    }

    impl SnapshotStore for SlowStore {
        fn get(&self, doc_id: Uuid) -> Result<Option<PersistedSnapshot>, PersistenceError> {
            self.inner.get(doc_id)
        }

        fn upsert(
            &self,
            doc_id: Uuid,
            snapshot: &PersistedSnapshot,
        ) -> Result<(), PersistenceError> {
            std::thread::sleep(self.write_delay);
            self.inner.upsert(doc_id, snapshot)
        }
    }

    #[tokio::test]
    async fn test_mutation_not_blocked_by_inflight_persist() {
        let doc = doc_with_text(Uuid::new_v4(), "before ");
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            write_delay: Duration::from_millis(200),
        });
        let manager = Arc::new(PersistenceManager::new(doc.clone(), store));

        let persist = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.persist_now().await })
        };
        // Give the persist task a chance to take its snapshot and enter
        // the slow write.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let origin = Origin::Local { client_id: doc.client_id() };
        doc.apply_local(origin, |txn| {
            let root = txn.get_or_insert_text("content");
            let end = root.len(txn);
            root.insert(txn, end, "during");
        });
        // Visible locally before the persist resolves.
        assert_eq!(doc.text_content("content"), "before during");
        assert!(!persist.is_finished());

        persist.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_persists_commit_in_clock_order() {
        let doc = doc_with_text(Uuid::new_v4(), "v1 ");
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            write_delay: Duration::from_millis(100),
        });
        let manager = Arc::new(PersistenceManager::new(doc.clone(), store.clone()));

        // First persist enters its slow write; a second one overlaps it.
        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.persist_now().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let origin = Origin::Local { client_id: doc.client_id() };
        doc.apply_local(origin, |txn| {
            let root = txn.get_or_insert_text("content");
            let end = root.len(txn);
            root.insert(txn, end, "v2");
        });
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.persist_now().await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // The newer snapshot is what remains stored.
        let stored = store.get(doc.doc_id()).unwrap().unwrap();
        assert_eq!(stored.clock, 2);
        let fresh = DocumentStore::new(doc.doc_id());
        fresh.restore(&stored.state).unwrap();
        assert_eq!(fresh.text_content("content"), "v1 v2");
    }

    #[tokio::test]
    async fn test_shutdown_persists_once() {
        let doc = doc_with_text(Uuid::new_v4(), "final");
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(PersistenceManager::new(doc.clone(), store.clone()));

        manager.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.len(), 1);

        // Second shutdown is a no-op.
        manager.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(manager.clock(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_grace_bounded() {
        let doc = doc_with_text(Uuid::new_v4(), "slow");
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            write_delay: Duration::from_millis(500),
        });
        let manager = Arc::new(PersistenceManager::new(doc, store));

        let started = std::time::Instant::now();
        let result = manager.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PersistenceError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_periodic_skips_after_shutdown() {
        let doc = doc_with_text(Uuid::new_v4(), "tick");
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(PersistenceManager::new(doc, store.clone()));

        manager.schedule_periodic(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(store.len() > 0);

        manager.shutdown(Duration::from_secs(1)).await.unwrap();
        let clock_after = manager.clock();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.clock(), clock_after);
    }
}
