//! One collaboration session, owned by the caller.
//!
//! A session ties one [`DocumentStore`] to one channel subscription, one
//! awareness store and one persistence manager, and tears all of them down
//! deterministically. There is no module-level registry: hosts hold the
//! session handle, and multiple sessions coexist in one process.
//!
//! Open order matters: the snapshot is restored before the transport
//! attaches, and the transport finishes its reconciliation window before
//! `open` returns, so callers never mutate a store that is still behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use yrs::TransactionMut;

use crate::applier::{ApplierConfig, StreamingApplier};
use crate::awareness::{AwarenessStore, PresenceState, UserInfo};
use crate::channel::BroadcastChannel;
use crate::document::{DocumentStore, Origin};
use crate::persistence::{PersistenceError, PersistenceManager, SnapshotStore};
use crate::transport::{SyncStatus, SyncTransport, TransportConfig};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub doc_id: Uuid,
    /// Display name broadcast in our presence record.
    pub user_name: String,
    /// Snapshot persistence period.
    pub persist_interval: Duration,
    pub awareness_max_age: Duration,
    pub awareness_grace: Duration,
    /// Initial reconciliation window.
    pub sync_wait: Duration,
    /// Bound on the final persist at teardown.
    pub shutdown_grace: Duration,
}

impl SessionConfig {
    pub fn new(doc_id: Uuid, user_name: impl Into<String>) -> Self {
        Self {
            doc_id,
            user_name: user_name.into(),
            persist_interval: Duration::from_secs(30),
            awareness_max_age: Duration::from_secs(30),
            awareness_grace: Duration::from_secs(10),
            sync_wait: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// A live collaboration session.
pub struct CollabSession {
    doc: Arc<DocumentStore>,
    awareness: Arc<Mutex<AwarenessStore>>,
    transport: Arc<SyncTransport>,
    persistence: Arc<PersistenceManager>,
    shutdown_grace: Duration,
    closed: AtomicBool,
}

impl CollabSession {
    /// Restore, attach, reconcile, announce.
    pub async fn open(
        config: SessionConfig,
        channel: Arc<dyn BroadcastChannel>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, PersistenceError> {
        let doc = Arc::new(DocumentStore::new(config.doc_id));
        let persistence = Arc::new(PersistenceManager::new(doc.clone(), store));
        persistence.load_initial()?;

        let awareness = Arc::new(Mutex::new(AwarenessStore::new(doc.client_id())));
        let transport = SyncTransport::start(
            doc.clone(),
            awareness.clone(),
            channel,
            TransportConfig {
                awareness_max_age: config.awareness_max_age,
                awareness_grace: config.awareness_grace,
                sync_wait: config.sync_wait,
            },
        )
        .await;

        persistence.schedule_periodic(config.persist_interval);

        let session = Self {
            doc,
            awareness,
            transport,
            persistence,
            shutdown_grace: config.shutdown_grace,
            closed: AtomicBool::new(false),
        };

        let join = session.awareness.lock().unwrap().set_local_state(PresenceState {
            user: Some(UserInfo::new(config.user_name, session.doc.client_id())),
            ..PresenceState::default()
        });
        session.transport.broadcast_presence(&join);

        log::info!(
            "doc {}: session open as client {}",
            session.doc.doc_id(),
            session.doc.client_id()
        );
        Ok(session)
    }

    /// Apply a local edit; the transport publishes it.
    pub fn edit<F, R>(&self, mutator: F) -> R
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let origin = Origin::Local { client_id: self.doc.client_id() };
        let (_, result) = self.doc.apply_local(origin, mutator);
        result
    }

    /// Update and broadcast our presence record.
    pub fn set_presence(&self, partial: PresenceState) {
        let delta = self.awareness.lock().unwrap().set_local_state(partial);
        self.transport.broadcast_presence(&delta);
    }

    /// Streaming applier feeding this session's document.
    pub fn applier(&self, config: ApplierConfig) -> StreamingApplier {
        StreamingApplier::new(self.doc.clone(), config)
    }

    pub fn doc(&self) -> &Arc<DocumentStore> {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Mutex<AwarenessStore>> {
        &self.awareness
    }

    pub fn client_id(&self) -> Uuid {
        self.doc.client_id()
    }

    pub fn status(&self) -> SyncStatus {
        self.transport.status()
    }

    /// Announce departure, persist one last time, release the channel.
    ///
    /// Teardown always completes; a failed or timed-out final persist is
    /// returned for the host's benefit but does not abort it.
    pub async fn close(&self) -> Result<(), PersistenceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let leave = self.awareness.lock().unwrap().clear_local_state();
        self.transport.broadcast_presence(&leave);

        let persisted = self.persistence.shutdown(self.shutdown_grace).await;
        if let Err(e) = &persisted {
            log::warn!("doc {}: final persist failed: {e}", self.doc.doc_id());
        }
        self.transport.stop();
        log::info!("doc {}: session closed", self.doc.doc_id());
        persisted
    }
}
