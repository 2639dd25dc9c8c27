//! Sync transport adapter: binds a document store and an awareness store
//! to one broadcast channel subscription.
//!
//! Outbound: every local-origin document update is codec-encoded into an
//! envelope and published; remote-origin updates are never republished.
//! Inbound: frames are decoded and routed to the right store. Echo
//! suppression is enforced here via the envelope's `sender` — never via
//! channel configuration, since loop-back behavior varies by transport.
//!
//! Lifecycle:
//! ```text
//! disconnected ─► subscribing ─► synced ─► (channel drop)
//!                     ▲                        │
//!                     │                        ▼
//!                  (first time only)      resubscribing ─► synced
//! ```
//! The first transition into `synced` runs a full-state reconciliation
//! (state-vector request, diff reply). Resubscription after a drop does
//! not — CRDT merge makes missed deltas safe to skip, with periodic
//! snapshots as the correctness backstop.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::{AwarenessStore, PresenceDelta};
use crate::channel::{BroadcastChannel, ChannelStatus, Frame};
use crate::document::{DocumentStore, Origin, Subscription, Update};
use crate::protocol::{Envelope, EventKind};

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Silence after which a peer's presence record turns stale.
    pub awareness_max_age: Duration,
    /// Additional silence after which a stale record is evicted.
    pub awareness_grace: Duration,
    /// How long to wait for a sync reply before declaring `Synced`
    /// anyway (a lone client never receives one).
    pub sync_wait: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            awareness_max_age: Duration::from_secs(30),
            awareness_grace: Duration::from_secs(10),
            sync_wait: Duration::from_millis(500),
        }
    }
}

/// Adapter lifecycle state; drives the host's connectivity indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Disconnected,
    Subscribing,
    Synced,
    Resubscribing,
}

/// Binds one document session to one channel subscription.
pub struct SyncTransport {
    doc: Arc<DocumentStore>,
    awareness: Arc<Mutex<AwarenessStore>>,
    channel: Arc<dyn BroadcastChannel>,
    status: Arc<RwLock<SyncStatus>>,
    doc_sub: Mutex<Option<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncTransport {
    /// Subscribe, reconcile, and start routing.
    ///
    /// Returns after the initial reconciliation window so the caller can
    /// hold local mutations until the store is caught up.
    pub async fn start(
        doc: Arc<DocumentStore>,
        awareness: Arc<Mutex<AwarenessStore>>,
        channel: Arc<dyn BroadcastChannel>,
        config: TransportConfig,
    ) -> Arc<Self> {
        let status = Arc::new(RwLock::new(SyncStatus::Subscribing));
        let transport = Arc::new(Self {
            doc: doc.clone(),
            awareness: awareness.clone(),
            channel: channel.clone(),
            status: status.clone(),
            doc_sub: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        // Subscribe before publishing the sync request so the reply
        // cannot be missed.
        let frames = channel.frames();
        let (synced_tx, mut synced_rx) = watch::channel(false);
        {
            let t = transport.clone();
            let handle = tokio::spawn(async move { t.route_inbound(frames, synced_tx).await });
            transport.tasks.lock().unwrap().push(handle);
        }

        // Outbound: publish everything that should leave this replica.
        {
            let channel = channel.clone();
            let client_id = doc.client_id();
            let doc_id = doc.doc_id();
            let sub = doc.subscribe(move |update: &Update| {
                if !update.origin.should_broadcast() {
                    return;
                }
                let env = Envelope::update(client_id, doc_id, &update.payload);
                match env.to_frame() {
                    Ok(frame) => {
                        if let Err(e) = channel.publish(frame) {
                            log::warn!("doc {doc_id}: publish failed: {e}");
                        }
                    }
                    Err(e) => log::error!("doc {doc_id}: envelope encode failed: {e}"),
                }
            });
            *transport.doc_sub.lock().unwrap() = Some(sub);
        }

        // Initial reconciliation: ask peers for what we are missing.
        let request = Envelope::sync_request(doc.client_id(), doc.doc_id(), &doc.state_vector());
        match request.to_frame() {
            Ok(frame) => {
                if let Err(e) = channel.publish(frame) {
                    log::warn!("doc {}: sync request failed: {e}", doc.doc_id());
                }
            }
            Err(e) => log::error!("doc {}: sync request encode failed: {e}", doc.doc_id()),
        }
        let _ = tokio::time::timeout(config.sync_wait, synced_rx.changed()).await;
        // Never report synced on a channel that went down during the wait.
        *status.write().unwrap() = match channel.status() {
            ChannelStatus::Connected => SyncStatus::Synced,
            ChannelStatus::Reconnecting => SyncStatus::Resubscribing,
            ChannelStatus::Closed => SyncStatus::Disconnected,
        };

        // Presence eviction timer.
        {
            let awareness = awareness.clone();
            let max_age = config.awareness_max_age;
            let grace = config.awareness_grace;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(max_age / 3);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    awareness.lock().unwrap().evict_stale(max_age, grace);
                }
            });
            transport.tasks.lock().unwrap().push(handle);
        }

        // Mirror channel connectivity into the lifecycle state.
        {
            let channel = channel.clone();
            let status = status.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let mapped = match channel.status() {
                        // Back on a live channel: no re-reconciliation,
                        // straight to synced.
                        ChannelStatus::Connected => SyncStatus::Synced,
                        ChannelStatus::Reconnecting => SyncStatus::Resubscribing,
                        ChannelStatus::Closed => SyncStatus::Disconnected,
                    };
                    let mut current = status.write().unwrap();
                    if *current != mapped {
                        log::info!("sync status: {:?} -> {:?}", *current, mapped);
                        *current = mapped;
                    }
                }
            });
            transport.tasks.lock().unwrap().push(handle);
        }

        transport
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SyncStatus {
        *self.status.read().unwrap()
    }

    /// Broadcast a presence delta produced by the local awareness store.
    pub fn broadcast_presence(&self, delta: &PresenceDelta) {
        let doc_id = self.doc.doc_id();
        let encoded = match delta.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("doc {doc_id}: presence encode failed: {e}");
                return;
            }
        };
        let env = Envelope::awareness(self.doc.client_id(), doc_id, &encoded);
        match env.to_frame() {
            Ok(frame) => {
                if let Err(e) = self.channel.publish(frame) {
                    log::debug!("doc {doc_id}: presence publish dropped: {e}");
                }
            }
            Err(e) => log::error!("doc {doc_id}: presence envelope failed: {e}"),
        }
    }

    /// Tear down routing and release the channel.
    pub fn stop(&self) {
        if let Some(sub) = self.doc_sub.lock().unwrap().take() {
            self.doc.unsubscribe(sub);
        }
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.channel.close();
        *self.status.write().unwrap() = SyncStatus::Disconnected;
    }

    async fn route_inbound(
        &self,
        mut frames: tokio::sync::broadcast::Receiver<Frame>,
        synced_tx: watch::Sender<bool>,
    ) {
        loop {
            match frames.recv().await {
                Ok(frame) => self.handle_frame(&frame, &synced_tx),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // Dropped frames are tolerable: CRDT merge + the
                    // snapshot backstop recover the content.
                    log::warn!("doc {}: inbound lagged by {n} frames", self.doc.doc_id());
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    log::info!("doc {}: channel closed", self.doc.doc_id());
                    *self.status.write().unwrap() = SyncStatus::Disconnected;
                    break;
                }
            }
        }
    }

    fn handle_frame(&self, frame: &[u8], synced_tx: &watch::Sender<bool>) {
        let env = match Envelope::from_frame(frame) {
            Ok(env) => env,
            Err(e) => {
                log::warn!("dropped undecodable frame: {e}");
                return;
            }
        };

        let client_id = self.doc.client_id();
        // No local echo, regardless of channel loop-back behavior.
        if env.sender == client_id {
            return;
        }
        if env.doc_id != self.doc.doc_id() || !env.addressed_to(client_id) {
            return;
        }

        let payload = match env.payload_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("dropped frame with malformed payload: {e}");
                return;
            }
        };

        match env.event {
            EventKind::Update | EventKind::SyncReply => {
                let update = Update {
                    payload,
                    origin: Origin::Remote { client_id: env.sender },
                };
                if let Err(e) = self.doc.apply_remote(&update) {
                    log::warn!("doc {}: dropped bad update: {e}", self.doc.doc_id());
                }
                if env.event == EventKind::SyncReply {
                    let _ = synced_tx.send(true);
                }
            }
            EventKind::SyncRequest => {
                // Answer with the diff the requester is missing.
                match self.doc.diff(&payload) {
                    Ok(diff) => {
                        let reply = Envelope::sync_reply(
                            client_id,
                            self.doc.doc_id(),
                            env.sender,
                            &diff,
                        );
                        match reply.to_frame() {
                            Ok(frame) => {
                                if let Err(e) = self.channel.publish(frame) {
                                    log::warn!("sync reply publish failed: {e}");
                                }
                            }
                            Err(e) => log::error!("sync reply encode failed: {e}"),
                        }
                    }
                    Err(e) => log::warn!("dropped sync request with bad state vector: {e}"),
                }
            }
            EventKind::Awareness => match PresenceDelta::decode(&payload) {
                Ok(delta) => {
                    self.awareness.lock().unwrap().apply_remote(&delta);
                }
                Err(e) => log::warn!("dropped bad presence delta: {e}"),
            },
        }
    }
}
