//! Ephemeral presence ("awareness") store.
//!
//! Presence is not a CRDT: records do not converge through merge, so each
//! client's deltas carry a per-client monotonic clock and stale deltas are
//! rejected to avoid presence flicker. Records are never persisted and any
//! record may be absent at any time.
//!
//! Per-record lifecycle:
//! ```text
//! unknown ──first delta──► present ──max_age silent──► stale
//!    ▲                        ▲                          │
//!    │                        └────fresh delta───────────┤
//!    └────────────────◄─── evicted ◄──grace expired──────┘
//! ```
//! Eviction is driven by the sync transport's timer, not by application
//! code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::codec::CodecError;

/// Client identity with a stable display color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// RGBA color for cursor/selection rendering.
    pub color: [f32; 4],
}

impl UserInfo {
    /// Create with a color derived from the client id, so every replica
    /// renders the same user in the same color.
    pub fn new(name: impl Into<String>, client_id: Uuid) -> Self {
        let hash = client_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// One client's presence payload. All fields optional so a delta can carry
/// a partial update; cursor and selection are application-defined.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceState {
    pub user: Option<UserInfo>,
    pub cursor: Option<serde_json::Value>,
    pub selection: Option<serde_json::Value>,
}

impl PresenceState {
    /// Merge `partial` into `self`: set fields override, unset fields keep
    /// their current value.
    fn merge(&mut self, partial: PresenceState) {
        if partial.user.is_some() {
            self.user = partial.user;
        }
        if partial.cursor.is_some() {
            self.cursor = partial.cursor;
        }
        if partial.selection.is_some() {
            self.selection = partial.selection;
        }
    }
}

/// Wire delta for one client's presence. `state: None` is an explicit
/// leave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceDelta {
    pub client_id: Uuid,
    /// Per-client monotonic clock; deltas at or below the known clock for
    /// that client are stale and rejected.
    pub clock: u64,
    pub state: Option<PresenceState>,
}

impl PresenceDelta {
    /// Encode for the wire. JSON rather than bincode: the cursor and
    /// selection values are self-describing application JSON.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }
}

/// Lifecycle position of a tracked peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Present,
    Stale,
}

/// A remote client's tracked presence.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub client_id: Uuid,
    pub state: PresenceState,
    pub status: PresenceStatus,
    clock: u64,
    last_seen: Instant,
}

impl PeerRecord {
    /// Time since the last delta from this client.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }
}

/// Presence records for one document session, keyed by client id.
pub struct AwarenessStore {
    client_id: Uuid,
    local_state: PresenceState,
    local_clock: u64,
    peers: HashMap<Uuid, PeerRecord>,
}

impl AwarenessStore {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            local_state: PresenceState::default(),
            local_clock: 0,
            peers: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Merge a partial state into our own record and return the delta to
    /// broadcast.
    pub fn set_local_state(&mut self, partial: PresenceState) -> PresenceDelta {
        self.local_state.merge(partial);
        self.local_clock += 1;
        PresenceDelta {
            client_id: self.client_id,
            clock: self.local_clock,
            state: Some(self.local_state.clone()),
        }
    }

    /// Clear our own record and return the leave delta to broadcast.
    pub fn clear_local_state(&mut self) -> PresenceDelta {
        self.local_state = PresenceState::default();
        self.local_clock += 1;
        PresenceDelta {
            client_id: self.client_id,
            clock: self.local_clock,
            state: None,
        }
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local_state
    }

    /// Merge a remote delta. Returns `false` when the delta was our own,
    /// stale, or a leave for an unknown client.
    pub fn apply_remote(&mut self, delta: &PresenceDelta) -> bool {
        if delta.client_id == self.client_id {
            return false;
        }

        if let Some(record) = self.peers.get(&delta.client_id) {
            if delta.clock <= record.clock {
                log::trace!(
                    "awareness: stale delta from {} (clock {} <= {})",
                    delta.client_id,
                    delta.clock,
                    record.clock
                );
                return false;
            }
        }

        match &delta.state {
            Some(state) => {
                let record = self
                    .peers
                    .entry(delta.client_id)
                    .or_insert_with(|| PeerRecord {
                        client_id: delta.client_id,
                        state: PresenceState::default(),
                        status: PresenceStatus::Present,
                        clock: 0,
                        last_seen: Instant::now(),
                    });
                record.state = state.clone();
                record.clock = delta.clock;
                record.last_seen = Instant::now();
                record.status = PresenceStatus::Present;
                true
            }
            None => self.peers.remove(&delta.client_id).is_some(),
        }
    }

    /// All known non-self records.
    pub fn list_peers(&self) -> Vec<&PeerRecord> {
        self.peers.values().collect()
    }

    pub fn peer(&self, client_id: &Uuid) -> Option<&PeerRecord> {
        self.peers.get(client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Age out silent peers: records silent past `max_age` become stale,
    /// records silent past `max_age + grace` are evicted. Returns the
    /// evicted client ids. Called on a timer by the transport adapter.
    pub fn evict_stale(&mut self, max_age: Duration, grace: Duration) -> Vec<Uuid> {
        let mut evicted = Vec::new();
        for (id, record) in self.peers.iter_mut() {
            let idle = record.last_seen.elapsed();
            if idle > max_age + grace {
                evicted.push(*id);
            } else if idle > max_age {
                record.status = PresenceStatus::Stale;
            }
        }
        for id in &evicted {
            self.peers.remove(id);
            log::debug!("awareness: evicted silent peer {id}");
        }
        evicted
    }
}
