//! Relay envelope for document and awareness traffic.
//!
//! Every frame on the broadcast channel is one JSON envelope:
//! ```text
//! ┌────────┬──────────┬──────────┬──────────┬──────────────┐
//! │ event  │ sender   │ doc_id   │ to       │ payload      │
//! │ kind   │ uuid     │ uuid     │ optional │ WireValue    │
//! └────────┴──────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! The payload is codec-encoded ([`crate::codec`]) so that frames from
//! older clients, which sent raw or numeric-array payloads, still decode.
//! `sender` drives echo suppression in the transport adapter; `to` scopes
//! sync replies to the requesting client.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, CodecError, WireValue};

/// Envelope event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Incremental CRDT update.
    Update,
    /// Presence delta (cursor/selection/identity).
    Awareness,
    /// State-vector request for initial reconciliation.
    SyncRequest,
    /// State diff answering a `SyncRequest`.
    SyncReply,
}

/// One broadcast-channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: EventKind,
    pub sender: Uuid,
    pub doc_id: Uuid,
    /// Directed recipient; `None` means every subscriber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Uuid>,
    pub payload: WireValue,
}

impl Envelope {
    /// Wrap a CRDT update for broadcast.
    pub fn update(sender: Uuid, doc_id: Uuid, update: &[u8]) -> Self {
        Self {
            event: EventKind::Update,
            sender,
            doc_id,
            to: None,
            payload: codec::encode(update),
        }
    }

    /// Wrap an awareness delta for broadcast.
    pub fn awareness(sender: Uuid, doc_id: Uuid, delta: &[u8]) -> Self {
        Self {
            event: EventKind::Awareness,
            sender,
            doc_id,
            to: None,
            payload: codec::encode(delta),
        }
    }

    /// Request reconciliation: payload is our encoded state vector.
    pub fn sync_request(sender: Uuid, doc_id: Uuid, state_vector: &[u8]) -> Self {
        Self {
            event: EventKind::SyncRequest,
            sender,
            doc_id,
            to: None,
            payload: codec::encode(state_vector),
        }
    }

    /// Answer a reconciliation request with a state diff, directed at the
    /// requesting client.
    pub fn sync_reply(sender: Uuid, doc_id: Uuid, to: Uuid, diff: &[u8]) -> Self {
        Self {
            event: EventKind::SyncReply,
            sender,
            doc_id,
            to: Some(to),
            payload: codec::encode(diff),
        }
    }

    /// Serialize to a wire frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }

    /// Deserialize from a wire frame.
    pub fn from_frame(frame: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(frame).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }

    /// Decode the payload to canonical bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::decode(&self.payload)
    }

    /// Whether this envelope is addressed to the given client.
    pub fn addressed_to(&self, client_id: Uuid) -> bool {
        match self.to {
            Some(target) => target == client_id,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let sender = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let payload = vec![1u8, 2, 3, 4, 5];

        let env = Envelope::update(sender, doc, &payload);
        let frame = env.to_frame().unwrap();
        let decoded = Envelope::from_frame(&frame).unwrap();

        assert_eq!(decoded.event, EventKind::Update);
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.to, None);
        assert_eq!(decoded.payload_bytes().unwrap(), payload);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let env = Envelope::awareness(Uuid::new_v4(), Uuid::new_v4(), &[7, 8, 9]);
        let frame = env.to_frame().unwrap();
        let decoded = Envelope::from_frame(&frame).unwrap();

        assert_eq!(decoded.event, EventKind::Awareness);
        assert_eq!(decoded.payload_bytes().unwrap(), vec![7u8, 8, 9]);
    }

    #[test]
    fn test_sync_reply_is_directed() {
        let me = Uuid::new_v4();
        let them = Uuid::new_v4();
        let env = Envelope::sync_reply(me, Uuid::new_v4(), them, &[1]);

        assert!(env.addressed_to(them));
        assert!(!env.addressed_to(me));
    }

    #[test]
    fn test_broadcast_addressed_to_everyone() {
        let env = Envelope::update(Uuid::new_v4(), Uuid::new_v4(), &[1]);
        assert!(env.addressed_to(Uuid::new_v4()));
    }

    #[test]
    fn test_legacy_payload_shape_accepted() {
        // A frame from an old client carrying a numeric-array payload.
        let sender = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let frame = format!(
            r#"{{"event":"update","sender":"{sender}","doc_id":"{doc}","payload":[1,2,3]}}"#
        );

        let env = Envelope::from_frame(frame.as_bytes()).unwrap();
        assert_eq!(env.event, EventKind::Update);
        assert_eq!(env.payload_bytes().unwrap(), vec![1u8, 2, 3]);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(Envelope::from_frame(b"{not json").is_err());
        assert!(Envelope::from_frame(b"{\"event\":\"bogus\"}").is_err());
    }
}
