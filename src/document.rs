//! CRDT document store — the authoritative replicated state for one
//! collaboration session.
//!
//! Wraps a single Yrs [`Doc`]. All mutations flow through
//! [`DocumentStore::apply_local`] and [`DocumentStore::apply_remote`];
//! there is no external mutation of the replicated state. Convergence and
//! idempotence are black-box guarantees of Yrs — two stores that applied
//! the same multiset of updates in any order expose bit-identical
//! [`DocumentStore::snapshot`] output.
//!
//! Subscribers are held in a registry keyed by subscription id and invoked
//! synchronously after each applied update, with the update's origin tag.
//! The origin tag is what prevents re-broadcast loops: the transport
//! adapter publishes local-origin updates only, and [`apply_remote`]
//! refuses updates that looped back from this store's own client.
//!
//! [`apply_remote`]: DocumentStore::apply_remote

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, TransactionMut};

use crate::codec::CodecError;

/// Source attribution for an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this process through a direct user edit.
    Local { client_id: Uuid },
    /// Received from another replica over the channel.
    Remote { client_id: Uuid },
    /// Produced by a named machine generator (e.g. `"ai-assistant"`).
    Synthetic { agent: String },
}

impl Origin {
    /// Synthetic origin for a named generator.
    pub fn synthetic(agent: impl Into<String>) -> Self {
        Origin::Synthetic { agent: agent.into() }
    }

    /// The client this update is attributed to, if any.
    pub fn client(&self) -> Option<Uuid> {
        match self {
            Origin::Local { client_id } | Origin::Remote { client_id } => Some(*client_id),
            Origin::Synthetic { .. } => None,
        }
    }

    /// Whether the transport adapter should publish this update.
    ///
    /// Local edits and generator output go out; remote merges never do.
    pub fn should_broadcast(&self) -> bool {
        !matches!(self, Origin::Remote { .. })
    }
}

/// An opaque binary delta with its origin tag.
#[derive(Debug, Clone)]
pub struct Update {
    pub payload: Vec<u8>,
    pub origin: Origin,
}

/// Handle returned from [`DocumentStore::subscribe`]; pass back to
/// [`DocumentStore::unsubscribe`] to deregister.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
}

type Handler = Arc<dyn Fn(&Update) + Send + Sync>;

struct Registry {
    handlers: HashMap<u64, Handler>,
    next_id: u64,
    update_count: u64,
}

/// The replicated document for one session.
pub struct DocumentStore {
    doc_id: Uuid,
    client_id: Uuid,
    doc: Doc,
    /// Serializes every mutation (local, remote, restore) so the CRDT and
    /// the subscriber dispatch see one logical event loop.
    mutation: Mutex<()>,
    registry: Mutex<Registry>,
}

impl DocumentStore {
    /// Create an empty store with a fresh local client id.
    pub fn new(doc_id: Uuid) -> Self {
        Self::with_client_id(doc_id, Uuid::new_v4())
    }

    /// Create with an explicit client id (for testing).
    pub fn with_client_id(doc_id: Uuid, client_id: Uuid) -> Self {
        Self {
            doc_id,
            client_id,
            doc: Doc::new(),
            mutation: Mutex::new(()),
            registry: Mutex::new(Registry {
                handlers: HashMap::new(),
                next_id: 0,
                update_count: 0,
            }),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Read-side access to the underlying Yrs document.
    ///
    /// Mutate only through [`apply_local`] / [`apply_remote`].
    ///
    /// [`apply_local`]: DocumentStore::apply_local
    /// [`apply_remote`]: DocumentStore::apply_remote
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Run a mutation in one write transaction and emit the resulting
    /// update to subscribers.
    ///
    /// The mutation is visible to local readers before this returns.
    pub fn apply_local<F, R>(&self, origin: Origin, mutator: F) -> (Update, R)
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let _guard = self.mutation.lock().unwrap();
        let (payload, result) = {
            let mut txn = self.doc.transact_mut();
            let result = mutator(&mut txn);
            (txn.encode_update_v1(), result)
        };
        let update = Update { payload, origin };
        self.notify(&update);
        (update, result)
    }

    /// Merge an externally received update.
    ///
    /// Returns `Ok(false)` without touching the document when the update
    /// looped back from this store's own client. A payload that does not
    /// decode is a [`CodecError`]; a decodable update always merges (CRDT
    /// merge is total over valid states).
    pub fn apply_remote(&self, update: &Update) -> Result<bool, CodecError> {
        if update.origin.client() == Some(self.client_id) {
            log::trace!("doc {}: dropped loop-back update", self.doc_id);
            return Ok(false);
        }

        let decoded = yrs::Update::decode_v1(&update.payload)
            .map_err(|e| CodecError::InvalidUpdate(e.to_string()))?;

        let _guard = self.mutation.lock().unwrap();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| CodecError::InvalidUpdate(e.to_string()))?;
        }
        self.notify(update);
        Ok(true)
    }

    /// Register a handler invoked synchronously for every applied update.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        let mut reg = self.registry.lock().unwrap();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.handlers.insert(id, Arc::new(handler));
        Subscription { id }
    }

    /// Deregister a previously registered handler.
    pub fn unsubscribe(&self, sub: Subscription) {
        let mut reg = self.registry.lock().unwrap();
        reg.handlers.remove(&sub.id);
    }

    /// Number of updates applied to this store (local + remote).
    pub fn update_count(&self) -> u64 {
        self.registry.lock().unwrap().update_count
    }

    /// Full-state export (update v1 against the empty state vector).
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Full-state import for persistence rehydration and initial sync.
    ///
    /// Does not notify subscribers — callers attach subscribers after the
    /// session is seeded.
    pub fn restore(&self, state: &[u8]) -> Result<(), CodecError> {
        let decoded = yrs::Update::decode_v1(state)
            .map_err(|e| CodecError::InvalidUpdate(e.to_string()))?;
        let _guard = self.mutation.lock().unwrap();
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| CodecError::InvalidUpdate(e.to_string()))
    }

    /// Encoded state vector for reconciliation requests.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// State diff against a peer's encoded state vector.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, CodecError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| CodecError::InvalidUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Contents of a named text root ("" when absent). Convenience for
    /// hosts and tests.
    pub fn text_content(&self, name: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(name)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    fn notify(&self, update: &Update) {
        // Clone the handler list out so handlers run without the registry
        // lock held.
        let handlers: Vec<Handler> = {
            let mut reg = self.registry.lock().unwrap();
            reg.update_count += 1;
            reg.handlers.values().cloned().collect()
        };
        for handler in handlers {
            handler(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use yrs::{Text, WriteTxn};

    fn insert_text(store: &DocumentStore, text: &str) -> Update {
        let origin = Origin::Local { client_id: store.client_id() };
        let (update, _) = store.apply_local(origin, |txn| {
            let root = txn.get_or_insert_text("content");
            let end = root.len(txn);
            root.insert(txn, end, text);
        });
        update
    }

    #[test]
    fn test_local_mutation_visible_on_return() {
        let store = DocumentStore::new(Uuid::new_v4());
        insert_text(&store, "hello");
        assert_eq!(store.text_content("content"), "hello");
    }

    #[test]
    fn test_convergence_any_order() {
        let a = DocumentStore::new(Uuid::new_v4());
        let b = DocumentStore::new(Uuid::new_v4());

        let u1 = insert_text(&a, "alpha ");
        let u2 = insert_text(&b, "beta ");

        // Cross-apply in opposite orders.
        let as_remote = |u: &Update, from: &DocumentStore| Update {
            payload: u.payload.clone(),
            origin: Origin::Remote { client_id: from.client_id() },
        };
        a.apply_remote(&as_remote(&u2, &b)).unwrap();
        b.apply_remote(&as_remote(&u1, &a)).unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.text_content("content"), b.text_content("content"));
    }

    #[test]
    fn test_idempotent_merge() {
        let a = DocumentStore::new(Uuid::new_v4());
        let b = DocumentStore::new(Uuid::new_v4());

        let update = insert_text(&a, "once");
        let remote = Update {
            payload: update.payload.clone(),
            origin: Origin::Remote { client_id: a.client_id() },
        };

        b.apply_remote(&remote).unwrap();
        let first = b.snapshot();
        b.apply_remote(&remote).unwrap();
        assert_eq!(b.snapshot(), first);
        assert_eq!(b.text_content("content"), "once");
    }

    #[test]
    fn test_loopback_is_noop() {
        let store = DocumentStore::new(Uuid::new_v4());
        insert_text(&store, "mine");
        let count_before = store.update_count();

        let looped = Update {
            payload: store.snapshot(),
            origin: Origin::Remote { client_id: store.client_id() },
        };
        let applied = store.apply_remote(&looped).unwrap();

        assert!(!applied);
        assert_eq!(store.update_count(), count_before);
    }

    #[test]
    fn test_malformed_update_rejected_wholesale() {
        let store = DocumentStore::new(Uuid::new_v4());
        insert_text(&store, "safe");
        let before = store.snapshot();

        let bad = Update {
            payload: vec![0xFF, 0xFE, 0xFD],
            origin: Origin::Remote { client_id: Uuid::new_v4() },
        };
        assert!(store.apply_remote(&bad).is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_subscribe_receives_origin() {
        let store = DocumentStore::new(Uuid::new_v4());
        let local_seen = Arc::new(AtomicU64::new(0));
        let remote_seen = Arc::new(AtomicU64::new(0));

        let (l, r) = (local_seen.clone(), remote_seen.clone());
        let _sub = store.subscribe(move |update| match update.origin {
            Origin::Remote { .. } => {
                r.fetch_add(1, Ordering::SeqCst);
            }
            _ => {
                l.fetch_add(1, Ordering::SeqCst);
            }
        });

        let other = DocumentStore::new(Uuid::new_v4());
        let u = insert_text(&other, "remote text");
        insert_text(&store, "local text");
        store
            .apply_remote(&Update {
                payload: u.payload,
                origin: Origin::Remote { client_id: other.client_id() },
            })
            .unwrap();

        assert_eq!(local_seen.load(Ordering::SeqCst), 1);
        assert_eq!(remote_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = DocumentStore::new(Uuid::new_v4());
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let sub = store.subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        insert_text(&store, "a");
        store.unsubscribe(sub);
        insert_text(&store, "b");

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let a = DocumentStore::new(Uuid::new_v4());
        insert_text(&a, "persist me");

        let b = DocumentStore::new(Uuid::new_v4());
        b.restore(&a.snapshot()).unwrap();
        assert_eq!(b.text_content("content"), "persist me");
    }

    #[test]
    fn test_diff_covers_missing_updates() {
        let a = DocumentStore::new(Uuid::new_v4());
        let b = DocumentStore::new(Uuid::new_v4());
        insert_text(&a, "ahead");

        let diff = a.diff(&b.state_vector()).unwrap();
        b.apply_remote(&Update {
            payload: diff,
            origin: Origin::Remote { client_id: a.client_id() },
        })
        .unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_synthetic_origin_broadcasts() {
        assert!(Origin::synthetic("ai-assistant").should_broadcast());
        assert!(Origin::Local { client_id: Uuid::new_v4() }.should_broadcast());
        assert!(!Origin::Remote { client_id: Uuid::new_v4() }.should_broadcast());
    }
}
