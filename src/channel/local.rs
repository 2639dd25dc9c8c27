//! In-process broadcast relay.
//!
//! Every document id maps to one fan-out topic; all channel handles for
//! the same document share it. Frames loop back to the publishing handle,
//! which is deliberate: it exercises the same echo-suppression path a
//! loop-back-configured remote relay would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{BroadcastChannel, ChannelError, ChannelStatus, Frame};

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub frames_published: u64,
    pub active_topics: usize,
}

/// Registry of per-document topics.
pub struct LocalRelay {
    topics: RwLock<HashMap<Uuid, broadcast::Sender<Frame>>>,
    capacity: usize,
    frames_published: Arc<AtomicU64>,
}

impl LocalRelay {
    /// Create a relay whose topics buffer up to `capacity` frames per
    /// subscriber before lagging subscribers start dropping.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
            frames_published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open a channel handle onto the topic for `doc_id`, creating the
    /// topic if needed.
    pub fn channel(&self, doc_id: Uuid) -> LocalChannel {
        // Fast path: read lock.
        {
            let topics = self.topics.read().unwrap();
            if let Some(sender) = topics.get(&doc_id) {
                return LocalChannel::new(sender.clone(), self.frames_published.clone());
            }
        }

        let mut topics = self.topics.write().unwrap();
        // Double-check after acquiring the write lock.
        let sender = topics
            .entry(doc_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        LocalChannel::new(sender, self.frames_published.clone())
    }

    /// Drop a topic nobody subscribes to anymore.
    pub fn remove_if_idle(&self, doc_id: &Uuid) -> bool {
        let mut topics = self.topics.write().unwrap();
        if let Some(sender) = topics.get(doc_id) {
            if sender.receiver_count() == 0 {
                topics.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().unwrap().len()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            active_topics: self.topic_count(),
        }
    }
}

/// One handle onto a relay topic.
pub struct LocalChannel {
    sender: broadcast::Sender<Frame>,
    closed: AtomicBool,
    frames_published: Arc<AtomicU64>,
}

impl LocalChannel {
    fn new(sender: broadcast::Sender<Frame>, frames_published: Arc<AtomicU64>) -> Self {
        Self {
            sender,
            closed: AtomicBool::new(false),
            frames_published,
        }
    }
}

impl BroadcastChannel for LocalChannel {
    fn publish(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        // No subscribers is not an error for a broadcast topic.
        let _ = self.sender.send(Arc::new(frame));
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn frames(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    fn status(&self) -> ChannelStatus {
        if self.closed.load(Ordering::Acquire) {
            ChannelStatus::Closed
        } else {
            ChannelStatus::Connected
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
