//! Broadcast channel abstraction.
//!
//! The sync core treats the relay as an external pub/sub collaborator with
//! at-least-once delivery and no ordering guarantee. Frames are opaque
//! bytes; the channel is allowed to loop a frame back to its sender —
//! echo suppression is the transport adapter's job, never the channel's.
//!
//! Two implementations ship:
//! - [`local`] — in-process relay for tests and single-process setups
//! - [`ws`] — WebSocket relay client with bounded reconnect

pub mod local;
pub mod ws;

use std::sync::Arc;
use tokio::sync::broadcast;

/// A frame on the wire. `Arc` so fan-out to N subscribers is zero-copy.
pub type Frame = Arc<Vec<u8>>;

/// Channel errors.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// The channel was closed and will not deliver further frames.
    Closed,
    /// Initial connection or reconnection failed.
    ConnectFailed(String),
    /// The outgoing queue is full; the frame was not published.
    Backpressure,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "Channel closed"),
            ChannelError::ConnectFailed(e) => write!(f, "Channel connect failed: {e}"),
            ChannelError::Backpressure => write!(f, "Channel outgoing queue full"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Transport-level connection state, as far as the channel can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Reconnecting,
    Closed,
}

/// One subscription to a broadcast topic, bound to a single document.
pub trait BroadcastChannel: Send + Sync {
    /// Publish a frame to every subscriber of the topic. At-least-once;
    /// the publisher itself may receive the frame back.
    fn publish(&self, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Subscribe to the inbound frame stream.
    fn frames(&self) -> broadcast::Receiver<Frame>;

    /// Current connection state.
    fn status(&self) -> ChannelStatus;

    /// Tear the subscription down. Idempotent.
    fn close(&self);
}
