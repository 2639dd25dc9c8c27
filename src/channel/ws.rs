//! WebSocket relay channel.
//!
//! Connects to a relay endpoint (`{url}/{doc_id}`), forwards published
//! frames over the socket and fans inbound binary frames out to
//! subscribers. On connection loss it reconnects with exponential backoff,
//! bounded by a configurable attempt count; once the attempts are
//! exhausted the channel reports [`ChannelStatus::Closed`].
//!
//! Missed frames during an outage are not replayed here — the CRDT layer
//! tolerates gaps and the persistence backstop covers long partitions.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{BroadcastChannel, ChannelError, ChannelStatus, Frame};

/// WebSocket channel configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Relay base URL, e.g. `ws://relay.example:9090`.
    pub url: String,
    /// Outgoing frame queue depth.
    pub outgoing_capacity: usize,
    /// Inbound fan-out buffer per subscriber.
    pub incoming_capacity: usize,
    /// Maximum reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Backoff ceiling.
    pub reconnect_max_delay: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outgoing_capacity: 256,
            incoming_capacity: 256,
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// WebSocket-backed [`BroadcastChannel`].
pub struct WsChannel {
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: broadcast::Sender<Frame>,
    status: Arc<RwLock<ChannelStatus>>,
    shutdown: watch::Sender<bool>,
}

impl WsChannel {
    /// Connect to the relay topic for `doc_id` and spawn the I/O task.
    pub async fn connect(config: WsConfig, doc_id: Uuid) -> Result<Self, ChannelError> {
        let url = format!("{}/{}", config.url, doc_id);
        let (stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_capacity);
        let (incoming_tx, _) = broadcast::channel(config.incoming_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = Arc::new(RwLock::new(ChannelStatus::Connected));

        tokio::spawn(run_io(
            config,
            url,
            stream,
            outgoing_rx,
            incoming_tx.clone(),
            status.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            outgoing: outgoing_tx,
            incoming: incoming_tx,
            status,
            shutdown: shutdown_tx,
        })
    }
}

impl BroadcastChannel for WsChannel {
    fn publish(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        match self.status() {
            ChannelStatus::Closed => return Err(ChannelError::Closed),
            _ => {}
        }
        self.outgoing.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    fn frames(&self) -> broadcast::Receiver<Frame> {
        self.incoming.subscribe()
    }

    fn status(&self) -> ChannelStatus {
        *self.status.read().unwrap()
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
        *self.status.write().unwrap() = ChannelStatus::Closed;
    }
}

/// Socket I/O loop: pump frames both ways, reconnect on loss.
async fn run_io(
    config: WsConfig,
    url: String,
    mut stream: WsStream,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    incoming: broadcast::Sender<Frame>,
    status: Arc<RwLock<ChannelStatus>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        *status.write().unwrap() = ChannelStatus::Connected;
        let (mut sink, mut source) = stream.split();

        // Pump until the socket drops or we are told to stop.
        let keep_going = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break false;
                }
                frame = outgoing.recv() => match frame {
                    Some(data) => {
                        if sink.send(Message::Binary(data.into())).await.is_err() {
                            break true;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break false;
                    }
                },
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let _ = incoming.send(Arc::new(bytes));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break true,
                    Some(Err(e)) => {
                        log::warn!("ws channel: socket error: {e}");
                        break true;
                    }
                    _ => {}
                },
            }
        };

        if !keep_going || *shutdown.borrow() {
            *status.write().unwrap() = ChannelStatus::Closed;
            return;
        }

        // Reconnect with capped exponential backoff.
        *status.write().unwrap() = ChannelStatus::Reconnecting;
        let mut attempt = 0u32;
        stream = loop {
            attempt += 1;
            if attempt > config.max_reconnect_attempts {
                log::error!(
                    "ws channel: giving up after {} reconnect attempts",
                    config.max_reconnect_attempts
                );
                *status.write().unwrap() = ChannelStatus::Closed;
                return;
            }

            let delay = config
                .reconnect_base_delay
                .saturating_mul(1u32 << (attempt - 1).min(16))
                .min(config.reconnect_max_delay);
            tokio::select! {
                _ = shutdown.changed() => {
                    *status.write().unwrap() = ChannelStatus::Closed;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match tokio_tungstenite::connect_async(&url).await {
                Ok((s, _)) => {
                    log::info!("ws channel: reconnected after {attempt} attempt(s)");
                    break s;
                }
                Err(e) => {
                    log::warn!("ws channel: reconnect attempt {attempt} failed: {e}");
                }
            }
        };
    }
}
