//! WebSocket relay: channel fan-out between sites on different machines.
//!
//! ```text
//! WsTransport (site A) ──┐                       ┌──► WsTransport (site A)
//!                        ├── RelayServer ── ChannelRegistry ──┤
//! WsTransport (site B) ──┘   Subscribe / Publish  └──► WsTransport (site B)
//! ```
//!
//! The relay knows nothing about documents or operations. Clients send
//! [`RelayFrame::Subscribe`] for each channel they listen on and
//! [`RelayFrame::Publish`] for each message; every publish frame is forwarded
//! unchanged to all subscribers of its channel, the publisher included.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::ChannelRegistry;
use crate::protocol::{CollabMessage, RelayFrame};
use crate::transport::{MessageStream, Transport, TransportError};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames a slow subscriber may fall behind before it starts losing them
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn for_testing(port: u16) -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{port}"),
            channel_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    channels: Arc<ChannelRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            channels: Arc::new(ChannelRegistry::new(config.channel_capacity)),
            config,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Accept WebSocket connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let channels = self.channels.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, channels, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        channels: Arc<ChannelRegistry>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Forwarder tasks push subscribed frames here
        let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(256);
        let mut subscribed: HashSet<String> = HashSet::new();
        let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match RelayFrame::decode(&bytes) {
                                Ok(RelayFrame::Subscribe { channel }) => {
                                    if !subscribed.insert(channel.clone()) {
                                        continue;
                                    }
                                    let group = channels.get_or_create(&channel).await;
                                    let rx = group.subscribe();
                                    forwarders.push(tokio::spawn(forward(channel.clone(), rx, out_tx.clone())));
                                    stats.write().await.active_channels = channels.channel_count().await;
                                    log::debug!("{addr} subscribed to {channel}");
                                }
                                Ok(RelayFrame::Publish { channel, .. }) => {
                                    let group = channels.get_or_create(&channel).await;
                                    let receivers = group.broadcast_raw(Arc::new(bytes));
                                    log::trace!("{addr} published on {channel} to {receivers} subscriber(s)");
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }

                        _ => {}
                    }
                }

                Some(data) = out_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        for forwarder in forwarders {
            forwarder.abort();
        }
        for channel in &subscribed {
            channels.remove_if_idle(channel).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_channels = channels.channel_count().await;
        }

        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }
}

/// Copy one channel's frames into a connection's outbound queue.
async fn forward(
    channel: String,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    out: mpsc::Sender<Arc<Vec<u8>>>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if out.send(frame).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => {
                log::warn!("Relay subscriber on {channel} lagged by {n} frames");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

type LocalChannels = Arc<RwLock<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>>;

/// [`Transport`] over a [`RelayServer`] connection.
///
/// One WebSocket carries every channel; inbound publish frames are fanned out
/// locally to the [`MessageStream`]s subscribed to their channel.
pub struct WsTransport {
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    channels: LocalChannels,
    capacity: usize,
}

impl WsTransport {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:9090`).
    pub async fn connect(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::connect_with_capacity(url, 256).await
    }

    pub async fn connect_with_capacity(
        url: impl Into<String>,
        capacity: usize,
    ) -> Result<Self, TransportError> {
        let url = url.into();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            log::error!("Failed to connect to relay {url}: {e}");
            TransportError::Connect(e.to_string())
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            // Transport dropped
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let channels: LocalChannels = Arc::new(RwLock::new(HashMap::new()));
        let reader_channels = channels.clone();
        let reader_state = state.clone();
        let reader_url = url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayFrame::decode(&bytes) {
                            Ok(RelayFrame::Publish { channel, payload }) => {
                                if let Some(tx) = reader_channels.read().await.get(&channel) {
                                    let _ = tx.send(Arc::new(payload));
                                }
                            }
                            Ok(other) => {
                                log::debug!("Ignoring {other:?} from relay");
                            }
                            Err(e) => {
                                log::warn!("Failed to decode frame from relay: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
            // Closing the local senders ends every MessageStream
            reader_channels.write().await.clear();
            log::info!("Disconnected from relay {reader_url}");
        });

        *state.write().await = ConnectionState::Connected;
        log::info!("Connected to relay {url}");

        Ok(Self {
            url,
            state,
            outgoing_tx: out_tx,
            channels,
            capacity: capacity.max(1),
        })
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<(), TransportError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(TransportError::ConnectionClosed);
        }
        let encoded = frame.encode()?;
        self.outgoing_tx
            .send(encoded)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn publish(&self, channel: &str, message: &CollabMessage) -> Result<(), TransportError> {
        let frame = RelayFrame::Publish {
            channel: channel.to_string(),
            payload: message.encode()?,
        };
        self.send_frame(&frame).await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, TransportError> {
        let (rx, is_new) = {
            let mut channels = self.channels.write().await;
            match channels.get(channel) {
                Some(tx) => (tx.subscribe(), false),
                None => {
                    let (tx, rx) = broadcast::channel(self.capacity);
                    channels.insert(channel.to_string(), tx);
                    (rx, true)
                }
            }
        };

        if is_new {
            let frame = RelayFrame::Subscribe {
                channel: channel.to_string(),
            };
            if let Err(e) = self.send_frame(&frame).await {
                self.channels.write().await.remove(channel);
                return Err(e);
            }
        }
        Ok(MessageStream::new(channel, rx))
    }
}
