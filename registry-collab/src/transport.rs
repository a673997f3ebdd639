//! Message transport seam between sessions.
//!
//! The session only needs to publish a message on a channel and to receive
//! whatever is published on the channels it subscribed to. Delivery order
//! across sites, reliability, and reconnection belong to the implementation.
//!
//! Two implementations ship with the crate: [`LocalHub`] (in-process) and
//! [`crate::relay::WsTransport`] (WebSocket relay client).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::broadcast::{BroadcastStats, ChannelRegistry};
use crate::protocol::{CollabMessage, ProtocolError};

/// Channel carrying all traffic for one document.
pub fn document_channel(document_id: &str) -> String {
    format!("collab:{document_id}")
}

/// Transport failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection failed: {0}")]
    Connect(String),
}

/// Publish/subscribe over named channels.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, message: &CollabMessage) -> Result<(), TransportError>;

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, TransportError>;
}

/// Receiving end of a channel subscription. Dropping it unsubscribes.
pub struct MessageStream {
    channel: String,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl MessageStream {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<Arc<Vec<u8>>>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next decodable message; `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<CollabMessage> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => {
                    if let Some(msg) = self.decode(&bytes) {
                        return Some(msg);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Subscriber on {} lagged by {n} messages", self.channel);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next message already delivered, without waiting.
    pub fn try_recv(&mut self) -> Option<CollabMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(bytes) => {
                    if let Some(msg) = self.decode(&bytes) {
                        return Some(msg);
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    log::warn!("Subscriber on {} lagged by {n} messages", self.channel);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Option<CollabMessage> {
        match CollabMessage::decode(bytes) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::warn!("Dropping undecodable message on {}: {e}", self.channel);
                None
            }
        }
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("channel", &self.channel)
            .finish()
    }
}

/// In-process transport: every clone shares the same channels.
///
/// Messages are delivered to all subscribers of the channel, the publisher
/// included, in publish order.
#[derive(Clone)]
pub struct LocalHub {
    channels: Arc<ChannelRegistry>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(ChannelRegistry::new(capacity)),
        }
    }

    pub async fn stats(&self, channel: &str) -> Option<BroadcastStats> {
        self.channels.get(channel).await.map(|group| group.stats())
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.channel_count().await
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn publish(&self, channel: &str, message: &CollabMessage) -> Result<(), TransportError> {
        let encoded = message.encode()?;
        let group = self.channels.get_or_create(channel).await;
        let receivers = group.broadcast_raw(Arc::new(encoded));
        log::trace!(
            "Published {} on {channel} to {receivers} subscriber(s)",
            message.message_type().as_str()
        );
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, TransportError> {
        let group = self.channels.get_or_create(channel).await;
        Ok(MessageStream::new(channel, group.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::CursorColor;

    fn cursor(site: &str, position: usize) -> CollabMessage {
        CollabMessage::CursorUpdate {
            document_id: "doc".into(),
            site_id: site.into(),
            position,
            color: CursorColor::default(),
        }
    }

    #[test]
    fn test_document_channel_name() {
        assert_eq!(document_channel("abc"), "collab:abc");
    }

    #[tokio::test]
    async fn test_local_hub_delivers_to_all_subscribers() {
        let hub = LocalHub::new(16);
        let mut a = hub.subscribe("collab:doc").await.unwrap();
        let mut b = hub.subscribe("collab:doc").await.unwrap();

        hub.publish("collab:doc", &cursor("s1", 4)).await.unwrap();

        assert_eq!(a.recv().await, Some(cursor("s1", 4)));
        assert_eq!(b.try_recv(), Some(cursor("s1", 4)));
        assert_eq!(b.try_recv(), None);
    }

    #[tokio::test]
    async fn test_local_hub_preserves_publish_order() {
        let hub = LocalHub::default();
        let mut rx = hub.subscribe("collab:doc").await.unwrap();
        for i in 0..5 {
            hub.publish("collab:doc", &cursor("s1", i)).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.try_recv(), Some(cursor("s1", i)));
        }
    }

    #[tokio::test]
    async fn test_clones_share_channels() {
        let hub = LocalHub::new(16);
        let other = hub.clone();
        let mut rx = other.subscribe("collab:doc").await.unwrap();
        hub.publish("collab:doc", &cursor("s1", 1)).await.unwrap();
        assert!(rx.try_recv().is_some());
        assert_eq!(hub.channel_count().await, 1);

        let stats = hub.stats("collab:doc").await.unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.active_subscribers, 1);
    }

    #[tokio::test]
    async fn test_stream_skips_garbage() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = MessageStream::new("collab:doc", rx);
        tx.send(Arc::new(vec![0xFF, 0x00])).unwrap();
        tx.send(Arc::new(cursor("s1", 2).encode().unwrap())).unwrap();
        assert_eq!(stream.try_recv(), Some(cursor("s1", 2)));

        drop(tx);
        assert_eq!(stream.recv().await, None);
    }
}
