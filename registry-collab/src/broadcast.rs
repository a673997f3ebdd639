//! Per-channel fan-out of encoded frames.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to `capacity`
//! frames; a subscriber that falls further behind loses the oldest frames and
//! is told how many it missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames sent while nobody was subscribed.
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters; read via [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Fan-out group for a single channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a lagging subscriber may buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Send pre-encoded bytes to every subscriber, the sender included.
    /// Returns the number of receivers.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        match self.sender.send(encoded) {
            Ok(count) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps channel names to broadcast groups so channels stay isolated.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, channel: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(group) = channels.get(channel) {
                return group.clone();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<BroadcastGroup>> {
        self.channels.read().await.get(channel).cloned()
    }

    /// Remove a channel nobody listens to any more.
    pub async fn remove_if_idle(&self, channel: &str) -> bool {
        let mut channels = self.channels.write().await;
        let idle = channels
            .get(channel)
            .is_some_and(|group| group.subscriber_count() == 0);
        if idle {
            channels.remove(channel);
        }
        idle
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }
}
