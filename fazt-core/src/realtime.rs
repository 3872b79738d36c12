//! Realtime bus
//!
//! In-process pub/sub for app-scoped channels, named `app:<id>:<name>`.
//! Each channel is a bounded broadcast ring; publishers never block, and a
//! subscriber that falls behind the ring capacity is dropped (it observes
//! `Lagged` and its stream ends).

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Ring capacity per channel.
const CHANNEL_CAPACITY: usize = 256;

/// A published message.
#[derive(Debug, Clone)]
pub struct RealtimeMessage {
    /// Channel name within the app
    pub channel: String,
    /// JSON payload, serialized
    pub data: String,
}

/// The bus. One per process.
pub struct RealtimeBus {
    channels: RwLock<HashMap<String, broadcast::Sender<RealtimeMessage>>>,
}

impl RealtimeBus {
    #[must_use]
    pub fn new() -> Self {
        Self { channels: RwLock::new(HashMap::new()) }
    }

    fn key(app_id: &str, channel: &str) -> String {
        format!("app:{app_id}:{channel}")
    }

    /// Subscribe to an app channel, creating it on first use.
    pub fn subscribe(&self, app_id: &str, channel: &str) -> broadcast::Receiver<RealtimeMessage> {
        let key = Self::key(app_id, channel);
        {
            let channels = self.channels.read().expect("bus lock poisoned");
            if let Some(sender) = channels.get(&key) {
                return sender.subscribe();
            }
        }
        let mut channels = self.channels.write().expect("bus lock poisoned");
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish; returns the number of current subscribers.
    pub fn broadcast(&self, app_id: &str, channel: &str, data: String) -> usize {
        let key = Self::key(app_id, channel);
        let channels = self.channels.read().expect("bus lock poisoned");
        match channels.get(&key) {
            Some(sender) => sender
                .send(RealtimeMessage { channel: channel.to_string(), data })
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Drop channels with no remaining subscribers.
    pub fn sweep(&self) {
        let mut channels = self.channels.write().expect("bus lock poisoned");
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    /// Active channel count.
    pub fn channel_count(&self) -> usize {
        self.channels.read().expect("bus lock poisoned").len()
    }
}

impl Default for RealtimeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = RealtimeBus::new();
        let mut rx = bus.subscribe("app1", "chat");
        let delivered = bus.broadcast("app1", "chat", "\"hi\"".to_string());
        assert_eq!(delivered, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "chat");
        assert_eq!(msg.data, "\"hi\"");
    }

    #[tokio::test]
    async fn test_channels_are_app_scoped() {
        let bus = RealtimeBus::new();
        let mut rx = bus.subscribe("app1", "chat");
        bus.broadcast("app2", "chat", "\"other\"".to_string());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = RealtimeBus::new();
        assert_eq!(bus.broadcast("app1", "nobody", "\"x\"".to_string()), 0);
    }

    #[tokio::test]
    async fn test_ordering_per_channel() {
        let bus = RealtimeBus::new();
        let mut rx = bus.subscribe("app1", "seq");
        for n in 0..5 {
            bus.broadcast("app1", "seq", n.to_string());
        }
        for n in 0..5 {
            assert_eq!(rx.recv().await.unwrap().data, n.to_string());
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_dead_channels() {
        let bus = RealtimeBus::new();
        let rx = bus.subscribe("app1", "temp");
        assert_eq!(bus.channel_count(), 1);
        drop(rx);
        bus.sweep();
        assert_eq!(bus.channel_count(), 0);
    }
}
