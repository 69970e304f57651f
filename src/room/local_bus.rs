//! Local Discovery Bus
//!
//! Same-device fallback for room discovery: a registry of broadcast
//! channels keyed by room ID. Every outbound signal is mirrored here, so
//! two identities sharing a registry find each other even with zero
//! brokers reachable. Like the broker path, a sender receives its own
//! publishes back; the self-filter in the router drops the echo.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::broadcast;

/// Buffered frames per room channel.
const BUS_CAPACITY: usize = 64;

/// Shared registry of per-room local channels.
#[derive(Debug, Clone, Default)]
pub struct LocalBusRegistry {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
}

impl LocalBusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the channel for a room.
    pub fn channel(&self, room_id: &str) -> broadcast::Sender<Bytes> {
        let mut channels = self.channels.lock().expect("local bus poisoned");
        channels
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone()
    }

    /// Drop channels nobody listens to anymore.
    pub fn prune(&self) {
        let mut channels = self.channels.lock().expect("local bus poisoned");
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_room_shares_a_channel() {
        let registry = LocalBusRegistry::new();
        let tx = registry.channel("room1");
        let mut rx = registry.channel("room1").subscribe();

        tx.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn different_rooms_are_isolated() {
        let registry = LocalBusRegistry::new();
        let tx = registry.channel("room1");
        let mut rx_other = registry.channel("room2").subscribe();

        let _ = tx.send(Bytes::from_static(b"hello"));
        assert!(matches!(
            rx_other.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn prune_drops_idle_channels() {
        let registry = LocalBusRegistry::new();
        let _tx = registry.channel("idle");
        registry.prune();
        // Channel was recreated fresh, proving the idle one was dropped.
        assert_eq!(registry.channel("idle").receiver_count(), 0);
    }
}
