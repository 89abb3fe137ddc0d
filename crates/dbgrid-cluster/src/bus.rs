//! Message bus abstraction and the in-process hub.
//!
//! The transport is an external collaborator: anything that can publish
//! an opaque payload to every subscriber of a topic satisfies
//! [`MessageBus`]. [`LocalHub`] connects any number of peers inside one
//! process and is what single-node deployments and the multi-node tests
//! run on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use dbgrid_state::PeerId;

use crate::error::{ClusterError, ClusterResult};
use crate::message::{ClusterMessage, Topic};

/// Stream of raw payloads for one topic subscription.
pub type BusReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Broadcast transport keyed by topic.
///
/// Delivery is at-least-once per live subscriber and includes the
/// publisher's own subscriptions. Ordering holds per publisher and topic
/// only.
pub trait MessageBus: Send + Sync {
    /// Identity of the peer this handle publishes as.
    fn local_peer(&self) -> &str;

    fn publish(&self, topic: Topic, payload: Bytes) -> ClusterResult<()>;

    fn subscribe(&self, topic: Topic) -> ClusterResult<BusReceiver>;

    /// Peers the transport currently sees, including this one.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Encode `msg` and publish it on its topic.
    fn broadcast(&self, msg: &ClusterMessage) -> ClusterResult<()> {
        debug!(kind = msg.kind(), topic = %msg.topic(), "publishing");
        self.publish(msg.topic(), msg.encode()?)
    }
}

#[derive(Default)]
struct HubState {
    peers: HashMap<PeerId, Vec<(Topic, mpsc::UnboundedSender<Bytes>)>>,
    observers: Vec<(Topic, mpsc::UnboundedSender<Bytes>)>,
}

/// In-process broadcast hub shared by every connected [`LocalBus`].
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer and return its bus handle.
    pub fn connect(&self, peer: impl Into<PeerId>) -> LocalBus {
        let peer = peer.into();
        self.state
            .lock()
            .expect("hub lock")
            .peers
            .entry(peer.clone())
            .or_default();
        info!(%peer, "peer connected to local hub");
        LocalBus {
            hub: self.clone(),
            peer,
        }
    }

    /// Detach a peer: its subscriptions end and it can no longer publish.
    pub fn disconnect(&self, peer: &str) -> bool {
        let removed = self.state.lock().expect("hub lock").peers.remove(peer).is_some();
        if removed {
            info!(%peer, "peer disconnected from local hub");
        }
        removed
    }

    pub fn is_connected(&self, peer: &str) -> bool {
        self.state.lock().expect("hub lock").peers.contains_key(peer)
    }

    /// Connected peers, in identity order.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .state
            .lock()
            .expect("hub lock")
            .peers
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    /// Passive tap on a topic that is not itself a peer.
    pub fn observe(&self, topic: Topic) -> BusReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().expect("hub lock").observers.push((topic, tx));
        rx
    }

    fn publish_from(&self, from: &str, topic: Topic, payload: Bytes) -> ClusterResult<()> {
        let mut state = self.state.lock().expect("hub lock");
        if !state.peers.contains_key(from) {
            return Err(ClusterError::Disconnected(from.to_string()));
        }

        let mut delivered = 0usize;
        for subs in state.peers.values_mut() {
            subs.retain(|(t, tx)| {
                if *t != topic {
                    return true;
                }
                let ok = tx.send(payload.clone()).is_ok();
                delivered += usize::from(ok);
                ok
            });
        }
        state.observers.retain(|(t, tx)| *t != topic || tx.send(payload.clone()).is_ok());

        debug!(%from, %topic, delivered, "hub delivered payload");
        Ok(())
    }

    fn subscribe_for(&self, peer: &str, topic: Topic) -> ClusterResult<BusReceiver> {
        let mut state = self.state.lock().expect("hub lock");
        let subs = state
            .peers
            .get_mut(peer)
            .ok_or_else(|| ClusterError::Disconnected(peer.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        subs.push((topic, tx));
        Ok(rx)
    }
}

/// One peer's handle onto a [`LocalHub`].
#[derive(Clone)]
pub struct LocalBus {
    hub: LocalHub,
    peer: PeerId,
}

impl LocalBus {
    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }
}

impl MessageBus for LocalBus {
    fn local_peer(&self) -> &str {
        &self.peer
    }

    fn publish(&self, topic: Topic, payload: Bytes) -> ClusterResult<()> {
        self.hub.publish_from(&self.peer, topic, payload)
    }

    fn subscribe(&self, topic: Topic) -> ClusterResult<BusReceiver> {
        self.hub.subscribe_for(&self.peer, topic)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.hub.peers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wake(requester: &str) -> ClusterMessage {
        ClusterMessage::WakeupRequest {
            database: "orders".into(),
            requester: requester.into(),
        }
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber_including_self() {
        let hub = LocalHub::new();
        let a = hub.connect("a");
        let b = hub.connect("b");
        let mut rx_a = a.subscribe(Topic::Wakeup).unwrap();
        let mut rx_b = b.subscribe(Topic::Wakeup).unwrap();

        a.broadcast(&wake("a")).unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let payload = rx.recv().await.unwrap();
            assert_eq!(ClusterMessage::decode(&payload).unwrap(), wake("a"));
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let hub = LocalHub::new();
        let a = hub.connect("a");
        let mut status = a.subscribe(Topic::Status).unwrap();
        a.broadcast(&wake("a")).unwrap();
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_ends_subscriptions_and_publishing() {
        let hub = LocalHub::new();
        let a = hub.connect("a");
        let b = hub.connect("b");
        let mut rx_b = b.subscribe(Topic::Wakeup).unwrap();

        assert!(hub.disconnect("b"));
        assert!(rx_b.recv().await.is_none());
        assert!(matches!(b.broadcast(&wake("b")), Err(ClusterError::Disconnected(_))));
        assert!(a.broadcast(&wake("a")).is_ok());
        assert_eq!(a.connected_peers(), vec!["a"]);
    }

    #[tokio::test]
    async fn observer_sees_traffic_without_joining() {
        let hub = LocalHub::new();
        let a = hub.connect("a");
        let mut tap = hub.observe(Topic::Wakeup);
        a.broadcast(&wake("a")).unwrap();
        assert!(tap.recv().await.is_some());
        assert_eq!(hub.peers(), vec!["a"]);
    }
}
