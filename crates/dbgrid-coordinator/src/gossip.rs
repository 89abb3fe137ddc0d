//! Heartbeats and metadata gossip.

use tokio::task::JoinHandle;
use tracing::debug;

use dbgrid_cluster::ClusterMessage;
use dbgrid_state::{DatabaseRecord, NodeCapacity, PeerId, epoch_millis};

use crate::node::Node;

/// Sync-request target meaning "whoever hears this".
pub(crate) const ANY_PEER: &str = "*";

impl Node {
    pub(crate) fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let period = self.inner.config.timing.health_check_interval;
        self.spawn_ticker("heartbeat", period, |node| async move { node.heartbeat() })
    }

    pub(crate) fn spawn_gossip_loop(&self) -> JoinHandle<()> {
        let period = self.inner.config.timing.discovery_interval;
        self.spawn_ticker("gossip", period, |node| async move { node.gossip_digest() })
    }

    /// This node's current capacity, as advertised in heartbeats.
    pub(crate) fn local_capacity(&self) -> NodeCapacity {
        NodeCapacity {
            peer_id: self.inner.peer_id.clone(),
            address: self.inner.config.node.advertise_host.clone(),
            max_databases: self.inner.config.node.max_databases,
            current_databases: self.inner.instances.count() as u32,
            last_heartbeat_at: epoch_millis(),
        }
    }

    fn heartbeat(&self) {
        let capacity = self.local_capacity();
        self.inner.store.upsert_capacity(capacity.clone());
        self.send(ClusterMessage::Heartbeat { capacity });
    }

    fn gossip_digest(&self) {
        self.send(ClusterMessage::MetadataDigest {
            from: self.inner.peer_id.clone(),
            checksum: self.inner.store.digest(),
            count: self.inner.store.list().len(),
        });
    }

    /// Ask every reachable peer for its records.
    pub(crate) async fn sync_on_startup(&self) {
        self.send(ClusterMessage::MetadataSyncRequest {
            requester: self.inner.peer_id.clone(),
            target: ANY_PEER.to_string(),
        });
        tokio::time::sleep(self.inner.config.timing.startup_sync_window).await;
        debug!(records = self.inner.store.list().len(), "startup sync window closed");
    }

    pub(crate) fn on_heartbeat(&self, capacity: NodeCapacity) {
        let peer = capacity.peer_id.clone();
        self.inner.store.upsert_capacity(capacity);
        if peer == self.inner.peer_id {
            return;
        }
        let health = self.inner.health.clone();
        tokio::spawn(async move { health.record_seen(&peer).await });
    }

    pub(crate) fn on_digest(&self, from: PeerId, checksum: String, count: usize) {
        if from == self.inner.peer_id || checksum == self.inner.store.digest() {
            return;
        }
        debug!(%from, remote_count = count, "metadata digest differs, requesting records");
        self.send(ClusterMessage::MetadataSyncRequest {
            requester: self.inner.peer_id.clone(),
            target: from,
        });
    }

    pub(crate) fn on_sync_request(&self, requester: PeerId, target: PeerId) {
        if requester == self.inner.peer_id || (target != self.inner.peer_id && target != ANY_PEER) {
            return;
        }
        self.send(ClusterMessage::MetadataSyncResponse {
            responder: self.inner.peer_id.clone(),
            target: requester,
            records: self.inner.store.list(),
        });
    }

    pub(crate) fn on_sync_response(&self, responder: PeerId, target: PeerId, records: Vec<DatabaseRecord>) {
        if target != self.inner.peer_id {
            return;
        }
        debug!(%responder, records = records.len(), "merging peer records");
        for record in records {
            self.apply_remote(record);
        }
    }
}
