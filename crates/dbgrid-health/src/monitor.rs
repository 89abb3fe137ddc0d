//! Peer health monitor — background task that closes check intervals.
//!
//! Heartbeats are fed in with [`PeerHealthMonitor::record_seen`]; the
//! background loop runs [`PeerTracker::check`] on a fixed interval and
//! reports transitions through the registered callback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use dbgrid_state::PeerId;

use crate::checker::{PeerHealth, PeerTracker};

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Callback invoked when a peer's health changes.
///
/// The coordinator uses this to start node replacement.
pub type HealthCallback = Arc<dyn Fn(PeerId, PeerHealth) -> BoxFuture + Send + Sync>;

/// Shared handle onto the peer tracker and its check loop.
#[derive(Clone)]
pub struct PeerHealthMonitor {
    local_peer: PeerId,
    interval: Duration,
    tracker: Arc<Mutex<PeerTracker>>,
    on_status_change: Option<HealthCallback>,
}

impl PeerHealthMonitor {
    pub fn new(local_peer: impl Into<PeerId>, interval: Duration, unhealthy_threshold: u32) -> Self {
        Self {
            local_peer: local_peer.into(),
            interval,
            tracker: Arc::new(Mutex::new(PeerTracker::new(unhealthy_threshold))),
            on_status_change: None,
        }
    }

    /// Set a callback for health transitions.
    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    /// Feed a heartbeat from `peer`. The local peer is never tracked.
    pub async fn record_seen(&self, peer: &str) {
        if peer == self.local_peer {
            return;
        }
        let recovered = self.tracker.lock().expect("tracker lock").record_seen(peer);
        if let (Some(health), Some(cb)) = (recovered, &self.on_status_change) {
            cb(peer.to_string(), health).await;
        }
    }

    /// Close one check interval and fire callbacks for new failures.
    pub async fn check_now(&self) -> Vec<PeerId> {
        let failed = self.tracker.lock().expect("tracker lock").check();
        if let Some(cb) = &self.on_status_change {
            for peer in &failed {
                cb(peer.clone(), PeerHealth::Unhealthy).await;
            }
        }
        failed
    }

    pub fn health(&self, peer: &str) -> Option<PeerHealth> {
        self.tracker.lock().expect("tracker lock").health(peer)
    }

    /// Whether `peer` is believed reachable. The local peer always is.
    pub fn is_healthy(&self, peer: &str) -> bool {
        peer == self.local_peer || self.tracker.lock().expect("tracker lock").is_healthy(peer)
    }

    pub fn healthy_peers(&self) -> Vec<PeerId> {
        self.tracker.lock().expect("tracker lock").healthy_peers()
    }

    /// Spawn the periodic check loop. It exits when `shutdown` flips.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            info!(interval = ?monitor.interval, "peer health monitor started");
            let mut ticker = tokio::time::interval(monitor.interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let failed = monitor.check_now().await;
                        if !failed.is_empty() {
                            debug!(?failed, "health check closed with failures");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("peer health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_callback() -> (HealthCallback, Arc<Mutex<Vec<(PeerId, PeerHealth)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: HealthCallback = Arc::new(move |peer, health| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push((peer, health));
            })
        });
        (cb, seen)
    }

    #[tokio::test]
    async fn local_peer_is_never_tracked() {
        let monitor = PeerHealthMonitor::new("a", Duration::from_secs(1), 1);
        monitor.record_seen("a").await;
        assert_eq!(monitor.health("a"), None);
        assert!(monitor.is_healthy("a"));
    }

    #[tokio::test]
    async fn callback_fires_on_failure_and_recovery() {
        let (cb, seen) = recording_callback();
        let monitor = PeerHealthMonitor::new("a", Duration::from_secs(1), 2).with_callback(cb);

        monitor.record_seen("b").await;
        monitor.check_now().await;
        monitor.check_now().await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(monitor.check_now().await, vec!["b".to_string()]);
        assert!(!monitor.is_healthy("b"));

        monitor.record_seen("b").await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("b".to_string(), PeerHealth::Unhealthy),
                ("b".to_string(), PeerHealth::Healthy),
            ]
        );
    }

    #[tokio::test]
    async fn background_loop_detects_silent_peer() {
        let (cb, seen) = recording_callback();
        let monitor =
            PeerHealthMonitor::new("a", Duration::from_millis(20), 2).with_callback(cb);
        monitor.record_seen("b").await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = monitor.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(monitor.health("b"), Some(PeerHealth::Unhealthy));
        assert_eq!(seen.lock().unwrap().len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
