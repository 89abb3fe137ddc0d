//! Missed-heartbeat accounting and the HTTP readiness probe.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use dbgrid_state::PeerId;

/// Result of a single HTTP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Healthy,
    /// The endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Locally observed liveness of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
struct PeerEntry {
    /// A heartbeat arrived since the previous check.
    seen: bool,
    consecutive_misses: u32,
    health: PeerHealth,
}

/// Tracks consecutive missed checks for every known peer.
///
/// A peer becomes known on its first heartbeat. Each `check` counts a
/// miss for every peer not seen since the previous check; reaching the
/// threshold marks it unhealthy. A later heartbeat restores it.
#[derive(Debug)]
pub struct PeerTracker {
    unhealthy_threshold: u32,
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            unhealthy_threshold: unhealthy_threshold.max(1),
            peers: HashMap::new(),
        }
    }

    /// Record a heartbeat. Returns `Some(Healthy)` if the peer was
    /// unhealthy and has recovered.
    pub fn record_seen(&mut self, peer: &str) -> Option<PeerHealth> {
        let entry = self.peers.entry(peer.to_string()).or_insert_with(|| {
            debug!(%peer, "tracking new peer");
            PeerEntry {
                seen: false,
                consecutive_misses: 0,
                health: PeerHealth::Healthy,
            }
        });
        entry.seen = true;
        entry.consecutive_misses = 0;

        if entry.health == PeerHealth::Unhealthy {
            entry.health = PeerHealth::Healthy;
            info!(%peer, "peer recovered");
            return Some(PeerHealth::Healthy);
        }
        None
    }

    /// Close one check interval. Returns the peers that crossed the
    /// threshold during this check.
    pub fn check(&mut self) -> Vec<PeerId> {
        let mut newly_unhealthy = Vec::new();
        for (peer, entry) in self.peers.iter_mut() {
            if entry.seen {
                entry.seen = false;
                continue;
            }

            entry.consecutive_misses += 1;
            if entry.consecutive_misses >= self.unhealthy_threshold
                && entry.health == PeerHealth::Healthy
            {
                entry.health = PeerHealth::Unhealthy;
                warn!(
                    %peer,
                    misses = entry.consecutive_misses,
                    threshold = self.unhealthy_threshold,
                    "peer marked unhealthy"
                );
                newly_unhealthy.push(peer.clone());
            }
        }
        newly_unhealthy.sort();
        newly_unhealthy
    }

    pub fn health(&self, peer: &str) -> Option<PeerHealth> {
        self.peers.get(peer).map(|e| e.health)
    }

    pub fn consecutive_misses(&self, peer: &str) -> u32 {
        self.peers.get(peer).map_or(0, |e| e.consecutive_misses)
    }

    pub fn is_healthy(&self, peer: &str) -> bool {
        self.health(peer) == Some(PeerHealth::Healthy)
    }

    /// Known peers currently considered healthy, sorted.
    pub fn healthy_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| e.health == PeerHealth::Healthy)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn forget(&mut self, peer: &str) -> bool {
        self.peers.remove(peer).is_some()
    }
}

/// Perform an HTTP GET probe against `address` + `path`.
///
/// Returns `Healthy` for 2xx, `Unhealthy` for any other status, and
/// `Failed` when the connection fails or the timeout passes.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "dbgrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "probe timed out");
        ProbeResult::Failed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peer_has_no_health() {
        let tracker = PeerTracker::new(3);
        assert_eq!(tracker.health("b"), None);
        assert!(!tracker.is_healthy("b"));
    }

    #[test]
    fn seen_peer_stays_healthy() {
        let mut tracker = PeerTracker::new(3);
        for _ in 0..10 {
            tracker.record_seen("b");
            assert!(tracker.check().is_empty());
        }
        assert!(tracker.is_healthy("b"));
        assert_eq!(tracker.consecutive_misses("b"), 0);
    }

    #[test]
    fn unhealthy_after_threshold_misses() {
        let mut tracker = PeerTracker::new(3);
        tracker.record_seen("b");
        assert!(tracker.check().is_empty()); // consumes the heartbeat

        assert!(tracker.check().is_empty());
        assert!(tracker.check().is_empty());
        assert_eq!(tracker.check(), vec!["b".to_string()]);
        assert_eq!(tracker.health("b"), Some(PeerHealth::Unhealthy));

        // Reported once, not on every later check.
        assert!(tracker.check().is_empty());
        assert_eq!(tracker.consecutive_misses("b"), 4);
    }

    #[test]
    fn heartbeat_resets_misses() {
        let mut tracker = PeerTracker::new(3);
        tracker.record_seen("b");
        tracker.check();
        tracker.check();
        tracker.check();
        assert_eq!(tracker.consecutive_misses("b"), 2);

        tracker.record_seen("b");
        assert_eq!(tracker.consecutive_misses("b"), 0);
        assert!(tracker.check().is_empty());
        assert!(tracker.check().is_empty());
        assert!(tracker.is_healthy("b"));
    }

    #[test]
    fn recovery_is_reported() {
        let mut tracker = PeerTracker::new(1);
        tracker.record_seen("b");
        tracker.check();
        assert_eq!(tracker.check(), vec!["b".to_string()]);

        assert_eq!(tracker.record_seen("b"), Some(PeerHealth::Healthy));
        assert_eq!(tracker.record_seen("b"), None);
        assert_eq!(tracker.healthy_peers(), vec!["b".to_string()]);
    }

    #[test]
    fn zero_threshold_treated_as_one() {
        let mut tracker = PeerTracker::new(0);
        tracker.record_seen("b");
        tracker.check();
        assert_eq!(tracker.check().len(), 1);
    }

    #[test]
    fn forget_drops_peer() {
        let mut tracker = PeerTracker::new(3);
        tracker.record_seen("b");
        assert!(tracker.forget("b"));
        assert!(!tracker.forget("b"));
        assert!(tracker.check().is_empty());
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_returns_failed() {
        let result = http_probe("127.0.0.1:1", "/status", Duration::from_millis(100)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn http_probe_reads_status_code() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let result = http_probe(&addr, "/status", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }
}
