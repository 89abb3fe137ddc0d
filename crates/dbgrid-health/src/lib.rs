//! dbgrid-health — peer liveness for dbgrid nodes.
//!
//! Every node broadcasts a heartbeat at the health-check interval. The
//! monitor counts, per peer, how many consecutive checks passed without
//! one; at the configured threshold the peer is declared unhealthy and the
//! registered callback fires so the coordinator can start replacement.
//!
//! # Architecture
//!
//! ```text
//! PeerHealthMonitor
//!   ├── record_seen(peer)      ← heartbeat handler
//!   ├── background check loop (fixed interval)
//!   │   └── PeerTracker::check() → transitions
//!   └── HealthCallback(peer, PeerHealth)
//! ```
//!
//! `http_probe` is the local readiness probe used against a database
//! engine's own HTTP port.

pub mod checker;
pub mod monitor;

pub use checker::{PeerHealth, PeerTracker, ProbeResult, http_probe};
pub use monitor::{BoxFuture, HealthCallback, PeerHealthMonitor};
