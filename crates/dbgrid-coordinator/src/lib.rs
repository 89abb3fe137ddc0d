//! dbgrid-coordinator — the dbgrid node.
//!
//! A [`Node`] joins the bus and takes part in every protocol:
//!
//! - Creates databases with a request/offer/confirm handshake, coordinated
//!   by the lowest offering peer
//! - Hibernates databases whose members have all been idle, and wakes
//!   them on demand
//! - Replaces members that stop sending heartbeats
//! - Gossips metadata digests and merges peers' records
//! - Removes unclaimed data directories on startup
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── MetadataStore (records + capacities, redb journal)
//!   ├── MessageBus (one dispatch loop per topic)
//!   │   └── ClusterMessage → handler or Barriers<name, DbEvent>
//!   ├── InstanceManager (ports + engine processes)
//!   ├── PeerHealthMonitor (heartbeat misses → replacement)
//!   └── Background loops: heartbeat, gossip, idle check
//! ```

pub mod error;
pub mod reconcile;

mod create;
mod events;
mod gossip;
mod hibernate;
mod node;
mod replacement;

pub use error::{CoordinatorError, CoordinatorResult};
pub use node::Node;
pub use reconcile::{ReconcileReport, reconcile_data_dirs};
