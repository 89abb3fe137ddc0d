//! dbgrid-cluster — peer-to-peer coordination plumbing.
//!
//! Nodes never talk to a central controller. They publish
//! [`ClusterMessage`]s on a handful of topics of a [`MessageBus`], and
//! make per-operation decisions with the deterministic [`elect`].
//!
//! # Architecture
//!
//! ```text
//! MessageBus (trait)
//!   ├── publish(topic, bytes) / subscribe(topic)
//!   └── LocalHub / LocalBus: in-process implementation
//!
//! ClusterMessage (tagged enum, JSON on the wire)
//!   └── decode-then-match at one entry point per topic
//!
//! Barriers<K, T>
//!   └── Window: collects correlated replies until a condition
//!       holds or a deadline passes; dropping the window closes it
//! ```

pub mod barrier;
pub mod bus;
pub mod election;
pub mod error;
pub mod message;

pub use barrier::{Barriers, Collected, Window};
pub use bus::{BusReceiver, LocalBus, LocalHub, MessageBus};
pub use election::{elect, select_lowest};
pub use error::{ClusterError, ClusterResult};
pub use message::{ClusterMessage, Topic};
