//! dbgrid-state — replicated database metadata.
//!
//! Every node holds its own copy of the cluster's database records in a
//! [`MetadataStore`]. Copies converge through gossip: each record carries a
//! [`VectorClock`] stamped on every local mutation, and incoming copies are
//! folded in with [`MetadataStore::merge`], which replaces, discards, or
//! field-merges depending on how the two clocks compare.
//!
//! # Architecture
//!
//! ```text
//! MetadataStore (Clone, Arc-backed)
//!   ├── records: name → Mutex<record>   (per-record write serialization)
//!   ├── capacities: peer → NodeCapacity (heartbeat-fed, never journaled)
//!   └── RecordJournal (optional redb table, reloaded on open)
//! ```

pub mod clock;
pub mod digest;
pub mod error;
pub mod journal;
pub mod merge;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{ClockOrdering, VectorClock};
pub use error::{StateError, StateResult};
pub use journal::RecordJournal;
pub use store::{MergeOutcome, MetadataStore};
pub use types::*;
