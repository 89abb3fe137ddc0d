//! dbgrid-instance — database engines hosted on this node.
//!
//! - **Ports**: [`PortManager`] hands out `(http, raft)` pairs from the
//!   node's configured ranges under a single mutex.
//! - **Engines**: the [`Engine`] trait starts, stops and probes one
//!   replica. [`SubprocessEngine`] runs the configured binary;
//!   [`MemoryEngine`] only records launches.
//! - **Lifecycle**: [`InstanceManager`] ties the two together, so a
//!   launch that fails or is abandoned always gives its ports back.
//!
//! # Architecture
//!
//! ```text
//! InstanceManager
//!   ├── PortManager (Mutex<allocations>)
//!   ├── Arc<dyn Engine>
//!   │   ├── SubprocessEngine (tokio::process, SIGTERM then kill)
//!   │   └── MemoryEngine
//!   └── database → LocalInstance { state, endpoint, handle }
//! ```

pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod ports;

pub use engine::{Engine, EngineHandle, LaunchSpec, MemoryEngine, SubprocessEngine};
pub use error::{InstanceError, InstanceResult, PortError, PortResult};
pub use lifecycle::{InstanceManager, LocalState};
pub use ports::PortManager;
