//! dbgrid-core — configuration shared by every dbgrid crate.
//!
//! A node is configured from a single TOML file. Every field has a
//! default, so an empty file yields a valid single-node configuration
//! once a `peer_id` is supplied.

pub mod config;
pub mod duration;
pub mod error;

pub use config::{Config, DatabaseConfig, EngineConfig, NodeConfig, PortRange, TimingConfig};
pub use duration::{format_duration, parse_duration};
pub use error::{ConfigError, ConfigResult};
