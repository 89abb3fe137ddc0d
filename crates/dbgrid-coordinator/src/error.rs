//! Coordinator error types.

use thiserror::Error;

use dbgrid_state::PeerId;

/// Terminal outcomes of node operations, as seen by a caller.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("insufficient responses: needed {needed}, got {got}")]
    InsufficientResponses { needed: u32, got: u32 },

    #[error("wake-up of {0} timed out")]
    WakeupTimedOut(String),

    #[error("peer {0} missed too many health checks")]
    HealthCheckTimeout(PeerId),

    #[error("no replacement offered for {failed_peer} in {database}")]
    ReplacementUnavailable { database: String, failed_peer: PeerId },

    #[error("database {0} has failed and needs administrative recovery")]
    DatabaseFailed(String),

    #[error("database not found: {0}")]
    NotFound(String),

    #[error("invalid database name: {0}")]
    InvalidName(String),

    #[error("creation of {0} timed out")]
    CreateTimedOut(String),

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("config error: {0}")]
    Config(#[from] dbgrid_core::ConfigError),

    #[error("state error: {0}")]
    State(#[from] dbgrid_state::StateError),

    #[error("cluster error: {0}")]
    Cluster(#[from] dbgrid_cluster::ClusterError),

    #[error("instance error: {0}")]
    Instance(#[from] dbgrid_instance::InstanceError),

    #[error("port error: {0}")]
    Port(#[from] dbgrid_instance::PortError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
