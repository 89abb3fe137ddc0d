//! Cluster plumbing errors.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("election over an empty candidate set")]
    ElectionOnEmptySet,

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("peer {0} is not connected to the bus")]
    Disconnected(String),
}
