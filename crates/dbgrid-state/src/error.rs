//! Error types for the dbgrid metadata store.

use thiserror::Error;

/// Result type alias for metadata store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during metadata store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open journal: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid database name: {0:?}")]
    InvalidName(String),

    #[error("database {name} lists {members} members but its replication factor is {replication_factor}")]
    TooManyMembers {
        name: String,
        members: usize,
        replication_factor: u32,
    },
}
