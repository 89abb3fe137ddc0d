use thiserror::Error;

pub type PortResult<T> = Result<T, PortError>;
pub type InstanceResult<T> = Result<T, InstanceError>;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port pair in http {http} / raft {raft}")]
    Exhausted { http: String, raft: String },

    #[error("port {0} is outside the configured range")]
    OutOfRange(u16),

    #[error("port {0} is already allocated")]
    AlreadyAllocated(u16),

    #[error("port {0} is in use by another process")]
    Unavailable(u16),
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("engine for {database} failed to start: {reason}")]
    SubprocessStartFailed { database: String, reason: String },

    #[error("engine for {database} did not become healthy within {timeout_ms}ms")]
    StartTimedOut { database: String, timeout_ms: u64 },

    #[error("engine for {database} failed to stop: {reason}")]
    StopFailed { database: String, reason: String },

    #[error("database {0} already has a local instance")]
    AlreadyRunning(String),

    #[error("invalid database name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
