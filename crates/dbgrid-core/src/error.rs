//! Configuration errors.

use thiserror::Error;

/// Result alias for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while reading or validating a node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid duration {0:?}: expected e.g. \"500ms\", \"5s\", \"2m\", \"1h\" or \"0\"")]
    Duration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
