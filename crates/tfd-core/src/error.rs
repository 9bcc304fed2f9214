//! Error types shared across the distribution pipeline.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, DataDistError>;

/// Primary error type for builder and scheduler components.
///
/// Stage worker loops never return these across a queue boundary; malformed
/// data is dropped and counted where it occurs. The variants below surface on
/// the startup path (fatal) and at the narrow external interfaces.
#[derive(Error, Debug)]
pub enum DataDistError {
    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure (replay files, sockets behind a channel impl).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hard failure reported by a transport channel.
    #[error("Channel '{channel}' error: {message}")]
    Channel { channel: String, message: String },

    /// The memory pool was stopped while a stage was waiting on it.
    #[error("Memory pool stopped")]
    PoolStopped,

    /// RPC-level failure talking to a peer process.
    #[error("RPC error: {0}")]
    Rpc(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataDistError::Channel {
            channel: "readout-0".into(),
            message: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "Channel 'readout-0' error: connection reset"
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = DataDistError::Configuration("rdh_version is required".into());
        assert!(err.to_string().contains("rdh_version"));
    }
}
