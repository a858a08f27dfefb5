//! Setup-phase errors
//!
//! Everything here is fatal: the run aborts before a plan is produced.
//! Failures while moving partitions are [`crate::executor::MoveError`].

use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, RebalanceError>;

/// Errors that abort a rebalance run
#[derive(Error, Debug)]
pub enum RebalanceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Failed to collect partition sizes from {host}: {reason}")]
    Collection { host: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RebalanceError::Collection {
            host: "ck1".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to collect partition sizes from ck1: timeout"
        );
    }

    #[test]
    fn test_error_from_config() {
        let config_err = ConfigError::InvalidValue("hosts".to_string(), "empty".to_string());
        let err: RebalanceError = config_err.into();
        assert!(matches!(err, RebalanceError::Config(_)));
    }
}
