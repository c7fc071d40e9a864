//! Errors of the binlog collector and recoverer

use pxc_storage::StorageError;
use thiserror::Error;

/// Errors returned by PITR operations
#[derive(Debug, Error)]
pub enum PitrError {
    /// Object storage failure
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Query against a PXC node failed
    #[error("database {host}: {message}")]
    Database {
        /// Node the query ran on
        host: String,
        /// What failed
        message: String,
    },

    /// A GTID or GTID set could not be interpreted
    #[error("invalid gtid {value}: {reason}")]
    InvalidGtid {
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// Backup metadata doesn't carry the expected fields
    #[error("backup metadata: {0}")]
    Metadata(String),

    /// Recovery request can't be satisfied
    #[error("recovery: {0}")]
    Recovery(String),

    /// No synced primary node was found
    #[error("can't find host")]
    NoHost,

    /// External command failed
    #[error("{command}: {message}")]
    Command {
        /// Program name
        command: String,
        /// Exit status and stderr
        message: String,
    },

    /// Invalid configuration
    #[error("config: {0}")]
    Config(String),

    /// Local file error
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Cache document can't be (de)serialized
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PitrError {
    /// Database error for `host`
    pub fn database(host: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Database {
            host: host.into(),
            message: message.to_string(),
        }
    }

    /// Invalid GTID error
    pub fn invalid_gtid(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidGtid {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Failed external command
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Result alias for PITR operations
pub type Result<T> = std::result::Result<T, PitrError>;
