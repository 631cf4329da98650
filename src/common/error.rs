//! Error types for shard-registrar

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Registrar Errors ===
    #[error("Invalid payload on channel {channel}: {reason}")]
    InvalidPayload { channel: String, reason: String },

    #[error("Invalid assignment: {0}")]
    InvalidAssignment(String),

    #[error("Registrar is not running")]
    NotRunning,

    #[error("No shard has been reserved")]
    Unassigned,

    // === Store / Bus Errors ===
    #[error("Store operation failed: {0}")]
    Store(String),

    #[error("Notification bus error: {0}")]
    Bus(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // === Migration Errors ===
    #[error("Migration error: {0}")]
    Migration(String),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this an expected condition that goes away on a later heartbeat?
    pub fn is_transient(&self) -> bool {
        #[cfg(feature = "postgres")]
        if matches!(self, Error::Database(_)) {
            return true;
        }
        matches!(
            self,
            Error::Unassigned | Error::NotRunning | Error::Store(_) | Error::Bus(_)
        )
    }

    pub(crate) fn invalid_payload(channel: &str, reason: impl Into<String>) -> Self {
        Error::InvalidPayload {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", e))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(Error::Unassigned.is_transient());
        assert!(Error::Store("connection reset".into()).is_transient());
        assert!(!Error::InvalidAssignment("shard 3 >= 2".into()).is_transient());
        assert!(!Error::InvalidConfig("empty cluster".into()).is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::invalid_payload("shardInfo/abc", "missing numShards");
        assert_eq!(
            err.to_string(),
            "Invalid payload on channel shardInfo/abc: missing numShards"
        );
        assert_eq!(Error::Unassigned.to_string(), "No shard has been reserved");
    }
}
