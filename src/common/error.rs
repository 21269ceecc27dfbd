//! Error types for minicoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Operation Log Errors ===
    #[error("Operation log corrupted: {0}")]
    LogCorrupted(String),

    #[error("Operation log exhausted at id {0}")]
    LogExhausted(u64),

    // === Serialization Errors ===
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown {kind} type tag: {tag}")]
    UnknownMessageType { kind: &'static str, tag: u16 },

    // === Coordinator Errors ===
    #[error("Coordinator closed")]
    CoordinatorClosed,

    // === Transport Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    // === Node Execution Errors ===
    #[error("Rejected: {0}")]
    Rejected(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Transport(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Transport("connection reset".into()).is_retryable());
        assert!(Error::from(std::io::Error::other("disk")).is_retryable());
        assert!(!Error::Rejected("node two is already a member".into()).is_retryable());
        assert!(!Error::CoordinatorClosed.is_retryable());
        assert!(!Error::UnknownMessageType { kind: "node request", tag: 9 }.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::UnknownMessageType {
            kind: "node response",
            tag: 42,
        };
        assert_eq!(err.to_string(), "Unknown node response type tag: 42");
        assert_eq!(Error::from("boom").to_string(), "boom");
    }
}
