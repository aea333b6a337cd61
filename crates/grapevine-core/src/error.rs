//! Error types for Grapevine

use thiserror::Error;

/// Main error type for Grapevine operations
#[derive(Error, Debug)]
pub enum GrapevineError {
    /// Peer unreachable, connection dropped, or a frame could not be sent
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request did not complete within the configured timeout
    #[error("Request to {0} timed out")]
    Timeout(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The remote peer answered with an error frame
    #[error("Remote error: {0}")]
    Remote(String),

    /// No proxy is registered for this shared data id
    #[error("Shared data not found: {0}")]
    SharedDataNotFound(String),

    /// A proxy for this shared data id already exists
    #[error("Shared data already served: {0}")]
    SharedDataAlreadyServed(String),

    /// Shared data cannot participate in replication before its role is set
    #[error("Local role not set for shared data {0}")]
    RoleNotSet(String),

    /// The local role can only be assigned once
    #[error("Local role already set to {0}")]
    RoleAlreadySet(String),

    /// A key was mutated through an operation that does not match its shape
    #[error("Shape mismatch on key {key}: expected {expected}")]
    ShapeMismatch { key: String, expected: &'static str },

    /// A record value carried a type tag that is not registered
    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    /// A rumor could not be reconstructed from its wire form
    #[error("Invalid rumor: {0}")]
    InvalidRumor(String),

    /// The node's listener and gossip loop are already running
    #[error("Node already started at {0}")]
    AlreadyStarted(String),

    /// Configuration could not be loaded or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Account service failure
    #[error("Account error: {0}")]
    Account(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for GrapevineError {
    fn from(e: postcard::Error) -> Self {
        GrapevineError::Serialization(e.to_string())
    }
}

/// Result type alias using GrapevineError
pub type GrapevineResult<T> = Result<T, GrapevineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GrapevineError::ShapeMismatch {
            key: "m".to_string(),
            expected: "map",
        };
        assert_eq!(format!("{}", err), "Shape mismatch on key m: expected map");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GrapevineError = io_err.into();
        assert!(matches!(err, GrapevineError::Io(_)));
    }

    #[test]
    fn test_error_from_postcard() {
        let err: GrapevineError = postcard::Error::DeserializeUnexpectedEnd.into();
        assert!(matches!(err, GrapevineError::Serialization(_)));
    }
}
