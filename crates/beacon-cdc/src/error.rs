//! Error types for the CDC pipeline.
//!
//! Classification matters here: the supervisor retries only what the
//! backoff policy considers transient, and slot contention gets its own
//! variant because it is always recoverable (another consumer holding the
//! slot will eventually release it).

use crate::protocol::DecodeError;
use thiserror::Error;

/// SQLSTATE reported by PostgreSQL when a replication slot is held by
/// another backend (`object_in_use`).
pub const SQLSTATE_OBJECT_IN_USE: &str = "55006";

/// CDC pipeline errors.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Replication protocol violation or server-reported stream error.
    #[error("replication error: {0}")]
    Replication(String),

    /// The replication slot is held by another process.
    #[error("replication slot in use: {0}")]
    SlotInUse(String),

    /// Authentication handshake failure.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A single pgoutput record could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Change handler failure, isolated to one record.
    #[error("handler error: {0}")]
    Handler(String),

    /// The server closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation attempted in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl CdcError {
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    pub fn slot_in_use(msg: impl Into<String>) -> Self {
        Self::SlotInUse(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Classify a server `ErrorResponse` received over the replication
    /// connection. Slot contention is recognized both by SQLSTATE and by
    /// the message text, matching what servers of different vintages send.
    pub fn from_server(sqlstate: Option<&str>, message: &str) -> Self {
        if sqlstate == Some(SQLSTATE_OBJECT_IN_USE) || message.contains("is active for PID") {
            return Self::slot_in_use(message);
        }
        Self::replication(message)
    }

    /// True for transient errors the supervisor should retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::SlotInUse(_) | Self::ConnectionClosed | Self::Replication(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::UnexpectedEof
                )
            }
            Self::Auth(_)
            | Self::Config(_)
            | Self::Decode(_)
            | Self::Handler(_)
            | Self::Json(_)
            | Self::InvalidState(_) => false,
        }
    }
}

/// Result type for CDC operations.
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_contention_by_sqlstate() {
        let err = CdcError::from_server(Some("55006"), "replication slot is busy");
        assert!(matches!(err, CdcError::SlotInUse(_)));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_slot_contention_by_message() {
        let err = CdcError::from_server(
            None,
            "replication slot \"beacon_cdc_slot\" is active for PID 4242",
        );
        assert!(matches!(err, CdcError::SlotInUse(_)));
    }

    #[test]
    fn test_generic_server_error_is_replication() {
        let err = CdcError::from_server(Some("42704"), "publication does not exist");
        assert!(matches!(err, CdcError::Replication(_)));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_config_errors_not_retriable() {
        assert!(!CdcError::config("empty slot name").is_retriable());
        assert!(!CdcError::auth("SASL unsupported").is_retriable());
    }

    #[test]
    fn test_io_classification() {
        let refused = CdcError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(refused.is_retriable());
        let perm = CdcError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!perm.is_retriable());
    }
}
