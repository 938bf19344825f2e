//! Error types for the bean manager.

use crate::types::{BeanId, NodeId};
use std::io;
use thiserror::Error;

/// Result type alias for bean manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the bean manager.
#[derive(Error, Debug)]
pub enum Error {
    /// The store could not service the operation within its configured bound.
    #[error("operation timed out")]
    Timeout,

    /// Encoding or decoding a stored value failed.
    #[error("marshalling error: {0}")]
    Marshalling(String),

    /// A bean refused to passivate; its group stays in memory.
    #[error("passivation of bean {id} failed: {reason}")]
    Passivation { id: BeanId, reason: String },

    /// A lifecycle callback failed.
    #[error("lifecycle callback failed: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Command dispatch errors.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The bean manager has not been started.
    #[error("bean manager not started")]
    NotStarted,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is the distinguishable store timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

/// Failure reported by a bean lifecycle callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct LifecycleError(pub String);

impl LifecycleError {
    /// Create a new lifecycle error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Command dispatch errors.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No handler is registered for the service on the target node.
    #[error("no handler for service {service} on node {node_id}")]
    NoHandler { node_id: NodeId, service: String },

    /// The target node address is unknown.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The remote handler reported a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// Sending the command failed.
    #[error("dispatch failed: {0}")]
    Failed(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Marshalling(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinguishable() {
        assert!(Error::Timeout.is_timeout());
        assert!(!Error::Cancelled.is_timeout());
    }

    #[test]
    fn test_lifecycle_conversion() {
        let err: Error = LifecycleError::new("boom").into();
        assert_eq!(err.to_string(), "lifecycle callback failed: boom");
    }

    #[test]
    fn test_passivation_message() {
        let id = BeanId::new();
        let err = Error::Passivation {
            id,
            reason: "socket busy".to_string(),
        };
        assert_eq!(
            err.to_string(),
            format!("passivation of bean {} failed: socket busy", id)
        );
    }
}
