//! Crate-wide error types
//!
//! Every fallible operation in the inspector core returns [`InspectorError`].
//! Event-driven paths (polling, receive loops, command results) log these and
//! degrade instead of propagating; only imperative setup calls surface them.

use thiserror::Error;

use crate::bridge::BridgeError;
use crate::server::ServerIdentity;

/// Inspector error type
#[derive(Debug, Error)]
pub enum InspectorError {
    /// The device bridge failed to run or answered with an error
    #[error("Device bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// A tunnel could not be established for a debug socket
    #[error("Failed to open tunnel for {server}: {reason}")]
    TunnelFailed {
        server: ServerIdentity,
        reason: String,
    },

    /// The TCP connection through the tunnel could not be opened
    #[error("Failed to connect to {server}: {reason}")]
    ConnectFailed {
        server: ServerIdentity,
        reason: String,
    },

    /// No live connection exists for the identity
    #[error("Unknown server: {0}")]
    UnknownServer(ServerIdentity),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, InspectorError>;
