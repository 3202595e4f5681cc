//! Error types for cluster operations.

use std::io;

use harbor_persistence::FormatError;

use crate::NodeId;

/// Errors that can occur during cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Peer is not connected.
    #[error("node {0} is not connected")]
    NodeNotFound(NodeId),

    /// The handshake with a peer failed.
    #[error("handshake with {addr} failed: {source}")]
    Handshake { addr: String, source: io::Error },

    /// Network error during cluster communication.
    #[error("cluster communication error: {0}")]
    Network(String),

    /// A peer sent something we could not decode.
    #[error("malformed message: {0}")]
    Decode(String),

    /// Reading or writing the assignment log failed.
    #[error("assignment log error: {0}")]
    Persistence(#[from] FormatError),

    /// A persisted table could not be (de)serialized.
    #[error("invalid assignment table: {0}")]
    Table(#[from] serde_json::Error),

    /// Operation requires a different node role.
    #[error("operation not supported on {role} node")]
    WrongRole { role: String },

    /// The node is shutting down or has failed.
    #[error("node is not running")]
    Shutdown,

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),
}

impl ClusterError {
    /// Returns true if this error must stop the node's startup sequence.
    ///
    /// Handshake and persistence faults before the node has joined leave it
    /// without a trustworthy view of the cluster.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::Handshake { .. }
                | ClusterError::Persistence(_)
                | ClusterError::Table(_)
                | ClusterError::Configuration(_)
        )
    }

    /// Creates a handshake error for the given address.
    pub fn handshake(addr: impl ToString, source: io::Error) -> Self {
        ClusterError::Handshake {
            addr: addr.to_string(),
            source,
        }
    }
}
