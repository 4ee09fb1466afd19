//! Session and link error types.

use reload_wire::{NodeId, WireError};
use thiserror::Error;

/// Failure of one transmission over a link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No ACK arrived within the link timeout
    #[error("ack timeout for sequence {sequence}")]
    AckTimeout {
        /// Sequence number of the unacknowledged frame
        sequence: u32,
    },

    /// The link closed before the frame was acknowledged
    #[error("link closed")]
    Closed,

    /// No link to the neighbor
    #[error("not connected to {0}")]
    NotConnected(NodeId),

    /// Payload could not be framed
    #[error("framing: {0}")]
    Framing(#[from] WireError),
}

/// Failure of a whole session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket error
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Peer sent undecodable frames
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Link handshake failed
    #[error("handshake: {0}")]
    Handshake(String),

    /// Handshake did not complete in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer claimed our own node id
    #[error("peer presented the local node id")]
    SelfConnection,

    /// Connection manager is shutting down
    #[error("shutting down")]
    Shutdown,
}
