//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors.
///
/// Every variant describes malformed or unencodable wire data; transport
/// failures are reported by the session layer with its own error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before the value could be read
    #[error("truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required to continue
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Field content does not fit in its length prefix
    #[error("field overflow: {len} bytes do not fit a {width_bits}-bit length")]
    FieldOverflow {
        /// Width of the length prefix in bits
        width_bits: u8,
        /// Length that was written
        len: usize,
    },

    /// Field was not fully consumed by its decoder
    #[error("{0} trailing bytes in field")]
    TrailingBytes(usize),

    /// Forwarding header does not start with the RELOAD token
    #[error("bad relo token {0:#010x}")]
    Token(u32),

    /// Unsupported protocol version
    #[error("version unsupported: {0:#04x}")]
    Version(u8),

    /// TTL exhausted
    #[error("ttl exceeded")]
    Ttl,

    /// Declared message length disagrees with the bytes received
    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length carried in the header
        declared: usize,
        /// Length actually present
        actual: usize,
    },

    /// Message exceeds the configured maximum size
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Unknown destination type
    #[error("unknown destination type {0}")]
    DestinationType(u8),

    /// Node id of the wrong length for this overlay
    #[error("node id length {actual}, overlay uses {expected}")]
    NodeIdLength {
        /// Configured node id length
        expected: usize,
        /// Length found on the wire
        actual: usize,
    },

    /// Unknown frame type
    #[error("unknown frame type {0}")]
    FrameType(u8),

    /// Unknown signer identity type
    #[error("unknown signer identity type {0}")]
    IdentityType(u8),

    /// Malformed structure
    #[error("malformed: {0}")]
    Malformed(&'static str),
}
