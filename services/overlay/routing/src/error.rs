//! Routing error types.

use reload_wire::{ErrorCode, OpaqueId, RoutableId, WireError};
use thiserror::Error;

/// Reasons a message cannot be delivered or forwarded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Opaque destination the path compressor does not know
    #[error("unknown opaque id {0}")]
    UnknownOpaqueId(OpaqueId),

    /// TTL would reach zero at this hop
    #[error("ttl exceeded")]
    TtlExceeded,

    /// Routing table returned no next hop
    #[error("no route to {0}")]
    NoRoute(RoutableId),

    /// Message belongs to a different overlay
    #[error("overlay mismatch: expected {expected:#010x}, got {actual:#010x}")]
    IncompatibleOverlay {
        /// Local overlay hash
        expected: u32,
        /// Hash carried by the message
        actual: u32,
    },

    /// Critical forwarding option this peer does not implement
    #[error("unsupported forwarding option {0}")]
    UnsupportedForwardingOption(u8),

    /// Message has no destination
    #[error("empty destination list")]
    EmptyDestinationList,

    /// Path compressor cannot issue more ids
    #[error("path compression unavailable")]
    CompressionUnavailable,

    /// Message could not be re-encoded
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl RoutingError {
    /// Error code sent back to the originator of a failed request
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RoutingError::TtlExceeded => ErrorCode::TtlExceeded,
            RoutingError::NoRoute(_) => ErrorCode::NotFound,
            RoutingError::IncompatibleOverlay { .. } => ErrorCode::IncompatibleWithOverlay,
            RoutingError::UnsupportedForwardingOption(_) => ErrorCode::UnsupportedForwardingOption,
            RoutingError::Wire(WireError::MessageTooLarge(_)) => ErrorCode::MessageTooLarge,
            RoutingError::UnknownOpaqueId(_)
            | RoutingError::EmptyDestinationList
            | RoutingError::CompressionUnavailable
            | RoutingError::Wire(_) => ErrorCode::InvalidMessage,
        }
    }

    /// Whether the originator of a request should get an error answer.
    ///
    /// Unresolvable opaque ids are dropped silently.
    pub fn answers_sender(&self) -> bool {
        !matches!(
            self,
            RoutingError::UnknownOpaqueId(_) | RoutingError::CompressionUnavailable
        )
    }

    /// Short label used in drop counters
    pub fn reason(&self) -> &'static str {
        match self {
            RoutingError::UnknownOpaqueId(_) => "unknown_opaque_id",
            RoutingError::TtlExceeded => "ttl_exceeded",
            RoutingError::NoRoute(_) => "no_route",
            RoutingError::IncompatibleOverlay { .. } => "incompatible_overlay",
            RoutingError::UnsupportedForwardingOption(_) => "unsupported_forwarding_option",
            RoutingError::EmptyDestinationList => "empty_destination_list",
            RoutingError::CompressionUnavailable => "compression_unavailable",
            RoutingError::Wire(_) => "wire",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reload_wire::NodeId;

    #[test]
    fn test_error_codes() {
        assert_eq!(RoutingError::TtlExceeded.error_code(), ErrorCode::TtlExceeded);
        assert_eq!(
            RoutingError::IncompatibleOverlay { expected: 1, actual: 2 }.error_code(),
            ErrorCode::IncompatibleWithOverlay
        );
        assert_eq!(
            RoutingError::UnsupportedForwardingOption(9).error_code(),
            ErrorCode::UnsupportedForwardingOption
        );
        assert_eq!(
            RoutingError::NoRoute(RoutableId::Node(NodeId::new(vec![1; 16]))).error_code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_opaque_failure_is_silent() {
        let err = RoutingError::UnknownOpaqueId(OpaqueId::compressed(3));
        assert!(!err.answers_sender());
        assert!(RoutingError::TtlExceeded.answers_sender());
        assert_eq!(err.reason(), "unknown_opaque_id");
    }
}
