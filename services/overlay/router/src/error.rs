//! Router error types.

use reload_routing::RoutingError;
use reload_wire::{ErrorCode, NodeId, SecurityError, WireError};
use thiserror::Error;

/// Failure to send a message
#[derive(Error, Debug)]
pub enum RouterError {
    /// No route, TTL, overlay or option failure
    #[error("routing: {0}")]
    Routing(#[from] RoutingError),

    /// Message could not be encoded
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Message could not be signed
    #[error("security: {0}")]
    Security(#[from] SecurityError),

    /// A request with this transaction id is already pending
    #[error("transaction {0:#018x} already pending")]
    DuplicateTransaction(u64),

    /// Router is shutting down
    #[error("router shut down")]
    Shutdown,
}

/// Failure of a pending request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No answer within the request timeout
    #[error("request timed out")]
    Timeout,

    /// Every first hop of the request went down
    #[error("link to {0} failed")]
    LinkFailed(NodeId),

    /// Router shut down while the request was pending
    #[error("router shut down")]
    Shutdown,
}

/// Failure reported by a message handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Request refused with an error code
    #[error("{code:?}: {info}")]
    Rejected {
        /// Code sent back
        code: ErrorCode,
        /// Diagnostic text sent back
        info: String,
    },

    /// Request type not handled here
    #[error("unsupported message type")]
    Unsupported,

    /// Request code this peer does not know
    #[error("unknown message type {0}")]
    UnknownType(u16),
}

impl HandlerError {
    /// Refuse a request with `code`
    pub fn rejected(code: ErrorCode, info: impl Into<String>) -> Self {
        HandlerError::Rejected {
            code,
            info: info.into(),
        }
    }

    /// Code of the error answer
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HandlerError::Rejected { code, .. } => *code,
            HandlerError::Unsupported => ErrorCode::Forbidden,
            HandlerError::UnknownType(_) => ErrorCode::InvalidMessage,
        }
    }

    /// Diagnostic text of the error answer
    pub fn info(&self) -> String {
        match self {
            HandlerError::Rejected { info, .. } => info.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_codes() {
        assert_eq!(HandlerError::Unsupported.error_code(), ErrorCode::Forbidden);
        assert_eq!(HandlerError::UnknownType(99).error_code(), ErrorCode::InvalidMessage);
        let rejected = HandlerError::rejected(ErrorCode::NotFound, "no such key");
        assert_eq!(rejected.error_code(), ErrorCode::NotFound);
        assert_eq!(rejected.to_string(), "NotFound: no such key");
        assert_eq!(rejected.info(), "no such key");
        assert_eq!(HandlerError::Unsupported.info(), "unsupported message type");
    }
}
