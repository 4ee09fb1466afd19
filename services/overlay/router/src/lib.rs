//! Message routing for RELOAD overlay peers.
//!
//! [`MessageRouter`] connects the links of a peer to its application: it
//! receives every message from the connection manager, lets the forwarding
//! core decide whether it travels on, and for messages addressed here
//! verifies the signature and dispatches requests to registered
//! [`MessageHandler`]s and answers to the [`PendingRequests`] cache.
//!
//! ## Example
//!
//! ```rust,no_run
//! use reload_router::{MessageRouter, PingHandler, RouterConfig};
//! use reload_routing::ForwardingCore;
//! use reload_wire::{Content, ContentType, NodeId, NullSigner};
//! use std::sync::Arc;
//!
//! # async fn example(forwarding: Arc<ForwardingCore>) -> Result<(), Box<dyn std::error::Error>> {
//! let router = MessageRouter::new(RouterConfig::default(), forwarding, Arc::new(NullSigner));
//! router.register_handler(ContentType::PingRequest, Arc::new(PingHandler));
//!
//! let peer = NodeId::from_hex("00112233445566778899aabbccddeeff")?;
//! let request = router.builder().request_to(peer, Content::ping());
//! let answer = router.send_request_message(request)?.await?;
//! println!("{:?}", answer.content);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod error;
pub mod handler;
pub mod pending;
pub mod ping;
pub mod router;

pub use builder::MessageBuilder;
pub use error::{HandlerError, RequestError, RouterError};
pub use handler::{AnswerHandler, HandlerRegistry, MessageHandler};
pub use pending::{PendingRequests, PendingStats, ResponseFuture, DEFAULT_REQUEST_TIMEOUT};
pub use ping::PingHandler;
pub use router::{MessageRouter, RouterConfig, RouterStats, DEFAULT_MAX_CONCURRENT_HANDLERS};
