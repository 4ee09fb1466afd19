//! Links between RELOAD overlay peers.
//!
//! This crate turns byte streams into reliable-enough message links: each
//! encoded message travels in a sequenced DATA frame, the peer acknowledges
//! it with an ACK carrying a bitmask of recently received sequence numbers,
//! and a send completes when its ACK arrives or fails when the adaptive link
//! timeout expires. Nothing is retransmitted.
//!
//! ## Features
//!
//! - **Link Reliability**: sequence numbers, ACK bitmasks, RTT estimation
//! - **Session Loop**: one task per connection, frames delivered in order
//! - **Link Handshake**: node id exchange after connect
//! - **Connection Manager**: neighbor table, link events, auto-reconnect with
//!   exponential backoff
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use reload_session::{ConnectionManager, NeighborLinks, SessionConfig};
//! use reload_wire::NodeId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::new(SessionConfig::default());
//! let addr = manager.listen("127.0.0.1:6084".parse()?).await?;
//! println!("listening on {}", addr);
//!
//! manager.dial("127.0.0.1:6085".parse()?);
//!
//! let peer = NodeId::from_hex("00112233445566778899aabbccddeeff")?;
//! manager.send(&peer, Bytes::from_static(b"encoded message")).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handshake;
pub mod manager;
pub mod reliability;
pub mod session;
pub mod transport;

// Re-export main types
pub use error::{LinkError, SessionError};
pub use handshake::{
    perform_handshake, recv_hello, send_hello, DEFAULT_HANDSHAKE_TIMEOUT, HANDSHAKE_MAGIC,
};
pub use manager::{ConnectionManager, LinkEventHandler, NeighborLinks};
pub use reliability::{
    LinkConfig, LinkReliability, LinkStats, ReceivedWindow, RttEstimator,
    DEFAULT_INITIAL_LINK_TIMEOUT, MAX_LINK_TIMEOUT, MIN_LINK_TIMEOUT, RECEIVE_WINDOW,
};
pub use session::{InboundHandler, OutboundFrame, Session, SessionConfig, SessionHandle};
pub use transport::{connect_tcp, listen_tcp};
