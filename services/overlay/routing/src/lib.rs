//! Routing for the RELOAD overlay: forwarding decisions, next-hop
//! selection and path compression.
//!
//! The overlay algorithm plugs in through [`TopologyPlugin`] and
//! [`RoutingTable`]; [`StaticTopology`] implements both for small, mostly
//! static overlays. [`ForwardingCore`] applies them to each message header.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compress;
pub mod error;
pub mod forwarding;
pub mod table;
pub mod topology;

pub use compress::{MemoryPathCompressor, NoopPathCompressor};
pub use error::RoutingError;
pub use forwarding::{ForwardingCore, ForwardingStats, RoutingDecision};
pub use table::{closest, id_distance, StaticTopology, TopologyStats};
pub use topology::{PathCompressor, RoutingTable, TopologyLinkEvents, TopologyPlugin};
