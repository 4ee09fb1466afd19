//! Interfaces between the forwarding core and the overlay algorithm.
//!
//! The forwarding core never decides where ids live. It asks a
//! [`TopologyPlugin`] whether this peer is responsible for an id, a
//! [`RoutingTable`] for next hops, and a [`PathCompressor`] to expand opaque
//! destinations.

use crate::error::RoutingError;
use reload_session::{LinkError, LinkEventHandler};
use reload_wire::{NodeId, OpaqueId, ResourceId, RoutableId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Overlay algorithm as seen by the forwarding core
pub trait TopologyPlugin: Send + Sync {
    /// Resource id for a resource name
    fn resource_id(&self, name: &[u8]) -> ResourceId;

    /// Length of resource ids in this overlay
    fn resource_id_length(&self) -> usize;

    /// Whether this peer is responsible for `id`, ignoring `excluded` peers
    fn is_local_peer_responsible(&self, id: &RoutableId, excluded: &HashSet<NodeId>) -> bool;

    /// The candidate closest to `destination`
    fn closer_id(&self, destination: &RoutableId, candidates: &[NodeId]) -> Option<NodeId>;

    /// A link to `neighbor` came up
    fn on_neighbor_connected(&self, neighbor: &NodeId);

    /// The link to `neighbor` went down
    fn on_neighbor_disconnected(&self, neighbor: &NodeId);

    /// A transmission to `neighbor` failed
    fn on_transmission_failed(&self, neighbor: &NodeId);
}

/// Next-hop selection
pub trait RoutingTable: Send + Sync {
    /// Neighbors to send a message for `destination` to, never including
    /// `excluded`
    fn next_hops(&self, destination: &RoutableId, excluded: &HashSet<NodeId>) -> HashSet<NodeId>;
}

/// Compression of destination lists into opaque ids
pub trait PathCompressor: Send + Sync {
    /// Store `list` and return the id standing for it
    fn compress(&self, list: &[RoutableId]) -> Result<OpaqueId, RoutingError>;

    /// The list stored under `id`
    fn decompress(&self, id: &OpaqueId) -> Result<Vec<RoutableId>, RoutingError>;
}

/// Forwards link events of the connection manager to a topology plugin
pub struct TopologyLinkEvents {
    topology: Arc<dyn TopologyPlugin>,
}

impl TopologyLinkEvents {
    /// Wrap `topology`
    pub fn new(topology: Arc<dyn TopologyPlugin>) -> Self {
        Self { topology }
    }
}

impl LinkEventHandler for TopologyLinkEvents {
    fn on_link_up(&self, neighbor: &NodeId) {
        self.topology.on_neighbor_connected(neighbor);
    }

    fn on_link_down(&self, neighbor: &NodeId) {
        self.topology.on_neighbor_disconnected(neighbor);
    }

    fn on_transmission_failed(&self, neighbor: &NodeId, error: &LinkError) {
        debug!(neighbor = %neighbor, error = %error, "reporting transmission failure to topology");
        self.topology.on_transmission_failed(neighbor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::StaticTopology;

    #[test]
    fn test_link_events_reach_topology() {
        let topology = Arc::new(StaticTopology::new(NodeId::new(vec![1; 16]), 16));
        let events = TopologyLinkEvents::new(topology.clone());
        let peer = NodeId::new(vec![2; 16]);

        events.on_link_up(&peer);
        assert!(topology.is_neighbor(&peer));

        events.on_transmission_failed(&peer, &LinkError::Closed);
        assert_eq!(topology.failures(&peer), Some(1));

        events.on_link_down(&peer);
        assert!(!topology.is_neighbor(&peer));
    }
}
