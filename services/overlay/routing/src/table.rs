//! Static topology for small overlays.
//!
//! [`StaticTopology`] implements both [`TopologyPlugin`] and
//! [`RoutingTable`] from the set of connected neighbors plus optional static
//! routes. Ids are compared as unsigned big-endian integers; the peer whose
//! id is numerically closest to a target is responsible for it.

use crate::topology::{RoutingTable, TopologyPlugin};
use dashmap::DashMap;
use reload_wire::ids::unsigned_cmp;
use reload_wire::{NodeId, ResourceId, RoutableId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Absolute difference of two ids read as unsigned big-endian integers
pub fn id_distance(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    let pad = |v: &[u8]| {
        let mut out = vec![0u8; len - v.len()];
        out.extend_from_slice(v);
        out
    };
    let (a, b) = (pad(a), pad(b));
    let (hi, lo) = if unsigned_cmp(&a, &b) == CmpOrdering::Less {
        (b, a)
    } else {
        (a, b)
    };

    let mut out = vec![0u8; len];
    let mut borrow = 0i16;
    for i in (0..len).rev() {
        let mut d = i16::from(hi[i]) - i16::from(lo[i]) - borrow;
        if d < 0 {
            d += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out[i] = d as u8;
    }
    out
}

/// The candidate numerically closest to `target`; ties go to the lower id
pub fn closest<'a, I>(target: &[u8], candidates: I) -> Option<&'a NodeId>
where
    I: IntoIterator<Item = &'a NodeId>,
{
    candidates
        .into_iter()
        .map(|id| (id_distance(id.as_bytes(), target), id))
        .min_by(|(da, a), (db, b)| unsigned_cmp(da, db).then_with(|| a.cmp(b)))
        .map(|(_, id)| id)
}

/// Counters of a [`StaticTopology`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyStats {
    /// Connected neighbors
    pub neighbors: usize,
    /// Configured static routes
    pub routes: usize,
    /// Next-hop lookups
    pub lookups: u64,
    /// Lookups that found no next hop
    pub misses: u64,
    /// Transmission failures reported by the link layer
    pub transmission_failures: u64,
}

/// Topology of neighbors and static routes
#[derive(Debug)]
pub struct StaticTopology {
    local_node_id: NodeId,
    resource_id_length: usize,
    /// Connected neighbor -> transmission failures since it connected
    neighbors: DashMap<NodeId, u64>,
    /// Destination -> neighbors to reach it through
    routes: DashMap<NodeId, Vec<NodeId>>,
    lookups_counter: AtomicU64,
    misses_counter: AtomicU64,
    failures_counter: AtomicU64,
}

impl StaticTopology {
    /// Topology with no neighbors and no routes
    pub fn new(local_node_id: NodeId, resource_id_length: usize) -> Self {
        Self {
            local_node_id,
            resource_id_length,
            neighbors: DashMap::new(),
            routes: DashMap::new(),
            lookups_counter: AtomicU64::new(0),
            misses_counter: AtomicU64::new(0),
            failures_counter: AtomicU64::new(0),
        }
    }

    /// Local node id
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// Reach `destination` through any of `via`
    pub fn add_route(&self, destination: NodeId, via: Vec<NodeId>) {
        debug!(destination = %destination, hops = via.len(), "adding static route");
        self.routes.insert(destination, via);
    }

    /// Remove the static route to `destination`
    pub fn remove_route(&self, destination: &NodeId) {
        if self.routes.remove(destination).is_some() {
            debug!(destination = %destination, "removed static route");
        }
    }

    /// Connected neighbors
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.neighbors.iter().map(|e| e.key().clone()).collect()
    }

    /// Whether `id` is a connected neighbor
    pub fn is_neighbor(&self, id: &NodeId) -> bool {
        self.neighbors.contains_key(id)
    }

    /// Transmission failures to `neighbor` since it connected
    pub fn failures(&self, neighbor: &NodeId) -> Option<u64> {
        self.neighbors.get(neighbor).map(|e| *e.value())
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> TopologyStats {
        TopologyStats {
            neighbors: self.neighbors.len(),
            routes: self.routes.len(),
            lookups: self.lookups_counter.load(Ordering::Relaxed),
            misses: self.misses_counter.load(Ordering::Relaxed),
            transmission_failures: self.failures_counter.load(Ordering::Relaxed),
        }
    }

    fn reachable_neighbors(&self, excluded: &HashSet<NodeId>) -> Vec<NodeId> {
        self.neighbors
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !excluded.contains(id))
            .collect()
    }

    fn lookup(&self, destination: &RoutableId, excluded: &HashSet<NodeId>) -> HashSet<NodeId> {
        if destination.is_opaque() {
            return HashSet::new();
        }

        if let Some(id) = destination.as_node() {
            if let Some(route) = self.routes.get(id) {
                let hops: HashSet<NodeId> = route
                    .iter()
                    .filter(|hop| self.is_neighbor(hop) && !excluded.contains(*hop))
                    .cloned()
                    .collect();
                if !hops.is_empty() {
                    return hops;
                }
            }
            if self.is_neighbor(id) && !excluded.contains(id) {
                return HashSet::from([id.clone()]);
            }
        }

        let candidates = self.reachable_neighbors(excluded);
        closest(destination.as_bytes(), &candidates)
            .cloned()
            .into_iter()
            .collect()
    }
}

impl TopologyPlugin for StaticTopology {
    fn resource_id(&self, name: &[u8]) -> ResourceId {
        let digest = Sha256::digest(name);
        let len = self.resource_id_length.min(digest.len());
        ResourceId::from_slice(&digest[..len])
    }

    fn resource_id_length(&self) -> usize {
        self.resource_id_length
    }

    fn is_local_peer_responsible(&self, id: &RoutableId, excluded: &HashSet<NodeId>) -> bool {
        if id.is_opaque() {
            return false;
        }
        let mut candidates = self.reachable_neighbors(excluded);
        candidates.push(self.local_node_id.clone());
        closest(id.as_bytes(), &candidates) == Some(&self.local_node_id)
    }

    fn closer_id(&self, destination: &RoutableId, candidates: &[NodeId]) -> Option<NodeId> {
        closest(destination.as_bytes(), candidates).cloned()
    }

    fn on_neighbor_connected(&self, neighbor: &NodeId) {
        info!(neighbor = %neighbor, "neighbor connected");
        self.neighbors.insert(neighbor.clone(), 0);
    }

    fn on_neighbor_disconnected(&self, neighbor: &NodeId) {
        info!(neighbor = %neighbor, "neighbor disconnected");
        self.neighbors.remove(neighbor);
    }

    fn on_transmission_failed(&self, neighbor: &NodeId) {
        self.failures_counter.fetch_add(1, Ordering::Relaxed);
        if let Some(mut failures) = self.neighbors.get_mut(neighbor) {
            *failures += 1;
        }
    }
}

impl RoutingTable for StaticTopology {
    fn next_hops(&self, destination: &RoutableId, excluded: &HashSet<NodeId>) -> HashSet<NodeId> {
        self.lookups_counter.fetch_add(1, Ordering::Relaxed);
        let hops = self.lookup(destination, excluded);
        if hops.is_empty() {
            self.misses_counter.fetch_add(1, Ordering::Relaxed);
            debug!(destination = %destination, "no next hop");
        }
        hops
    }
}
