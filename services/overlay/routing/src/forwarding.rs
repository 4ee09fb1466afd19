//! Forwarding core.
//!
//! Decides, from the forwarding header alone, whether a message is for this
//! peer or must travel on, and rewrites the header for the next hop:
//!
//! ```text
//! RECEIVED -> HEADER_DECODED -> LOCAL   -> (payload decoded, dispatched)
//!                            -> FORWARD -> next hops resolved -> sent
//! ```
//!
//! Decisions run synchronously on the link's read task. Sends to next hops
//! run on spawned tasks, one per hop, so a slow or failing hop neither blocks
//! the read loop nor cancels the other hops.

use crate::compress::NoopPathCompressor;
use crate::error::RoutingError;
use crate::topology::{PathCompressor, RoutingTable, TopologyPlugin};
use bytes::Bytes;
use dashmap::DashMap;
use reload_session::NeighborLinks;
use reload_wire::{ForwardMessage, Header, MessageCodec, NodeId, RoutableId, WireError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Opaque ids expanded for one message before giving up
const MAX_OPAQUE_EXPANSIONS: usize = 8;

/// Outcome of routing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Deliver to this peer
    Local,
    /// Send to these neighbors; the header is already rewritten
    Forward(HashSet<NodeId>),
}

/// Forwarding counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardingStats {
    /// Routing decisions made
    pub decisions: u64,
    /// Messages forwarded
    pub forwarded: u64,
    /// Messages delivered locally
    pub local: u64,
    /// Messages dropped
    pub dropped: u64,
    /// Per-hop sends that failed
    pub send_failures: u64,
    /// Drops by reason
    pub drop_reasons: HashMap<String, u64>,
}

/// Per-message routing and next-hop fan-out
pub struct ForwardingCore {
    local_node_id: NodeId,
    overlay_hash: u32,
    codec: Arc<MessageCodec>,
    topology: Arc<dyn TopologyPlugin>,
    routing: Arc<dyn RoutingTable>,
    compressor: Arc<dyn PathCompressor>,
    links: Arc<dyn NeighborLinks>,
    decisions_counter: AtomicU64,
    forwards_counter: AtomicU64,
    local_counter: AtomicU64,
    drops_counter: AtomicU64,
    send_failures: Arc<AtomicU64>,
    drop_reasons: DashMap<&'static str, u64>,
}

impl ForwardingCore {
    /// Create a forwarding core that cannot expand opaque ids
    pub fn new(
        local_node_id: NodeId,
        overlay_hash: u32,
        codec: Arc<MessageCodec>,
        topology: Arc<dyn TopologyPlugin>,
        routing: Arc<dyn RoutingTable>,
        links: Arc<dyn NeighborLinks>,
    ) -> Self {
        Self {
            local_node_id,
            overlay_hash,
            codec,
            topology,
            routing,
            compressor: Arc::new(NoopPathCompressor),
            links,
            decisions_counter: AtomicU64::new(0),
            forwards_counter: AtomicU64::new(0),
            local_counter: AtomicU64::new(0),
            drops_counter: AtomicU64::new(0),
            send_failures: Arc::new(AtomicU64::new(0)),
            drop_reasons: DashMap::new(),
        }
    }

    /// Use `compressor` to expand opaque destinations
    pub fn with_compressor(mut self, compressor: Arc<dyn PathCompressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Local node id
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// Hash of the local overlay
    pub fn overlay_hash(&self) -> u32 {
        self.overlay_hash
    }

    /// Message codec used to re-encode forwarded messages
    pub fn codec(&self) -> &Arc<MessageCodec> {
        &self.codec
    }

    /// Topology plugin
    pub fn topology(&self) -> &Arc<dyn TopologyPlugin> {
        &self.topology
    }

    /// Path compressor
    pub fn compressor(&self) -> &Arc<dyn PathCompressor> {
        &self.compressor
    }

    /// Reject messages of other overlays
    pub fn check_overlay(&self, header: &Header) -> Result<(), RoutingError> {
        if header.overlay_hash != self.overlay_hash {
            return Err(RoutingError::IncompatibleOverlay {
                expected: self.overlay_hash,
                actual: header.overlay_hash,
            });
        }
        Ok(())
    }

    /// Whether `id` designates this peer
    pub fn is_local(&self, id: &RoutableId) -> bool {
        match id {
            RoutableId::Node(node) => node.is_wildcard() || node == &self.local_node_id,
            RoutableId::Resource(_) => self.topology.is_local_peer_responsible(id, &HashSet::new()),
            RoutableId::Opaque(_) => false,
        }
    }

    /// Expand opaque heads and pop heads that designate this peer.
    ///
    /// Returns `None` when the message has arrived, otherwise the
    /// destination to route toward.
    fn resolve(&self, header: &mut Header) -> Result<Option<RoutableId>, RoutingError> {
        let mut expansions = 0;
        loop {
            let Some(head) = header.destination_list.first() else {
                return Err(RoutingError::EmptyDestinationList);
            };

            if let RoutableId::Opaque(id) = head {
                if expansions == MAX_OPAQUE_EXPANSIONS {
                    return Err(WireError::Malformed("nested opaque destinations").into());
                }
                expansions += 1;
                let expanded = self.compressor.decompress(id)?;
                debug!(id = %id, entries = expanded.len(), "expanded opaque destination");
                let rest = header.destination_list.split_off(1);
                header.destination_list = expanded;
                header.destination_list.extend(rest);
                continue;
            }

            if !self.is_local(head) {
                return Ok(Some(head.clone()));
            }
            if header.destination_list.len() == 1 {
                return Ok(None);
            }
            // Source route through this peer
            header.destination_list.remove(0);
        }
    }

    fn check_options(&self, header: &Header, local: bool) -> Result<(), RoutingError> {
        // No forwarding option types are implemented; any critical one fails.
        let critical = header.forwarding_options.iter().find(|option| {
            if local {
                option.is_destination_critical()
            } else {
                option.is_forward_critical()
            }
        });
        match critical {
            Some(option) => Err(RoutingError::UnsupportedForwardingOption(option.option_type)),
            None => Ok(()),
        }
    }

    fn decide(&self, header: &mut Header, sender: Option<&NodeId>) -> Result<RoutingDecision, RoutingError> {
        if let Some(sender) = sender {
            header.record_sender(sender);
        }
        self.check_overlay(header)?;

        let Some(target) = self.resolve(header)? else {
            self.check_options(header, true)?;
            return Ok(RoutingDecision::Local);
        };
        self.check_options(header, false)?;

        let excluded: HashSet<NodeId> = sender.cloned().into_iter().collect();
        if sender.is_some() && header.ttl <= 1 {
            return Err(RoutingError::TtlExceeded);
        }

        let next_hops = self.routing.next_hops(&target, &excluded);
        if next_hops.is_empty() {
            return Err(RoutingError::NoRoute(target));
        }

        if sender.is_some() {
            header
                .to_forward(&self.local_node_id)
                .map_err(|_| RoutingError::TtlExceeded)?;
        }
        Ok(RoutingDecision::Forward(next_hops))
    }

    /// Route a message received from `sender`.
    ///
    /// Records `sender` in the via list, checks the overlay, then either
    /// reports the message as local or rewrites the header for forwarding
    /// (TTL decremented, this peer appended to the via list). On error the
    /// via list already contains `sender`, so an answer can be routed back.
    pub fn route_inbound(&self, header: &mut Header, sender: &NodeId) -> Result<RoutingDecision, RoutingError> {
        let result = self.decide(header, Some(sender));
        self.record(header, &result);
        result
    }

    /// Route a message originated by this peer; the header keeps its TTL
    /// and via list
    pub fn route_outbound(&self, header: &mut Header) -> Result<RoutingDecision, RoutingError> {
        let result = self.decide(header, None);
        self.record(header, &result);
        result
    }

    fn record(&self, header: &Header, result: &Result<RoutingDecision, RoutingError>) {
        self.decisions_counter.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(RoutingDecision::Local) => {
                self.local_counter.fetch_add(1, Ordering::Relaxed);
            }
            Ok(RoutingDecision::Forward(hops)) => {
                self.forwards_counter.fetch_add(1, Ordering::Relaxed);
                debug!(
                    transaction_id = header.transaction_id,
                    ttl = header.ttl,
                    hops = hops.len(),
                    "forwarding"
                );
            }
            Err(e) => {
                self.drops_counter.fetch_add(1, Ordering::Relaxed);
                *self.drop_reasons.entry(e.reason()).or_insert(0) += 1;
                warn!(transaction_id = header.transaction_id, error = %e, "dropping message");
            }
        }
    }

    /// Re-encode a message with its rewritten header and send it to every
    /// next hop
    pub fn forward(&self, message: &ForwardMessage, next_hops: HashSet<NodeId>) -> Result<(), RoutingError> {
        let bytes = self.codec.encode_forward(message)?;
        self.fan_out(bytes, next_hops);
        Ok(())
    }

    /// Send an encoded message to every next hop, each on its own task
    pub fn fan_out(&self, bytes: Bytes, next_hops: HashSet<NodeId>) {
        for hop in next_hops {
            let links = self.links.clone();
            let failures = self.send_failures.clone();
            let bytes = bytes.clone();
            tokio::spawn(async move {
                if let Err(e) = links.send(&hop, bytes).await {
                    failures.fetch_add(1, Ordering::Relaxed);
                    debug!(neighbor = %hop, error = %e, "next hop send failed");
                }
            });
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ForwardingStats {
        ForwardingStats {
            decisions: self.decisions_counter.load(Ordering::Relaxed),
            forwarded: self.forwards_counter.load(Ordering::Relaxed),
            local: self.local_counter.load(Ordering::Relaxed),
            dropped: self.drops_counter.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            drop_reasons: self
                .drop_reasons
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::MemoryPathCompressor;
    use crate::table::StaticTopology;
    use async_trait::async_trait;
    use reload_session::LinkError;
    use reload_wire::{
        Codec, CodecRegistry, Content, ForwardingFlags, ForwardingOption, Message, OpaqueId,
        ResourceId,
    };
    use tokio::sync::mpsc;

    const OVERLAY: u32 = 0x0BAD_F00D;

    fn node(b: u8) -> NodeId {
        NodeId::new(vec![b; 16])
    }

    struct RecordingLinks {
        sent: mpsc::UnboundedSender<(NodeId, Bytes)>,
        down: HashSet<NodeId>,
    }

    #[async_trait]
    impl NeighborLinks for RecordingLinks {
        async fn send(&self, neighbor: &NodeId, payload: Bytes) -> Result<(), LinkError> {
            if self.down.contains(neighbor) {
                return Err(LinkError::NotConnected(neighbor.clone()));
            }
            let _ = self.sent.send((neighbor.clone(), payload));
            Ok(())
        }

        fn neighbors(&self) -> Vec<NodeId> {
            Vec::new()
        }

        fn is_connected(&self, neighbor: &NodeId) -> bool {
            !self.down.contains(neighbor)
        }
    }

    struct Fixture {
        core: ForwardingCore,
        topology: Arc<StaticTopology>,
        sent: mpsc::UnboundedReceiver<(NodeId, Bytes)>,
    }

    /// Peer B with neighbors A and D
    fn fixture(down: &[NodeId]) -> Fixture {
        let topology = Arc::new(StaticTopology::new(node(0xB), 16));
        topology.on_neighbor_connected(&node(0xA));
        topology.on_neighbor_connected(&node(0xD));
        let (tx, rx) = mpsc::unbounded_channel();
        let links = Arc::new(RecordingLinks {
            sent: tx,
            down: down.iter().cloned().collect(),
        });
        let codec = CodecRegistry::default().get::<MessageCodec>();
        let core = ForwardingCore::new(
            node(0xB),
            OVERLAY,
            codec,
            topology.clone(),
            topology.clone(),
            links,
        );
        Fixture {
            core,
            topology,
            sent: rx,
        }
    }

    fn header_to(dest: impl Into<RoutableId>) -> Header {
        Header::builder(OVERLAY).ttl(6).destination(dest).build()
    }

    #[test]
    fn test_local_delivery() {
        let f = fixture(&[]);
        let mut header = header_to(node(0xB));
        assert_eq!(
            f.core.route_inbound(&mut header, &node(0xA)),
            Ok(RoutingDecision::Local)
        );
        assert_eq!(header.via_list, vec![node(0xA)]);
        assert_eq!(header.ttl, 6);
        assert_eq!(f.core.stats().local, 1);
    }

    #[test]
    fn test_wildcard_is_local() {
        let f = fixture(&[]);
        let mut header = header_to(NodeId::wildcard(16));
        assert_eq!(
            f.core.route_inbound(&mut header, &node(0xA)),
            Ok(RoutingDecision::Local)
        );
    }

    #[test]
    fn test_forward_rewrites_header() {
        let f = fixture(&[]);
        let mut header = header_to(node(0xD));
        let decision = f.core.route_inbound(&mut header, &node(0xA)).unwrap();
        assert_eq!(decision, RoutingDecision::Forward(HashSet::from([node(0xD)])));
        assert_eq!(header.ttl, 5);
        assert_eq!(header.via_list, vec![node(0xA), node(0xB)]);
        assert_eq!(header.destination_list, vec![RoutableId::Node(node(0xD))]);
    }

    #[test]
    fn test_previous_hop_excluded() {
        let f = fixture(&[]);
        // A is the only neighbor left and it sent the message
        let mut header = header_to(node(0xA0));
        f.topology.on_neighbor_disconnected(&node(0xD));
        assert_eq!(
            f.core.route_inbound(&mut header, &node(0xA)),
            Err(RoutingError::NoRoute(RoutableId::Node(node(0xA0))))
        );
        assert_eq!(f.core.stats().drop_reasons.get("no_route"), Some(&1));
    }

    #[test]
    fn test_ttl_exhausted() {
        let f = fixture(&[]);
        let mut header = Header::builder(OVERLAY).ttl(1).destination(node(0xD)).build();
        assert_eq!(
            f.core.route_inbound(&mut header, &node(0xA)),
            Err(RoutingError::TtlExceeded)
        );
        // Untouched apart from the sender, so an answer can go back
        assert_eq!(header.ttl, 1);
        assert_eq!(header.reversed_via_list(), vec![RoutableId::Node(node(0xA))]);
    }

    #[test]
    fn test_outbound_keeps_ttl_and_via() {
        let f = fixture(&[]);
        let mut header = header_to(node(0xD));
        assert!(matches!(
            f.core.route_outbound(&mut header),
            Ok(RoutingDecision::Forward(_))
        ));
        assert_eq!(header.ttl, 6);
        assert!(header.via_list.is_empty());
    }

    #[test]
    fn test_overlay_mismatch() {
        let f = fixture(&[]);
        let mut header = Header::builder(7).destination(node(0xB)).build();
        assert_eq!(
            f.core.route_inbound(&mut header, &node(0xA)),
            Err(RoutingError::IncompatibleOverlay {
                expected: OVERLAY,
                actual: 7
            })
        );
    }

    #[test]
    fn test_source_route_through_local() {
        let f = fixture(&[]);
        let mut header = Header::builder(OVERLAY)
            .destination(node(0xB))
            .destination(node(0xD))
            .build();
        let decision = f.core.route_inbound(&mut header, &node(0xA)).unwrap();
        assert_eq!(decision, RoutingDecision::Forward(HashSet::from([node(0xD)])));
        assert_eq!(header.destination_list, vec![RoutableId::Node(node(0xD))]);
    }

    #[test]
    fn test_unknown_opaque_dropped() {
        let f = fixture(&[]);
        let mut header = header_to(OpaqueId::compressed(5));
        let err = f.core.route_inbound(&mut header, &node(0xA)).unwrap_err();
        assert!(matches!(err, RoutingError::UnknownOpaqueId(_)));
        assert!(!err.answers_sender());
    }

    #[test]
    fn test_opaque_expanded() {
        let compressor = Arc::new(MemoryPathCompressor::new());
        let id = compressor
            .compress(&[RoutableId::Node(node(0xB)), RoutableId::Node(node(0xD))])
            .unwrap();
        let f = fixture(&[]);
        let core = f.core.with_compressor(compressor);

        let mut header = header_to(id);
        let decision = core.route_inbound(&mut header, &node(0xA)).unwrap();
        assert_eq!(decision, RoutingDecision::Forward(HashSet::from([node(0xD)])));
        assert_eq!(header.destination_list, vec![RoutableId::Node(node(0xD))]);
    }

    #[test]
    fn test_critical_option_rejected() {
        let f = fixture(&[]);
        let option = ForwardingOption::new(
            42,
            ForwardingFlags::FORWARD_CRITICAL,
            Bytes::from_static(b"x"),
        );
        let mut header = Header::builder(OVERLAY)
            .destination(node(0xD))
            .option(option.clone())
            .build();
        assert_eq!(
            f.core.route_inbound(&mut header, &node(0xA)),
            Err(RoutingError::UnsupportedForwardingOption(42))
        );

        // Forward-critical options do not matter at the destination
        let mut header = Header::builder(OVERLAY)
            .destination(node(0xB))
            .option(option)
            .build();
        assert_eq!(
            f.core.route_inbound(&mut header, &node(0xA)),
            Ok(RoutingDecision::Local)
        );
    }

    #[test]
    fn test_resource_responsibility() {
        let f = fixture(&[]);
        let mut near_b = header_to(ResourceId::new(vec![0x0B; 16]));
        assert_eq!(
            f.core.route_inbound(&mut near_b, &node(0xA)),
            Ok(RoutingDecision::Local)
        );
        let mut near_d = header_to(ResourceId::new(vec![0x0E; 16]));
        assert_eq!(
            f.core.route_inbound(&mut near_d, &node(0xA)),
            Ok(RoutingDecision::Forward(HashSet::from([node(0xD)])))
        );
    }

    #[tokio::test]
    async fn test_forward_sends_rewritten_message() {
        let mut f = fixture(&[]);
        let codec = f.core.codec().clone();
        let message = Message::new(header_to(node(0xD)), Content::ping());
        let bytes = codec.encode_to_bytes(&message).unwrap();

        let mut forward = codec.decode_header(bytes).unwrap();
        let RoutingDecision::Forward(hops) = f.core.route_inbound(&mut forward.header, &node(0xA)).unwrap()
        else {
            panic!("expected forward");
        };
        f.core.forward(&forward, hops).unwrap();

        let (to, sent) = f.sent.recv().await.unwrap();
        assert_eq!(to, node(0xD));
        let received = codec.decode_header(sent).unwrap();
        assert_eq!(received.header.ttl, 5);
        assert_eq!(received.header.via_list, vec![node(0xA), node(0xB)]);
        assert_eq!(received.payload, forward.payload);
    }

    #[tokio::test]
    async fn test_failed_hop_does_not_cancel_others() {
        let mut f = fixture(&[node(0xA)]);
        f.core.fan_out(
            Bytes::from_static(b"msg"),
            HashSet::from([node(0xA), node(0xD)]),
        );
        let (to, _) = f.sent.recv().await.unwrap();
        assert_eq!(to, node(0xD));

        for _ in 0..100 {
            if f.core.stats().send_failures == 1 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("send failure not counted");
    }
}
