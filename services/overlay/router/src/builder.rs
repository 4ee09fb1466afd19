//! Builds requests and answers originated by this peer.

use reload_wire::{Content, ErrorCode, Header, Message, NodeId, RoutableId};

/// Creates message headers for the local peer
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    local_node_id: NodeId,
    overlay_hash: u32,
    initial_ttl: u8,
}

impl MessageBuilder {
    /// Builder for `local_node_id` in the overlay `overlay_hash`
    pub fn new(local_node_id: NodeId, overlay_hash: u32, initial_ttl: u8) -> Self {
        Self {
            local_node_id,
            overlay_hash,
            initial_ttl,
        }
    }

    /// TTL given to new messages
    pub fn initial_ttl(&self) -> u8 {
        self.initial_ttl
    }

    /// New request to `destinations` with a fresh transaction id
    pub fn request(&self, destinations: Vec<RoutableId>, content: Content) -> Message {
        let header = Header::builder(self.overlay_hash)
            .ttl(self.initial_ttl)
            .destinations(destinations)
            .build();
        Message::new(header, content)
    }

    /// Request to a single destination
    pub fn request_to(&self, destination: impl Into<RoutableId>, content: Content) -> Message {
        self.request(vec![destination.into()], content)
    }

    /// Answer to a request received with `request` as header.
    ///
    /// The answer travels back along the request's via list and reuses its
    /// transaction id. A request that never left this peer is answered to
    /// this peer.
    pub fn answer(&self, request: &Header, content: Content) -> Message {
        let mut destinations = request.reversed_via_list();
        if destinations.is_empty() {
            destinations.push(RoutableId::Node(self.local_node_id.clone()));
        }
        let header = Header::builder(self.overlay_hash)
            .transaction_id(request.transaction_id)
            .configuration_sequence(request.configuration_sequence)
            .ttl(self.initial_ttl)
            .destinations(destinations)
            .build();
        Message::new(header, content)
    }

    /// Error answer to `request`
    pub fn error_answer(&self, request: &Header, code: ErrorCode, info: impl Into<String>) -> Message {
        self.answer(request, Content::error(code, info))
    }
}
