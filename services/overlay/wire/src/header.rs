//! Forwarding header.
//!
//! The forwarding header carries everything a peer needs to route a message
//! without touching its contents or security block. The fixed part is 38
//! bytes; the via list, destination list and forwarding options follow.
//!
//! ```text
//! offset size field
//! 0      4    relo_token (0xD2454C4F)
//! 4      4    overlay hash
//! 8      2    configuration sequence
//! 10     1    version
//! 11     1    ttl
//! 12     4    fragment
//! 16     4    total message length
//! 20     8    transaction id
//! 28     4    max response length
//! 32     2    via list length
//! 34     2    destination list length
//! 36     2    options length
//! ```

use crate::codec::{
    ensure, patch_uint, read_bytes, read_field, read_u16, read_u32, read_u64, read_u8,
    write_opaque, Codec, CodecRegistry, FieldWidth, RegisteredCodec,
};
use crate::error::WireError;
use crate::ids::{DestinationCodec, NodeId, RoutableId};
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// First four bytes of every message ("\xd2ELO")
pub const RELO_TOKEN: u32 = 0xD245_4C4F;

/// Protocol version 1.0
pub const WIRE_VERSION: u8 = 0x0A;

/// Size of the fixed part of the header
pub const FIXED_HEADER_SIZE: usize = 38;

/// Byte offset of the total message length field
pub const LENGTH_OFFSET: usize = 16;

/// TTL used for new messages unless configured otherwise
pub const DEFAULT_INITIAL_TTL: u8 = 100;

const FRAGMENT_RESERVED_BIT: u32 = 0x8000_0000;
const FRAGMENT_LAST_BIT: u32 = 0x4000_0000;
const FRAGMENT_OFFSET_MASK: u32 = 0x00FF_FFFF;

/// Hash an overlay name into the 32-bit overlay field
pub fn overlay_hash(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_be_bytes([digest[28], digest[29], digest[30], digest[31]])
}

bitflags! {
    /// Forwarding option flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ForwardingFlags: u8 {
        /// Peers that do not understand the option must not forward
        const FORWARD_CRITICAL = 0x01;
        /// The destination must understand the option
        const DESTINATION_CRITICAL = 0x02;
        /// Response should be copied back along the path
        const RESPONSE_COPY = 0x04;
    }
}

/// Extensible forwarding option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingOption {
    /// Option type
    pub option_type: u8,
    /// Option flags
    pub flags: ForwardingFlags,
    /// Option payload, kept verbatim
    pub data: Bytes,
}

impl ForwardingOption {
    /// Create an option
    pub fn new(option_type: u8, flags: ForwardingFlags, data: Bytes) -> Self {
        Self {
            option_type,
            flags,
            data,
        }
    }

    /// Whether a peer that does not understand the option must refuse to forward
    pub fn is_forward_critical(&self) -> bool {
        self.flags.contains(ForwardingFlags::FORWARD_CRITICAL)
    }

    /// Whether the destination must understand the option
    pub fn is_destination_critical(&self) -> bool {
        self.flags.contains(ForwardingFlags::DESTINATION_CRITICAL)
    }
}

/// Forwarding header of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Random request/answer correlator
    pub transaction_id: u64,
    /// Hash of the overlay name
    pub overlay_hash: u32,
    /// Sequence number of the overlay configuration in use
    pub configuration_sequence: u16,
    /// Protocol version
    pub version: u8,
    /// Remaining hops
    pub ttl: u8,
    /// Offset of this fragment in the full message
    pub fragment_offset: u32,
    /// Whether this is the last (or only) fragment
    pub is_last_fragment: bool,
    /// Largest answer the sender accepts, 0 for no limit
    pub max_response_length: u32,
    /// Peers the message has traversed, oldest first
    pub via_list: Vec<NodeId>,
    /// Ids still to traverse; the last entry is the final destination
    pub destination_list: Vec<RoutableId>,
    /// Forwarding options
    pub forwarding_options: Vec<ForwardingOption>,
}

impl Header {
    /// Start building a header for `overlay_hash`
    pub fn builder(overlay_hash: u32) -> HeaderBuilder {
        HeaderBuilder::new(overlay_hash)
    }

    /// Next id to resolve
    pub fn next_destination(&self) -> Option<&RoutableId> {
        self.destination_list.first()
    }

    /// Final destination
    pub fn final_destination(&self) -> Option<&RoutableId> {
        self.destination_list.last()
    }

    /// Whether the message is a fragment of a larger one
    pub fn is_fragmented(&self) -> bool {
        self.fragment_offset != 0 || !self.is_last_fragment
    }

    /// Record the neighbor a message arrived from, unless it already is the
    /// last via entry
    pub fn record_sender(&mut self, sender: &NodeId) {
        if self.via_list.last() != Some(sender) {
            self.via_list.push(sender.clone());
        }
    }

    /// Decrement TTL for forwarding
    pub fn decrement_ttl(&mut self) -> Result<u8, WireError> {
        if self.ttl == 0 {
            return Err(WireError::Ttl);
        }
        self.ttl -= 1;
        Ok(self.ttl)
    }

    /// Rewrite the header for one forwarding hop taken by `local`.
    ///
    /// Decrements the TTL, appends `local` to the via list unless it is
    /// already the last entry, and pops the head of the destination list when
    /// it resolved to `local` and is not the final entry. Returns the new TTL.
    /// Fails without touching the header when the TTL is already zero.
    pub fn to_forward(&mut self, local: &NodeId) -> Result<u8, WireError> {
        let ttl = self.decrement_ttl()?;
        self.record_sender(local);
        if self.destination_list.len() > 1
            && self.destination_list.first().and_then(RoutableId::as_node) == Some(local)
        {
            self.destination_list.remove(0);
        }
        Ok(ttl)
    }

    /// Destination list that leads an answer back to the sender
    pub fn reversed_via_list(&self) -> Vec<RoutableId> {
        self.via_list
            .iter()
            .rev()
            .cloned()
            .map(RoutableId::Node)
            .collect()
    }

    fn fragment_field(&self) -> u32 {
        let mut v = FRAGMENT_RESERVED_BIT | (self.fragment_offset & FRAGMENT_OFFSET_MASK);
        if self.is_last_fragment {
            v |= FRAGMENT_LAST_BIT;
        }
        v
    }
}

/// Builder for [`Header`]
#[derive(Debug, Clone)]
pub struct HeaderBuilder {
    overlay_hash: u32,
    transaction_id: Option<u64>,
    configuration_sequence: u16,
    ttl: u8,
    max_response_length: u32,
    via_list: Vec<NodeId>,
    destination_list: Vec<RoutableId>,
    forwarding_options: Vec<ForwardingOption>,
}

impl HeaderBuilder {
    /// Create a builder with default TTL and no destinations
    pub fn new(overlay_hash: u32) -> Self {
        Self {
            overlay_hash,
            transaction_id: None,
            configuration_sequence: 0,
            ttl: DEFAULT_INITIAL_TTL,
            max_response_length: 0,
            via_list: Vec::new(),
            destination_list: Vec::new(),
            forwarding_options: Vec::new(),
        }
    }

    /// Use a fixed transaction id instead of a random one
    pub fn transaction_id(mut self, id: u64) -> Self {
        self.transaction_id = Some(id);
        self
    }

    /// Set the configuration sequence
    pub fn configuration_sequence(mut self, seq: u16) -> Self {
        self.configuration_sequence = seq;
        self
    }

    /// Set the initial TTL
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the maximum response length
    pub fn max_response_length(mut self, len: u32) -> Self {
        self.max_response_length = len;
        self
    }

    /// Append a destination
    pub fn destination(mut self, id: impl Into<RoutableId>) -> Self {
        self.destination_list.push(id.into());
        self
    }

    /// Replace the destination list
    pub fn destinations(mut self, ids: Vec<RoutableId>) -> Self {
        self.destination_list = ids;
        self
    }

    /// Replace the via list
    pub fn via_list(mut self, via: Vec<NodeId>) -> Self {
        self.via_list = via;
        self
    }

    /// Add a forwarding option
    pub fn option(mut self, option: ForwardingOption) -> Self {
        self.forwarding_options.push(option);
        self
    }

    /// Build the header
    pub fn build(self) -> Header {
        Header {
            transaction_id: self.transaction_id.unwrap_or_else(rand::random),
            overlay_hash: self.overlay_hash,
            configuration_sequence: self.configuration_sequence,
            version: WIRE_VERSION,
            ttl: self.ttl,
            fragment_offset: 0,
            is_last_fragment: true,
            max_response_length: self.max_response_length,
            via_list: self.via_list,
            destination_list: self.destination_list,
            forwarding_options: self.forwarding_options,
        }
    }
}

/// Header decoded from the front of a message
#[derive(Debug, Clone)]
pub struct DecodedHeader {
    /// The header
    pub header: Header,
    /// Total message length declared on the wire
    pub message_length: u32,
    /// Encoded size of the header
    pub header_length: usize,
}

/// Codec for [`Header`].
///
/// Encoding writes a zero total-length field; the message codec backpatches
/// it at [`LENGTH_OFFSET`] once contents and security block are written.
#[derive(Debug, Clone)]
pub struct HeaderCodec {
    destinations: Arc<DestinationCodec>,
}

impl HeaderCodec {
    /// Create a header codec around a destination codec
    pub fn new(destinations: Arc<DestinationCodec>) -> Self {
        Self { destinations }
    }

    /// Decode a header and report its wire lengths
    pub fn decode_with_lengths(&self, buf: &mut Bytes) -> Result<DecodedHeader, WireError> {
        let before = buf.len();
        ensure(buf, FIXED_HEADER_SIZE)?;

        let token = read_u32(buf)?;
        if token != RELO_TOKEN {
            return Err(WireError::Token(token));
        }
        let overlay_hash = read_u32(buf)?;
        let configuration_sequence = read_u16(buf)?;
        let version = read_u8(buf)?;
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let ttl = read_u8(buf)?;
        let fragment = read_u32(buf)?;
        let message_length = read_u32(buf)?;
        let transaction_id = read_u64(buf)?;
        let max_response_length = read_u32(buf)?;
        let via_len = read_u16(buf)? as usize;
        let dest_len = read_u16(buf)? as usize;
        let options_len = read_u16(buf)? as usize;

        let via_raw = read_bytes(buf, via_len)?;
        let dest_raw = read_bytes(buf, dest_len)?;
        let options_raw = read_bytes(buf, options_len)?;

        let via_list = self
            .destinations
            .decode_list(via_raw)?
            .into_iter()
            .map(|id| match id {
                RoutableId::Node(node) => Ok(node),
                _ => Err(WireError::Malformed("via list entry is not a node id")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let destination_list = self.destinations.decode_list(dest_raw)?;
        let forwarding_options = decode_options(options_raw)?;

        let header = Header {
            transaction_id,
            overlay_hash,
            configuration_sequence,
            version,
            ttl,
            fragment_offset: fragment & FRAGMENT_OFFSET_MASK,
            is_last_fragment: fragment & FRAGMENT_LAST_BIT != 0,
            max_response_length,
            via_list,
            destination_list,
            forwarding_options,
        };

        Ok(DecodedHeader {
            header,
            message_length,
            header_length: before - buf.len(),
        })
    }
}

impl Codec for HeaderCodec {
    type Item = Header;

    fn encode(&self, header: &Header, buf: &mut BytesMut) -> Result<(), WireError> {
        let start = buf.len();
        buf.put_u32(RELO_TOKEN);
        buf.put_u32(header.overlay_hash);
        buf.put_u16(header.configuration_sequence);
        buf.put_u8(header.version);
        buf.put_u8(header.ttl);
        buf.put_u32(header.fragment_field());
        buf.put_u32(0); // total length, backpatched by the message codec
        buf.put_u64(header.transaction_id);
        buf.put_u32(header.max_response_length);
        let lengths_at = buf.len();
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(0);
        debug_assert_eq!(buf.len() - start, FIXED_HEADER_SIZE);

        let via_start = buf.len();
        for node in &header.via_list {
            self.destinations
                .encode(&RoutableId::Node(node.clone()), buf)?;
        }
        let dest_start = buf.len();
        self.destinations
            .encode_list(&header.destination_list, buf)?;
        let options_start = buf.len();
        encode_options(&header.forwarding_options, buf)?;
        let end = buf.len();

        patch_uint(buf, lengths_at, FieldWidth::U16, (dest_start - via_start) as u64)?;
        patch_uint(buf, lengths_at + 2, FieldWidth::U16, (options_start - dest_start) as u64)?;
        patch_uint(buf, lengths_at + 4, FieldWidth::U16, (end - options_start) as u64)?;
        Ok(())
    }

    fn decode(&self, buf: &mut Bytes) -> Result<Header, WireError> {
        Ok(self.decode_with_lengths(buf)?.header)
    }
}

impl RegisteredCodec for HeaderCodec {
    fn build(registry: &CodecRegistry) -> Self {
        Self::new(registry.get::<DestinationCodec>())
    }
}

fn encode_options(options: &[ForwardingOption], buf: &mut BytesMut) -> Result<(), WireError> {
    for option in options {
        buf.put_u8(option.option_type);
        buf.put_u8(option.flags.bits());
        write_opaque(buf, FieldWidth::U16, &option.data)?;
    }
    Ok(())
}

fn decode_options(mut buf: Bytes) -> Result<Vec<ForwardingOption>, WireError> {
    let mut options = Vec::new();
    while !buf.is_empty() {
        let option_type = read_u8(&mut buf)?;
        let flags = ForwardingFlags::from_bits_retain(read_u8(&mut buf)?);
        let data = read_field(&mut buf, FieldWidth::U16)?;
        options.push(ForwardingOption {
            option_type,
            flags,
            data,
        });
    }
    Ok(options)
}
