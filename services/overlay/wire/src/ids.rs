//! Routable identifiers and their destination encoding.
//!
//! ```text
//! Destination := type(u8) length(u8) data[length]
//!   type 1 = node id, 2 = resource id, 3 = opaque id
//! Compressed opaque id := u16 with the top bit set (0x8000 | n)
//! ```

use crate::codec::{
    read_field, read_u16, read_u8, write_opaque, Codec, CodecRegistry, FieldWidth,
    RegisteredCodec,
};
use crate::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;

/// Compare two byte strings as unsigned big-endian integers
pub fn unsigned_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_leading_zeros(v: &[u8]) -> &[u8] {
    let first = v.iter().position(|b| *b != 0).unwrap_or(v.len());
    &v[first..]
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

/// Parse a hex string into bytes
pub fn parse_hex(s: &str) -> Result<Vec<u8>, WireError> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(WireError::Malformed("odd-length hex string"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| WireError::Malformed("invalid hex"))
        })
        .collect()
}

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash)]
        pub struct $name(Bytes);

        impl $name {
            /// Wrap raw id bytes
            pub fn new(bytes: impl Into<Bytes>) -> Self {
                Self(bytes.into())
            }

            /// Copy id bytes from a slice
            pub fn from_slice(bytes: &[u8]) -> Self {
                Self(Bytes::copy_from_slice(bytes))
            }

            /// Raw id bytes
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Shared handle to the id bytes
            pub fn to_bytes(&self) -> Bytes {
                self.0.clone()
            }

            /// Id length in bytes
            pub fn len(&self) -> usize {
                self.0.len()
            }

            /// Whether the id is empty
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                unsigned_cmp(&self.0, &other.0).then_with(|| self.0.len().cmp(&other.0.len()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write_hex(f, &self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                write_hex(f, &self.0)?;
                write!(f, ")")
            }
        }
    };
}

byte_id!(
    /// Fixed-length identifier of a peer
    NodeId
);

byte_id!(
    /// Variable-length content-addressed identifier of a resource
    ResourceId
);

byte_id!(
    /// Compressed stand-in for a destination list
    OpaqueId
);

impl NodeId {
    /// All-zero node id matching any local peer
    pub fn wildcard(length: usize) -> Self {
        Self(Bytes::from(vec![0u8; length]))
    }

    /// Whether this is the wildcard id
    pub fn is_wildcard(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|b| *b == 0)
    }

    /// Random node id, for tests and ephemeral peers
    pub fn random(length: usize) -> Self {
        let bytes: Vec<u8> = (0..length).map(|_| rand::random::<u8>()).collect();
        Self(Bytes::from(bytes))
    }

    /// Parse a node id from hex
    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        Ok(Self(Bytes::from(parse_hex(s)?)))
    }
}

impl OpaqueId {
    /// Two-byte compressed form carrying `index` in its low 15 bits
    pub fn compressed(index: u16) -> Self {
        let v = 0x8000 | (index & 0x7FFF);
        Self(Bytes::copy_from_slice(&v.to_be_bytes()))
    }

    /// Whether the id uses the two-byte compressed form
    pub fn is_compressed(&self) -> bool {
        self.0.len() == 2 && self.0[0] & 0x80 != 0
    }
}

/// Wire destination type codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationType {
    /// Node id destination
    Node = 1,
    /// Resource id destination
    Resource = 2,
    /// Opaque id destination
    Opaque = 3,
}

impl TryFrom<u8> for DestinationType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DestinationType::Node),
            2 => Ok(DestinationType::Resource),
            3 => Ok(DestinationType::Opaque),
            _ => Err(WireError::DestinationType(value)),
        }
    }
}

/// Any id a message can be routed toward
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum RoutableId {
    /// A peer
    Node(NodeId),
    /// A resource
    Resource(ResourceId),
    /// A compressed destination list
    Opaque(OpaqueId),
}

impl RoutableId {
    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RoutableId::Node(id) => id.as_bytes(),
            RoutableId::Resource(id) => id.as_bytes(),
            RoutableId::Opaque(id) => id.as_bytes(),
        }
    }

    /// Destination type used on the wire
    pub fn destination_type(&self) -> DestinationType {
        match self {
            RoutableId::Node(_) => DestinationType::Node,
            RoutableId::Resource(_) => DestinationType::Resource,
            RoutableId::Opaque(_) => DestinationType::Opaque,
        }
    }

    /// The node id, if this is a node destination
    pub fn as_node(&self) -> Option<&NodeId> {
        match self {
            RoutableId::Node(id) => Some(id),
            _ => None,
        }
    }

    /// Whether this is an opaque destination
    pub fn is_opaque(&self) -> bool {
        matches!(self, RoutableId::Opaque(_))
    }
}

impl PartialOrd for RoutableId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RoutableId {
    fn cmp(&self, other: &Self) -> Ordering {
        unsigned_cmp(self.as_bytes(), other.as_bytes())
            .then_with(|| self.as_bytes().len().cmp(&other.as_bytes().len()))
            .then_with(|| (self.destination_type() as u8).cmp(&(other.destination_type() as u8)))
    }
}

impl fmt::Debug for RoutableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutableId::Node(id) => fmt::Debug::fmt(id, f),
            RoutableId::Resource(id) => fmt::Debug::fmt(id, f),
            RoutableId::Opaque(id) => fmt::Debug::fmt(id, f),
        }
    }
}

impl fmt::Display for RoutableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutableId::Node(id) => write!(f, "node:{}", id),
            RoutableId::Resource(id) => write!(f, "resource:{}", id),
            RoutableId::Opaque(id) => write!(f, "opaque:{}", id),
        }
    }
}

impl From<NodeId> for RoutableId {
    fn from(id: NodeId) -> Self {
        RoutableId::Node(id)
    }
}

impl From<ResourceId> for RoutableId {
    fn from(id: ResourceId) -> Self {
        RoutableId::Resource(id)
    }
}

impl From<OpaqueId> for RoutableId {
    fn from(id: OpaqueId) -> Self {
        RoutableId::Opaque(id)
    }
}

/// Codec for bare fixed-length node ids
#[derive(Debug, Clone)]
pub struct NodeIdCodec {
    length: usize,
}

impl NodeIdCodec {
    /// Codec for node ids of `length` bytes
    pub fn new(length: usize) -> Self {
        Self { length }
    }

    /// Configured node id length
    pub fn length(&self) -> usize {
        self.length
    }

    fn check(&self, actual: usize) -> Result<(), WireError> {
        if actual != self.length {
            return Err(WireError::NodeIdLength {
                expected: self.length,
                actual,
            });
        }
        Ok(())
    }
}

impl Codec for NodeIdCodec {
    type Item = NodeId;

    fn encode(&self, item: &NodeId, buf: &mut BytesMut) -> Result<(), WireError> {
        self.check(item.len())?;
        buf.put_slice(item.as_bytes());
        Ok(())
    }

    fn decode(&self, buf: &mut Bytes) -> Result<NodeId, WireError> {
        Ok(NodeId(crate::codec::read_bytes(buf, self.length)?))
    }
}

impl RegisteredCodec for NodeIdCodec {
    fn build(registry: &CodecRegistry) -> Self {
        Self::new(registry.config().node_id_length)
    }
}

/// Codec for a single [`RoutableId`] in destination form
#[derive(Debug, Clone)]
pub struct DestinationCodec {
    node_ids: NodeIdCodec,
}

impl DestinationCodec {
    /// Destination codec for an overlay with `node_id_length`-byte node ids
    pub fn new(node_id_length: usize) -> Self {
        Self {
            node_ids: NodeIdCodec::new(node_id_length),
        }
    }

    /// Encode a list of destinations back to back
    pub fn encode_list<'a, I>(&self, ids: I, buf: &mut BytesMut) -> Result<(), WireError>
    where
        I: IntoIterator<Item = &'a RoutableId>,
    {
        for id in ids {
            self.encode(id, buf)?;
        }
        Ok(())
    }

    /// Decode destinations until `buf` is exhausted
    pub fn decode_list(&self, mut buf: Bytes) -> Result<Vec<RoutableId>, WireError> {
        let mut ids = Vec::new();
        while !buf.is_empty() {
            ids.push(self.decode(&mut buf)?);
        }
        Ok(ids)
    }
}

impl Codec for DestinationCodec {
    type Item = RoutableId;

    fn encode(&self, item: &RoutableId, buf: &mut BytesMut) -> Result<(), WireError> {
        match item {
            RoutableId::Opaque(id) if id.is_compressed() => {
                buf.put_slice(id.as_bytes());
                Ok(())
            }
            RoutableId::Node(id) => {
                self.node_ids.check(id.len())?;
                buf.put_u8(DestinationType::Node as u8);
                write_opaque(buf, FieldWidth::U8, id.as_bytes())
            }
            other => {
                buf.put_u8(other.destination_type() as u8);
                write_opaque(buf, FieldWidth::U8, other.as_bytes())
            }
        }
    }

    fn decode(&self, buf: &mut Bytes) -> Result<RoutableId, WireError> {
        crate::codec::ensure(buf, 1)?;
        if buf[0] & 0x80 != 0 {
            let compressed = read_u16(buf)?;
            return Ok(RoutableId::Opaque(OpaqueId::compressed(compressed)));
        }

        let typ = DestinationType::try_from(read_u8(buf)?)?;
        let data = read_field(buf, FieldWidth::U8)?;
        match typ {
            DestinationType::Node => {
                self.node_ids.check(data.len())?;
                Ok(RoutableId::Node(NodeId(data)))
            }
            DestinationType::Resource => Ok(RoutableId::Resource(ResourceId(data))),
            DestinationType::Opaque => Ok(RoutableId::Opaque(OpaqueId(data))),
        }
    }
}

impl RegisteredCodec for DestinationCodec {
    fn build(registry: &CodecRegistry) -> Self {
        Self::new(registry.config().node_id_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId::new(vec![b; 16])
    }

    #[test]
    fn test_unsigned_ordering() {
        assert_eq!(unsigned_cmp(&[0, 0, 1], &[2]), Ordering::Less);
        assert_eq!(unsigned_cmp(&[1, 0], &[0xFF]), Ordering::Greater);
        assert_eq!(unsigned_cmp(&[0, 5], &[5]), Ordering::Equal);
        assert!(node(1) < node(2));
        assert!(ResourceId::new(vec![0x01, 0x00]) > ResourceId::new(vec![0xFF]));
    }

    #[test]
    fn test_wildcard() {
        let wildcard = NodeId::wildcard(16);
        assert!(wildcard.is_wildcard());
        assert_eq!(wildcard.len(), 16);
        assert!(!node(1).is_wildcard());
        assert!(!NodeId::new(Vec::new()).is_wildcard());
    }

    #[test]
    fn test_hex() {
        let id = NodeId::from_hex("00ff10").unwrap();
        assert_eq!(id.as_bytes(), &[0x00, 0xFF, 0x10]);
        assert_eq!(id.to_string(), "00ff10");
        assert!(NodeId::from_hex("abc").is_err());
        assert!(NodeId::from_hex("zz").is_err());
    }

    #[test]
    fn test_destination_encode_decode() {
        let codec = DestinationCodec::new(16);
        let ids = vec![
            RoutableId::Node(node(7)),
            RoutableId::Resource(ResourceId::new(vec![1, 2, 3])),
            RoutableId::Resource(ResourceId::new(Vec::new())),
            RoutableId::Opaque(OpaqueId::new(vec![9, 9, 9, 9])),
            RoutableId::Opaque(OpaqueId::compressed(42)),
        ];

        let mut buf = BytesMut::new();
        codec.encode_list(&ids, &mut buf).unwrap();
        let decoded = codec.decode_list(buf.freeze()).unwrap();
        assert_eq!(decoded, ids);
    }

    #[test]
    fn test_compressed_opaque_wire_form() {
        let codec = DestinationCodec::new(16);
        let bytes = codec
            .encode_to_bytes(&RoutableId::Opaque(OpaqueId::compressed(0x0102)))
            .unwrap();
        assert_eq!(&bytes[..], &[0x81, 0x02]);
    }

    #[test]
    fn test_node_length_enforced() {
        let codec = DestinationCodec::new(16);
        let short = RoutableId::Node(NodeId::new(vec![1u8; 4]));
        assert_eq!(
            codec.encode_to_bytes(&short).unwrap_err(),
            WireError::NodeIdLength {
                expected: 16,
                actual: 4
            }
        );

        let mut wire = Bytes::from_static(&[1, 2, 0xAA, 0xBB]);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(WireError::NodeIdLength { .. })
        ));
    }

    #[test]
    fn test_unknown_destination_type() {
        let codec = DestinationCodec::new(16);
        let mut wire = Bytes::from_static(&[0, 0]);
        assert_eq!(codec.decode(&mut wire), Err(WireError::DestinationType(0)));
    }
}
