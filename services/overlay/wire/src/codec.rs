//! Codec framework for the wire protocol.
//!
//! Structures are written into a growable [`BytesMut`] and read back from a
//! [`Bytes`] view. Variable-length parts are wrapped in length-prefixed
//! fields: [`allocate_field`] reserves the prefix, the payload is written,
//! and [`Field::update_length`] backpatches the prefix once the payload size
//! is known. Reading uses [`read_field`], which hands back a bounded
//! sub-view and advances the parent past the whole field.
//!
//! Codecs implement [`Codec`] and are shared through a [`CodecRegistry`].
//! Composite codecs resolve their component codecs once, in their
//! constructor, and keep the `Arc`s.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::sync::Arc;

/// Default node id length in bytes
pub const DEFAULT_NODE_ID_LENGTH: usize = 16;

/// Default maximum encoded message size in bytes
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5_000_000;

/// Width of an unsigned integer or length prefix on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    /// 8 bits
    U8,
    /// 16 bits
    U16,
    /// 24 bits
    U24,
    /// 32 bits
    U32,
    /// 64 bits
    U64,
}

impl FieldWidth {
    /// Number of bytes occupied on the wire
    pub fn bytes(self) -> usize {
        match self {
            FieldWidth::U8 => 1,
            FieldWidth::U16 => 2,
            FieldWidth::U24 => 3,
            FieldWidth::U32 => 4,
            FieldWidth::U64 => 8,
        }
    }

    /// Number of bits
    pub fn bits(self) -> u8 {
        (self.bytes() * 8) as u8
    }

    /// Largest value representable at this width
    pub fn max_value(self) -> u64 {
        match self {
            FieldWidth::U64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }
}

/// Handle to a reserved length prefix.
///
/// Obtained from [`allocate_field`]. [`Field::update_length`] consumes the
/// handle, so a field can be patched only once. Dropping a handle that was
/// neither patched nor abandoned is a programming error and asserts in debug
/// builds.
#[must_use = "a field must be closed with update_length"]
#[derive(Debug)]
pub struct Field {
    width: FieldWidth,
    offset: usize,
    closed: bool,
}

/// Reserve a zeroed length prefix of `width` at the current write position.
pub fn allocate_field(buf: &mut BytesMut, width: FieldWidth) -> Field {
    let offset = buf.len();
    buf.put_bytes(0, width.bytes());
    Field {
        width,
        offset,
        closed: false,
    }
}

impl Field {
    /// Backpatch the prefix with the number of bytes written since it was
    /// allocated. Returns that length.
    pub fn update_length(mut self, buf: &mut BytesMut) -> Result<usize, WireError> {
        self.closed = true;
        let start = self.offset + self.width.bytes();
        debug_assert!(buf.len() >= start, "buffer shrank below an open field");
        let len = buf.len() - start;
        patch_uint(buf, self.offset, self.width, len as u64)?;
        Ok(len)
    }

    /// Give up on the field because encoding of its payload failed. The
    /// prefix stays zeroed; the caller is expected to discard the buffer.
    pub fn abandon(mut self) {
        self.closed = true;
    }

    /// Offset of the prefix inside the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Drop for Field {
    fn drop(&mut self) {
        debug_assert!(
            self.closed || std::thread::panicking(),
            "length field at offset {} was never updated",
            self.offset
        );
    }
}

/// Write a length-prefixed field whose payload is produced by `body`.
///
/// The prefix is patched when `body` succeeds and abandoned when it fails.
pub fn write_field<F>(buf: &mut BytesMut, width: FieldWidth, body: F) -> Result<usize, WireError>
where
    F: FnOnce(&mut BytesMut) -> Result<(), WireError>,
{
    let field = allocate_field(buf, width);
    match body(buf) {
        Ok(()) => field.update_length(buf),
        Err(e) => {
            field.abandon();
            Err(e)
        }
    }
}

/// Write raw bytes as a length-prefixed field.
pub fn write_opaque(buf: &mut BytesMut, width: FieldWidth, data: &[u8]) -> Result<(), WireError> {
    if data.len() as u64 > width.max_value() {
        return Err(WireError::FieldOverflow {
            width_bits: width.bits(),
            len: data.len(),
        });
    }
    put_uint(buf, width, data.len() as u64);
    buf.put_slice(data);
    Ok(())
}

/// Overwrite an unsigned integer of `width` at `offset`.
pub fn patch_uint(
    buf: &mut BytesMut,
    offset: usize,
    width: FieldWidth,
    value: u64,
) -> Result<(), WireError> {
    if value > width.max_value() {
        return Err(WireError::FieldOverflow {
            width_bits: width.bits(),
            len: value as usize,
        });
    }
    let n = width.bytes();
    let be = value.to_be_bytes();
    buf[offset..offset + n].copy_from_slice(&be[8 - n..]);
    Ok(())
}

/// Append an unsigned integer of `width`. Values wider than `width` are
/// truncated to their low-order bytes.
pub fn put_uint(buf: &mut BytesMut, width: FieldWidth, value: u64) {
    buf.put_uint(value, width.bytes());
}

/// Read a length prefix of `width` and split off exactly that many bytes.
///
/// The parent buffer is left untouched when the prefix or the body is
/// truncated, and advanced past the whole field otherwise.
pub fn read_field(buf: &mut Bytes, width: FieldWidth) -> Result<Bytes, WireError> {
    let n = width.bytes();
    ensure(buf, n)?;
    let len = peek_uint(buf, width) as usize;
    ensure(buf, n + len)?;
    buf.advance(n);
    Ok(buf.split_to(len))
}

/// Fail with [`WireError::TrailingBytes`] unless `buf` was consumed.
pub fn expect_drained(buf: &Bytes) -> Result<(), WireError> {
    if buf.has_remaining() {
        Err(WireError::TrailingBytes(buf.remaining()))
    } else {
        Ok(())
    }
}

/// Fail with [`WireError::Truncated`] unless `needed` bytes remain.
pub fn ensure(buf: &Bytes, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        Err(WireError::Truncated {
            needed,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn peek_uint(buf: &Bytes, width: FieldWidth) -> u64 {
    buf[..width.bytes()]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Read an unsigned integer of `width`.
pub fn read_uint(buf: &mut Bytes, width: FieldWidth) -> Result<u64, WireError> {
    ensure(buf, width.bytes())?;
    Ok(buf.get_uint(width.bytes()))
}

/// Read a `u8`.
pub fn read_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

/// Read a big-endian `u16`.
pub fn read_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

/// Read a big-endian 24-bit value.
pub fn read_u24(buf: &mut Bytes) -> Result<u32, WireError> {
    Ok(read_uint(buf, FieldWidth::U24)? as u32)
}

/// Read a big-endian `u32`.
pub fn read_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

/// Read a big-endian `u64`.
pub fn read_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

/// Read exactly `len` bytes.
pub fn read_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, WireError> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

/// Overlay-wide codec parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConfig {
    /// Length of node ids in this overlay
    pub node_id_length: usize,
    /// Maximum size of an encoded message
    pub max_message_size: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            node_id_length: DEFAULT_NODE_ID_LENGTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Encoder/decoder for one wire type
pub trait Codec: Send + Sync + 'static {
    /// Type handled by this codec
    type Item;

    /// Append the encoding of `item` to `buf`
    fn encode(&self, item: &Self::Item, buf: &mut BytesMut) -> Result<(), WireError>;

    /// Decode one item from the front of `buf`, advancing it
    fn decode(&self, buf: &mut Bytes) -> Result<Self::Item, WireError>;

    /// Encode `item` into a fresh buffer
    fn encode_to_bytes(&self, item: &Self::Item) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        self.encode(item, &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Codecs that can be built from the registry on first use
pub trait RegisteredCodec: Codec + Sized {
    /// Build the codec, resolving component codecs from `registry`
    fn build(registry: &CodecRegistry) -> Self;
}

/// Registry of shared codec instances keyed by codec type
#[derive(Debug)]
pub struct CodecRegistry {
    config: WireConfig,
    codecs: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl CodecRegistry {
    /// Create an empty registry for an overlay
    pub fn new(config: WireConfig) -> Self {
        Self {
            config,
            codecs: DashMap::new(),
        }
    }

    /// Overlay parameters the codecs were built for
    pub fn config(&self) -> &WireConfig {
        &self.config
    }

    /// Install a codec instance, replacing any previous one of that type
    pub fn register<C: Codec>(&self, codec: C) -> Arc<C> {
        let codec = Arc::new(codec);
        self.codecs.insert(TypeId::of::<C>(), codec.clone());
        codec
    }

    /// Look up a codec, building and caching it on first use
    pub fn get<C: RegisteredCodec>(&self) -> Arc<C> {
        if let Some(codec) = self.lookup::<C>() {
            return codec;
        }
        // Built outside the map lock: composite codecs call back into `get`.
        let built: Arc<dyn Any + Send + Sync> = Arc::new(C::build(self));
        let stored = self
            .codecs
            .entry(TypeId::of::<C>())
            .or_insert(built)
            .value()
            .clone();
        match stored.downcast::<C>() {
            Ok(codec) => codec,
            Err(_) => unreachable!("codec registry entry keyed by the wrong type"),
        }
    }

    fn lookup<C: Codec>(&self) -> Option<Arc<C>> {
        let entry = self.codecs.get(&TypeId::of::<C>())?.value().clone();
        entry.downcast::<C>().ok()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new(WireConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_backpatch() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xAA);
        let field = allocate_field(&mut buf, FieldWidth::U16);
        buf.put_slice(b"hello");
        assert_eq!(field.update_length(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..], &[0xAA, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_nested_fields() {
        let mut buf = BytesMut::new();
        write_field(&mut buf, FieldWidth::U32, |buf| {
            write_field(buf, FieldWidth::U8, |buf| {
                buf.put_slice(b"ab");
                Ok(())
            })?;
            buf.put_u16(7);
            Ok(())
        })
        .unwrap();

        let mut bytes = buf.freeze();
        let mut outer = read_field(&mut bytes, FieldWidth::U32).unwrap();
        assert!(bytes.is_empty());
        let inner = read_field(&mut outer, FieldWidth::U8).unwrap();
        assert_eq!(&inner[..], b"ab");
        assert_eq!(read_u16(&mut outer).unwrap(), 7);
        expect_drained(&outer).unwrap();
    }

    #[test]
    fn test_field_overflow() {
        let mut buf = BytesMut::new();
        let err = write_field(&mut buf, FieldWidth::U8, |buf| {
            buf.put_bytes(1, 256);
            Ok(())
        })
        .unwrap_err();
        assert_eq!(
            err,
            WireError::FieldOverflow {
                width_bits: 8,
                len: 256
            }
        );
    }

    #[test]
    fn test_field_max_length() {
        let mut buf = BytesMut::new();
        write_opaque(&mut buf, FieldWidth::U8, &[7u8; 255]).unwrap();
        let mut bytes = buf.freeze();
        assert_eq!(read_field(&mut bytes, FieldWidth::U8).unwrap().len(), 255);
    }

    #[test]
    fn test_u24_field() {
        let mut buf = BytesMut::new();
        write_opaque(&mut buf, FieldWidth::U24, &[1u8; 70_000]).unwrap();
        assert_eq!(&buf[..3], &[0x01, 0x11, 0x70]);
        let mut bytes = buf.freeze();
        assert_eq!(read_field(&mut bytes, FieldWidth::U24).unwrap().len(), 70_000);
    }

    #[test]
    fn test_truncated_field_leaves_buffer() {
        let mut bytes = Bytes::from_static(&[0x00, 0x04, 0x01, 0x02]);
        let err = read_field(&mut bytes, FieldWidth::U16).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                needed: 6,
                available: 4
            }
        );
        assert_eq!(bytes.len(), 4);
    }

    #[test]
    fn test_unconsumed_field_does_not_corrupt_next_read() {
        let mut bytes = Bytes::from_static(&[0x02, 0xAA, 0xBB, 0x09]);
        let mut field = read_field(&mut bytes, FieldWidth::U8).unwrap();
        assert_eq!(read_u8(&mut field).unwrap(), 0xAA);
        assert_eq!(expect_drained(&field), Err(WireError::TrailingBytes(1)));
        assert_eq!(read_u8(&mut bytes).unwrap(), 0x09);
    }

    #[test]
    fn test_width_limits() {
        assert_eq!(FieldWidth::U8.max_value(), 255);
        assert_eq!(FieldWidth::U24.max_value(), 0xFF_FFFF);
        assert_eq!(FieldWidth::U64.max_value(), u64::MAX);
        assert_eq!(FieldWidth::U24.bits(), 24);
    }

    #[test]
    fn test_wire_config_serde() {
        let config: WireConfig =
            serde_json::from_str(r#"{"node_id_length":20,"max_message_size":1000}"#).unwrap();
        assert_eq!(config.node_id_length, 20);
        let json = serde_json::to_string(&WireConfig::default()).unwrap();
        assert!(json.contains("5000000"));
    }

    struct ByteCodec;

    impl Codec for ByteCodec {
        type Item = u8;

        fn encode(&self, item: &u8, buf: &mut BytesMut) -> Result<(), WireError> {
            buf.put_u8(*item);
            Ok(())
        }

        fn decode(&self, buf: &mut Bytes) -> Result<u8, WireError> {
            read_u8(buf)
        }
    }

    impl RegisteredCodec for ByteCodec {
        fn build(_registry: &CodecRegistry) -> Self {
            ByteCodec
        }
    }

    #[test]
    fn test_registry_returns_shared_instance() {
        let registry = CodecRegistry::default();
        let a = registry.get::<ByteCodec>();
        let b = registry.get::<ByteCodec>();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(&a.encode_to_bytes(&9).unwrap()[..], &[9]);
    }
}
