//! Complete messages: header, contents and security block.
//!
//! Decoding happens in two steps. [`MessageCodec::decode_header`] parses
//! only the forwarding header and keeps the rest as an opaque payload, which
//! is all a peer needs to forward a message. [`MessageCodec::decode_payload`]
//! parses contents and security block once the message is known to be local.

use crate::codec::{expect_drained, patch_uint, Codec, CodecRegistry, FieldWidth, RegisteredCodec};
use crate::content::{Content, ContentBlock, ContentCodec, ContentType, MessageExtension};
use crate::error::WireError;
use crate::header::{Header, HeaderCodec, LENGTH_OFFSET};
use crate::security::{SecurityBlock, SecurityBlockCodec};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// A fully decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Forwarding header
    pub header: Header,
    /// Contents
    pub content: Content,
    /// Content extensions
    pub extensions: Vec<MessageExtension>,
    /// Certificates and signature
    pub security_block: SecurityBlock,
}

impl Message {
    /// Message with no extensions and an unsigned security block
    pub fn new(header: Header, content: Content) -> Self {
        Self {
            header,
            content,
            extensions: Vec::new(),
            security_block: SecurityBlock::unsigned(),
        }
    }

    /// Transaction id
    pub fn transaction_id(&self) -> u64 {
        self.header.transaction_id
    }

    /// Whether the contents are an answer
    pub fn is_answer(&self) -> bool {
        self.content.is_answer()
    }
}

/// A message whose header is decoded and whose remainder is opaque
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardMessage {
    /// Forwarding header
    pub header: Header,
    /// Encoded contents and security block, untouched
    pub payload: Bytes,
}

impl ForwardMessage {
    /// Content type read from the first two payload bytes, without
    /// decoding the contents
    pub fn content_type(&self) -> Option<ContentType> {
        match self.payload.get(..2) {
            Some(&[hi, lo]) => Some(ContentType::from(u16::from_be_bytes([hi, lo]))),
            _ => None,
        }
    }

    /// Whether the payload carries a request
    pub fn is_request(&self) -> bool {
        self.content_type().map_or(false, |t| !t.is_answer())
    }
}

/// A decoded message plus the contents exactly as received
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// The message
    pub message: Message,
    /// Encoded contents, the input to signature verification
    pub raw_content: Bytes,
}

/// Codec for [`Message`]
#[derive(Debug, Clone)]
pub struct MessageCodec {
    header: Arc<HeaderCodec>,
    content: Arc<ContentCodec>,
    security: Arc<SecurityBlockCodec>,
    max_message_size: usize,
}

impl MessageCodec {
    /// Assemble a message codec from its component codecs
    pub fn new(
        header: Arc<HeaderCodec>,
        content: Arc<ContentCodec>,
        security: Arc<SecurityBlockCodec>,
        max_message_size: usize,
    ) -> Self {
        Self {
            header,
            content,
            security,
            max_message_size,
        }
    }

    /// Largest message accepted in either direction
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Header codec in use
    pub fn header_codec(&self) -> &HeaderCodec {
        &self.header
    }

    /// Encode contents and extensions on their own, e.g. to sign them
    pub fn encode_content(&self, block: &ContentBlock) -> Result<Bytes, WireError> {
        self.content.encode_to_bytes(block)
    }

    /// Decode the header of a received message, leaving the rest opaque
    pub fn decode_header(&self, mut bytes: Bytes) -> Result<ForwardMessage, WireError> {
        let total = bytes.len();
        if total > self.max_message_size {
            return Err(WireError::MessageTooLarge(total));
        }
        let decoded = self.header.decode_with_lengths(&mut bytes)?;
        if decoded.message_length as usize != total {
            return Err(WireError::LengthMismatch {
                declared: decoded.message_length as usize,
                actual: total,
            });
        }
        Ok(ForwardMessage {
            header: decoded.header,
            payload: bytes,
        })
    }

    /// Decode contents and security block of a message addressed here
    pub fn decode_payload(&self, forward: ForwardMessage) -> Result<DecodedMessage, WireError> {
        let mut payload = forward.payload;
        let before = payload.len();
        let mut probe = payload.clone();
        let block = self.content.decode(&mut probe)?;
        let content_len = before - probe.len();
        let raw_content = payload.split_to(content_len);

        let security_block = self.security.decode(&mut payload)?;
        expect_drained(&payload)?;

        Ok(DecodedMessage {
            message: Message {
                header: forward.header,
                content: block.content,
                extensions: block.extensions,
                security_block,
            },
            raw_content,
        })
    }

    /// Write a message from already encoded contents
    pub fn assemble(
        &self,
        header: &Header,
        raw_content: &[u8],
        security_block: &SecurityBlock,
    ) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        self.header.encode(header, &mut buf)?;
        buf.put_slice(raw_content);
        self.security.encode(security_block, &mut buf)?;
        self.finish(buf)
    }

    /// Re-encode a forwarded message with its rewritten header
    pub fn encode_forward(&self, forward: &ForwardMessage) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(forward.payload.len() + 128);
        self.header.encode(&forward.header, &mut buf)?;
        buf.put_slice(&forward.payload);
        self.finish(buf)
    }

    fn finish(&self, mut buf: BytesMut) -> Result<Bytes, WireError> {
        let len = buf.len();
        if len > self.max_message_size {
            return Err(WireError::MessageTooLarge(len));
        }
        patch_uint(&mut buf, LENGTH_OFFSET, FieldWidth::U32, len as u64)?;
        Ok(buf.freeze())
    }
}

impl Codec for MessageCodec {
    type Item = Message;

    fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), WireError> {
        let raw_content = self.encode_content(&ContentBlock {
            content: message.content.clone(),
            extensions: message.extensions.clone(),
        })?;
        let bytes = self.assemble(&message.header, &raw_content, &message.security_block)?;
        buf.put_slice(&bytes);
        Ok(())
    }

    fn decode(&self, buf: &mut Bytes) -> Result<Message, WireError> {
        let bytes = buf.split_off(0);
        let forward = self.decode_header(bytes)?;
        Ok(self.decode_payload(forward)?.message)
    }
}

impl RegisteredCodec for MessageCodec {
    fn build(registry: &CodecRegistry) -> Self {
        Self::new(
            registry.get::<HeaderCodec>(),
            registry.get::<ContentCodec>(),
            registry.get::<SecurityBlockCodec>(),
            registry.config().max_message_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireConfig;
    use crate::content::ErrorCode;
    use crate::ids::NodeId;
    use crate::security::{DigestSigner, Signer};

    fn registry() -> CodecRegistry {
        CodecRegistry::default()
    }

    fn node(b: u8) -> NodeId {
        NodeId::new(vec![b; 16])
    }

    fn sample() -> Message {
        let header = Header::builder(0x0BAD_F00D)
            .transaction_id(77)
            .ttl(6)
            .via_list(vec![node(1)])
            .destination(node(4))
            .build();
        Message::new(header, Content::ping())
    }

    #[test]
    fn test_message_round_trip() {
        let codec = registry().get::<MessageCodec>();
        let msg = sample();
        let bytes = codec.encode_to_bytes(&msg).unwrap();
        assert_eq!(
            u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize,
            bytes.len()
        );
        assert_eq!(codec.decode(&mut bytes.clone()).unwrap(), msg);
    }

    #[test]
    fn test_forward_preserves_payload() {
        let codec = registry().get::<MessageCodec>();
        let bytes = codec.encode_to_bytes(&sample()).unwrap();

        let mut forward = codec.decode_header(bytes).unwrap();
        assert_eq!(forward.content_type(), Some(ContentType::PingRequest));
        assert!(forward.is_request());
        let payload = forward.payload.clone();
        forward.header.to_forward(&node(2)).unwrap();
        let rewritten = codec.encode_forward(&forward).unwrap();

        let again = codec.decode_header(rewritten).unwrap();
        assert_eq!(again.header.ttl, 5);
        assert_eq!(again.header.via_list, vec![node(1), node(2)]);
        assert_eq!(again.payload, payload);

        let decoded = codec.decode_payload(again).unwrap();
        assert_eq!(decoded.message.content, Content::ping());
    }

    #[test]
    fn test_length_mismatch() {
        let codec = registry().get::<MessageCodec>();
        let bytes = codec.encode_to_bytes(&sample()).unwrap();
        let mut longer = BytesMut::from(&bytes[..]);
        longer.put_u8(0);
        assert!(matches!(
            codec.decode_header(longer.freeze()),
            Err(WireError::LengthMismatch { .. })
        ));
        assert!(codec.decode_header(bytes.slice(..bytes.len() - 1)).is_err());
    }

    #[test]
    fn test_max_message_size() {
        let registry = CodecRegistry::new(WireConfig {
            max_message_size: 100,
            ..WireConfig::default()
        });
        let codec = registry.get::<MessageCodec>();
        let mut msg = sample();
        msg.content = Content::PingRequest {
            padding: Bytes::from(vec![0u8; 200]),
        };
        assert!(matches!(
            codec.encode_to_bytes(&msg),
            Err(WireError::MessageTooLarge(_))
        ));
        assert!(matches!(
            codec.decode_header(Bytes::from(vec![0u8; 101])),
            Err(WireError::MessageTooLarge(101))
        ));
    }

    #[test]
    fn test_raw_content_verifies_signature() {
        let codec = registry().get::<MessageCodec>();
        let signer = DigestSigner::new(b"peer");
        let header = sample().header;
        let block = ContentBlock::from(Content::error(ErrorCode::NotFound, "gone"));
        let raw = codec.encode_content(&block).unwrap();
        let security = signer
            .security_block(header.overlay_hash, header.transaction_id, &raw)
            .unwrap();
        let bytes = codec.assemble(&header, &raw, &security).unwrap();

        let decoded = codec
            .decode_payload(codec.decode_header(bytes).unwrap())
            .unwrap();
        assert_eq!(decoded.raw_content, raw);
        signer
            .verify_block(
                decoded.message.header.overlay_hash,
                decoded.message.transaction_id(),
                &decoded.raw_content,
                &decoded.message.security_block,
            )
            .unwrap();
    }

    #[test]
    fn test_trailing_payload_rejected() {
        let codec = registry().get::<MessageCodec>();
        let bytes = codec.encode_to_bytes(&sample()).unwrap();
        let mut forward = codec.decode_header(bytes).unwrap();
        let mut payload = BytesMut::from(&forward.payload[..]);
        payload.put_u8(1);
        forward.payload = payload.freeze();
        assert_eq!(
            codec.decode_payload(forward).unwrap_err(),
            WireError::TrailingBytes(1)
        );
    }
}
