//! Link-layer frames.
//!
//! ```text
//! Frame := type(u8) sequence(u32) body
//!   DATA (128): message<0..2^24-1>
//!   ACK  (129): received(u32)
//! ```
//!
//! `received` is a bitmask over the 32 sequence numbers preceding the
//! acknowledged one: bit `i` set means `sequence - 1 - i` was seen.

use crate::codec::{read_field, read_u32, read_u8, write_opaque, Codec, CodecRegistry, FieldWidth, RegisteredCodec};
use crate::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Frame type of a DATA frame
pub const FRAME_TYPE_DATA: u8 = 128;
/// Frame type of an ACK frame
pub const FRAME_TYPE_ACK: u8 = 129;

/// Largest message a DATA frame carries
pub const MAX_FRAME_PAYLOAD: usize = 0xFF_FFFF;

const DATA_PREFIX: usize = 1 + 4 + 3;
const ACK_SIZE: usize = 1 + 4 + 4;

/// Frame exchanged over one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedMessage {
    /// Carries one encoded message
    Data {
        /// Link sequence number
        sequence: u32,
        /// Encoded message
        payload: Bytes,
    },
    /// Acknowledges a DATA frame
    Ack {
        /// Sequence number being acknowledged
        sequence: u32,
        /// Which of the 32 preceding sequence numbers were received: bit
        /// `i` is set when `sequence - 1 - i` arrived, so bit 0 stands for
        /// the frame just before `sequence`
        received: u32,
    },
}

impl FramedMessage {
    /// Sequence number carried by the frame
    pub fn sequence(&self) -> u32 {
        match self {
            FramedMessage::Data { sequence, .. } | FramedMessage::Ack { sequence, .. } => {
                *sequence
            }
        }
    }

    /// Frame type byte
    pub fn frame_type(&self) -> u8 {
        match self {
            FramedMessage::Data { .. } => FRAME_TYPE_DATA,
            FramedMessage::Ack { .. } => FRAME_TYPE_ACK,
        }
    }
}

/// Codec for [`FramedMessage`]
#[derive(Debug, Clone, Default)]
pub struct FramedMessageCodec;

impl Codec for FramedMessageCodec {
    type Item = FramedMessage;

    fn encode(&self, frame: &FramedMessage, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u8(frame.frame_type());
        buf.put_u32(frame.sequence());
        match frame {
            FramedMessage::Data { payload, .. } => write_opaque(buf, FieldWidth::U24, payload),
            FramedMessage::Ack { received, .. } => {
                buf.put_u32(*received);
                Ok(())
            }
        }
    }

    fn decode(&self, buf: &mut Bytes) -> Result<FramedMessage, WireError> {
        let frame_type = read_u8(buf)?;
        let sequence = read_u32(buf)?;
        match frame_type {
            FRAME_TYPE_DATA => Ok(FramedMessage::Data {
                sequence,
                payload: read_field(buf, FieldWidth::U24)?,
            }),
            FRAME_TYPE_ACK => Ok(FramedMessage::Ack {
                sequence,
                received: read_u32(buf)?,
            }),
            other => Err(WireError::FrameType(other)),
        }
    }
}

impl RegisteredCodec for FramedMessageCodec {
    fn build(_registry: &CodecRegistry) -> Self {
        FramedMessageCodec
    }
}

/// Incremental decoder for frames arriving on a byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: FramedMessageCodec,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until a whole frame is
    /// buffered.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FramedMessage>, WireError> {
        let Some(&frame_type) = buf.first() else {
            return Ok(None);
        };
        let frame_len = match frame_type {
            FRAME_TYPE_DATA => {
                if buf.len() < DATA_PREFIX {
                    return Ok(None);
                }
                let len = (usize::from(buf[5]) << 16) | (usize::from(buf[6]) << 8) | usize::from(buf[7]);
                DATA_PREFIX + len
            }
            FRAME_TYPE_ACK => ACK_SIZE,
            other => return Err(WireError::FrameType(other)),
        };

        if buf.len() < frame_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len).freeze();
        self.codec.decode(&mut frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_wire_form() {
        let frame = FramedMessage::Data {
            sequence: 0x01020304,
            payload: Bytes::from_static(b"hi"),
        };
        let bytes = FramedMessageCodec.encode_to_bytes(&frame).unwrap();
        assert_eq!(&bytes[..], &[128, 1, 2, 3, 4, 0, 0, 2, b'h', b'i']);
        assert_eq!(FramedMessageCodec.decode(&mut bytes.clone()).unwrap(), frame);
    }

    #[test]
    fn test_ack_frame_round_trip() {
        let frame = FramedMessage::Ack {
            sequence: u32::MAX,
            received: 0b1011,
        };
        let mut bytes = FramedMessageCodec.encode_to_bytes(&frame).unwrap();
        assert_eq!(bytes.len(), ACK_SIZE);
        assert_eq!(FramedMessageCodec.decode(&mut bytes).unwrap(), frame);
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut bytes = Bytes::from_static(&[7, 0, 0, 0, 1]);
        assert_eq!(
            FramedMessageCodec.decode(&mut bytes),
            Err(WireError::FrameType(7))
        );
    }

    #[test]
    fn test_stream_decoder_partial_frames() {
        let data = FramedMessage::Data {
            sequence: 9,
            payload: Bytes::from(vec![5u8; 300]),
        };
        let ack = FramedMessage::Ack {
            sequence: 3,
            received: 1,
        };
        let mut wire = BytesMut::new();
        FramedMessageCodec.encode(&data, &mut wire).unwrap();
        FramedMessageCodec.encode(&ack, &mut wire).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(7) {
            buf.extend_from_slice(chunk);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![data, ack]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stream_decoder_rejects_garbage() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&[0x42u8, 0, 0][..]);
        assert_eq!(decoder.decode(&mut buf), Err(WireError::FrameType(0x42)));
    }
}
