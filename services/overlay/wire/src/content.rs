//! Message contents.
//!
//! ```text
//! MessageContents := message_code(u16) body<0..2^32-1> extensions<0..2^32-1>
//! MessageExtension := type(u16) critical(u8) contents<0..2^32-1>
//! ```
//!
//! Odd codes are requests, even codes answers and `0xFFFF` is an error
//! response. Codes this crate does not know are carried as
//! [`Content::Unknown`] with the body kept verbatim.

use crate::codec::{
    expect_drained, read_field, read_u16, read_u64, read_u8, write_field, write_opaque, Codec,
    CodecRegistry, FieldWidth, RegisteredCodec,
};
use crate::error::WireError;
use crate::ids::{DestinationCodec, NodeId, NodeIdCodec, RoutableId};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

/// Message code of an error response
pub const ERROR_CODE: u16 = 0xFFFF;

/// Type tag of a message content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentType {
    /// Probe request (1)
    ProbeRequest,
    /// Probe answer (2)
    ProbeAnswer,
    /// Leave request (17)
    LeaveRequest,
    /// Leave answer (18)
    LeaveAnswer,
    /// Route query request (21)
    RouteQueryRequest,
    /// Route query answer (22)
    RouteQueryAnswer,
    /// Ping request (23)
    PingRequest,
    /// Ping answer (24)
    PingAnswer,
    /// Error response (0xFFFF)
    Error,
    /// Any other code
    Other(u16),
}

impl ContentType {
    /// Wire code
    pub fn code(self) -> u16 {
        match self {
            ContentType::ProbeRequest => 1,
            ContentType::ProbeAnswer => 2,
            ContentType::LeaveRequest => 17,
            ContentType::LeaveAnswer => 18,
            ContentType::RouteQueryRequest => 21,
            ContentType::RouteQueryAnswer => 22,
            ContentType::PingRequest => 23,
            ContentType::PingAnswer => 24,
            ContentType::Error => ERROR_CODE,
            ContentType::Other(code) => code,
        }
    }

    /// Whether messages of this type are answers (even codes and errors)
    pub fn is_answer(self) -> bool {
        let code = self.code();
        code == ERROR_CODE || code % 2 == 0
    }

    /// Whether this is a type this crate decodes
    pub fn is_known(self) -> bool {
        !matches!(self, ContentType::Other(_))
    }

    /// Answer type matching a request type
    pub fn answer_type(self) -> Option<ContentType> {
        if self.is_answer() {
            return None;
        }
        Some(ContentType::from(self.code() + 1))
    }
}

impl From<u16> for ContentType {
    fn from(code: u16) -> Self {
        match code {
            1 => ContentType::ProbeRequest,
            2 => ContentType::ProbeAnswer,
            17 => ContentType::LeaveRequest,
            18 => ContentType::LeaveAnswer,
            21 => ContentType::RouteQueryRequest,
            22 => ContentType::RouteQueryAnswer,
            23 => ContentType::PingRequest,
            24 => ContentType::PingAnswer,
            ERROR_CODE => ContentType::Error,
            other => ContentType::Other(other),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Other(code) => write!(f, "Other({})", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// Error codes carried in error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Reserved/invalid
    Invalid,
    /// Forbidden, also used for unsupported requests
    Forbidden,
    /// Not found
    NotFound,
    /// Request timed out
    RequestTimeout,
    /// Generation counter too low
    GenerationCounterTooLow,
    /// Message belongs to a different overlay
    IncompatibleWithOverlay,
    /// Critical forwarding option not understood
    UnsupportedForwardingOption,
    /// Data too large
    DataTooLarge,
    /// Data too old
    DataTooOld,
    /// TTL reached zero in transit
    TtlExceeded,
    /// Message too large
    MessageTooLarge,
    /// Unknown kind
    UnknownKind,
    /// Critical message extension not understood
    UnknownExtension,
    /// Response exceeds max response length
    ResponseTooLarge,
    /// Sender's configuration is too old
    ConfigTooOld,
    /// Sender's configuration is too new
    ConfigTooNew,
    /// Request is in progress
    InProgress,
    /// Experimental A
    ExpA,
    /// Experimental B
    ExpB,
    /// Message could not be parsed or is not valid here
    InvalidMessage,
    /// Unassigned code
    Other(u16),
}

impl ErrorCode {
    /// Wire value
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Invalid => 1,
            ErrorCode::Forbidden => 2,
            ErrorCode::NotFound => 3,
            ErrorCode::RequestTimeout => 4,
            ErrorCode::GenerationCounterTooLow => 5,
            ErrorCode::IncompatibleWithOverlay => 6,
            ErrorCode::UnsupportedForwardingOption => 7,
            ErrorCode::DataTooLarge => 8,
            ErrorCode::DataTooOld => 9,
            ErrorCode::TtlExceeded => 10,
            ErrorCode::MessageTooLarge => 11,
            ErrorCode::UnknownKind => 12,
            ErrorCode::UnknownExtension => 13,
            ErrorCode::ResponseTooLarge => 14,
            ErrorCode::ConfigTooOld => 15,
            ErrorCode::ConfigTooNew => 16,
            ErrorCode::InProgress => 17,
            ErrorCode::ExpA => 18,
            ErrorCode::ExpB => 19,
            ErrorCode::InvalidMessage => 20,
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        match code {
            1 => ErrorCode::Invalid,
            2 => ErrorCode::Forbidden,
            3 => ErrorCode::NotFound,
            4 => ErrorCode::RequestTimeout,
            5 => ErrorCode::GenerationCounterTooLow,
            6 => ErrorCode::IncompatibleWithOverlay,
            7 => ErrorCode::UnsupportedForwardingOption,
            8 => ErrorCode::DataTooLarge,
            9 => ErrorCode::DataTooOld,
            10 => ErrorCode::TtlExceeded,
            11 => ErrorCode::MessageTooLarge,
            12 => ErrorCode::UnknownKind,
            13 => ErrorCode::UnknownExtension,
            14 => ErrorCode::ResponseTooLarge,
            15 => ErrorCode::ConfigTooOld,
            16 => ErrorCode::ConfigTooNew,
            17 => ErrorCode::InProgress,
            18 => ErrorCode::ExpA,
            19 => ErrorCode::ExpB,
            20 => ErrorCode::InvalidMessage,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(code) => write!(f, "error {}", code),
            known => write!(f, "{:?} ({})", known, known.code()),
        }
    }
}

/// Error response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Error code
    pub code: ErrorCode,
    /// Free-form diagnostic
    pub info: Bytes,
}

impl ErrorResponse {
    /// Error response with a UTF-8 diagnostic
    pub fn new(code: ErrorCode, info: impl Into<String>) -> Self {
        Self {
            code,
            info: Bytes::from(info.into()),
        }
    }

    /// Diagnostic as text, lossy
    pub fn info_text(&self) -> String {
        String::from_utf8_lossy(&self.info).into_owned()
    }
}

/// One entry of a probe answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInformation {
    /// Information type
    pub info_type: u8,
    /// Value, up to 255 bytes
    pub value: Bytes,
}

/// Decoded message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Ask a peer for information about itself
    ProbeRequest {
        /// Requested information types
        requested_info: Vec<u8>,
    },
    /// Probe results
    ProbeAnswer {
        /// Returned information
        info: Vec<ProbeInformation>,
    },
    /// Announce that a peer leaves the overlay
    LeaveRequest {
        /// The leaving peer
        node_id: NodeId,
        /// Topology-specific data
        overlay_data: Bytes,
    },
    /// Acknowledge a leave
    LeaveAnswer,
    /// Ask a peer where it would route a destination
    RouteQueryRequest {
        /// Ask for routing updates
        send_update: bool,
        /// Destination to query
        destination: RoutableId,
        /// Topology-specific data
        overlay_data: Bytes,
    },
    /// Route query result
    RouteQueryAnswer {
        /// Topology-specific data
        overlay_data: Bytes,
    },
    /// Liveness check
    PingRequest {
        /// Padding used to probe path MTU
        padding: Bytes,
    },
    /// Liveness answer
    PingAnswer {
        /// Random id chosen by the responder
        response_id: u64,
        /// Responder time in ms since the UNIX epoch
        time: u64,
    },
    /// Error response
    Error(ErrorResponse),
    /// Content of a code this crate does not interpret
    Unknown {
        /// Message code
        code: u16,
        /// Raw body
        body: Bytes,
    },
}

impl Content {
    /// Type tag
    pub fn content_type(&self) -> ContentType {
        match self {
            Content::ProbeRequest { .. } => ContentType::ProbeRequest,
            Content::ProbeAnswer { .. } => ContentType::ProbeAnswer,
            Content::LeaveRequest { .. } => ContentType::LeaveRequest,
            Content::LeaveAnswer => ContentType::LeaveAnswer,
            Content::RouteQueryRequest { .. } => ContentType::RouteQueryRequest,
            Content::RouteQueryAnswer { .. } => ContentType::RouteQueryAnswer,
            Content::PingRequest { .. } => ContentType::PingRequest,
            Content::PingAnswer { .. } => ContentType::PingAnswer,
            Content::Error(_) => ContentType::Error,
            Content::Unknown { code, .. } => ContentType::Other(*code),
        }
    }

    /// Whether this content is an answer
    pub fn is_answer(&self) -> bool {
        self.content_type().is_answer()
    }

    /// Whether this content is a request
    pub fn is_request(&self) -> bool {
        !self.is_answer()
    }

    /// The error response, if this is one
    pub fn as_error(&self) -> Option<&ErrorResponse> {
        match self {
            Content::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Shorthand for an error response content
    pub fn error(code: ErrorCode, info: impl Into<String>) -> Self {
        Content::Error(ErrorResponse::new(code, info))
    }

    /// Ping request without padding
    pub fn ping() -> Self {
        Content::PingRequest {
            padding: Bytes::new(),
        }
    }
}

/// Extension attached to the message contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageExtension {
    /// Extension type
    pub extension_type: u16,
    /// Receivers that do not understand a critical extension reject the message
    pub critical: bool,
    /// Raw extension contents
    pub contents: Bytes,
}

/// Content together with its extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock {
    /// Content
    pub content: Content,
    /// Extensions
    pub extensions: Vec<MessageExtension>,
}

impl From<Content> for ContentBlock {
    fn from(content: Content) -> Self {
        Self {
            content,
            extensions: Vec::new(),
        }
    }
}

/// Codec for [`ContentBlock`]
#[derive(Debug, Clone)]
pub struct ContentCodec {
    destinations: Arc<DestinationCodec>,
    node_ids: Arc<NodeIdCodec>,
}

impl ContentCodec {
    /// Create a content codec from its component codecs
    pub fn new(destinations: Arc<DestinationCodec>, node_ids: Arc<NodeIdCodec>) -> Self {
        Self {
            destinations,
            node_ids,
        }
    }

    fn encode_body(&self, content: &Content, buf: &mut BytesMut) -> Result<(), WireError> {
        match content {
            Content::ProbeRequest { requested_info } => {
                write_opaque(buf, FieldWidth::U8, requested_info)
            }
            Content::ProbeAnswer { info } => write_field(buf, FieldWidth::U16, |buf| {
                for entry in info {
                    buf.put_u8(entry.info_type);
                    write_opaque(buf, FieldWidth::U8, &entry.value)?;
                }
                Ok(())
            })
            .map(|_| ()),
            Content::LeaveRequest {
                node_id,
                overlay_data,
            } => {
                self.node_ids.encode(node_id, buf)?;
                write_opaque(buf, FieldWidth::U16, overlay_data)
            }
            Content::LeaveAnswer => Ok(()),
            Content::RouteQueryRequest {
                send_update,
                destination,
                overlay_data,
            } => {
                buf.put_u8(u8::from(*send_update));
                self.destinations.encode(destination, buf)?;
                write_opaque(buf, FieldWidth::U16, overlay_data)
            }
            Content::RouteQueryAnswer { overlay_data } => {
                buf.put_slice(overlay_data);
                Ok(())
            }
            Content::PingRequest { padding } => write_opaque(buf, FieldWidth::U16, padding),
            Content::PingAnswer { response_id, time } => {
                buf.put_u64(*response_id);
                buf.put_u64(*time);
                Ok(())
            }
            Content::Error(err) => {
                buf.put_u16(err.code.code());
                write_opaque(buf, FieldWidth::U16, &err.info)
            }
            Content::Unknown { body, .. } => {
                buf.put_slice(body);
                Ok(())
            }
        }
    }

    fn decode_body(&self, code: u16, mut body: Bytes) -> Result<Content, WireError> {
        let content = match ContentType::from(code) {
            ContentType::ProbeRequest => Content::ProbeRequest {
                requested_info: read_field(&mut body, FieldWidth::U8)?.to_vec(),
            },
            ContentType::ProbeAnswer => {
                let mut list = read_field(&mut body, FieldWidth::U16)?;
                let mut info = Vec::new();
                while !list.is_empty() {
                    let info_type = read_u8(&mut list)?;
                    let value = read_field(&mut list, FieldWidth::U8)?;
                    info.push(ProbeInformation { info_type, value });
                }
                Content::ProbeAnswer { info }
            }
            ContentType::LeaveRequest => Content::LeaveRequest {
                node_id: self.node_ids.decode(&mut body)?,
                overlay_data: read_field(&mut body, FieldWidth::U16)?,
            },
            ContentType::LeaveAnswer => Content::LeaveAnswer,
            ContentType::RouteQueryRequest => {
                let send_update = match read_u8(&mut body)? {
                    0 => false,
                    1 => true,
                    _ => return Err(WireError::Malformed("invalid boolean")),
                };
                Content::RouteQueryRequest {
                    send_update,
                    destination: self.destinations.decode(&mut body)?,
                    overlay_data: read_field(&mut body, FieldWidth::U16)?,
                }
            }
            ContentType::RouteQueryAnswer => Content::RouteQueryAnswer {
                overlay_data: body.split_off(0),
            },
            ContentType::PingRequest => Content::PingRequest {
                padding: read_field(&mut body, FieldWidth::U16)?,
            },
            ContentType::PingAnswer => Content::PingAnswer {
                response_id: read_u64(&mut body)?,
                time: read_u64(&mut body)?,
            },
            ContentType::Error => Content::Error(ErrorResponse {
                code: ErrorCode::from(read_u16(&mut body)?),
                info: read_field(&mut body, FieldWidth::U16)?,
            }),
            ContentType::Other(code) => Content::Unknown {
                code,
                body: body.split_off(0),
            },
        };
        expect_drained(&body)?;
        Ok(content)
    }
}

impl Codec for ContentCodec {
    type Item = ContentBlock;

    fn encode(&self, block: &ContentBlock, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u16(block.content.content_type().code());
        write_field(buf, FieldWidth::U32, |buf| self.encode_body(&block.content, buf))?;
        write_field(buf, FieldWidth::U32, |buf| {
            for ext in &block.extensions {
                buf.put_u16(ext.extension_type);
                buf.put_u8(u8::from(ext.critical));
                write_opaque(buf, FieldWidth::U32, &ext.contents)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn decode(&self, buf: &mut Bytes) -> Result<ContentBlock, WireError> {
        let code = read_u16(buf)?;
        let body = read_field(buf, FieldWidth::U32)?;
        let mut ext_list = read_field(buf, FieldWidth::U32)?;

        let content = self.decode_body(code, body)?;
        let mut extensions = Vec::new();
        while !ext_list.is_empty() {
            let extension_type = read_u16(&mut ext_list)?;
            let critical = read_u8(&mut ext_list)? != 0;
            let contents = read_field(&mut ext_list, FieldWidth::U32)?;
            extensions.push(MessageExtension {
                extension_type,
                critical,
                contents,
            });
        }

        Ok(ContentBlock {
            content,
            extensions,
        })
    }
}

impl RegisteredCodec for ContentCodec {
    fn build(registry: &CodecRegistry) -> Self {
        Self::new(registry.get::<DestinationCodec>(), registry.get::<NodeIdCodec>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ResourceId;

    fn codec() -> ContentCodec {
        let registry = CodecRegistry::default();
        registry.get::<ContentCodec>().as_ref().clone()
    }

    fn round_trip(block: ContentBlock) {
        let c = codec();
        let mut bytes = c.encode_to_bytes(&block).unwrap();
        let decoded = c.decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_content_type_codes() {
        assert_eq!(ContentType::from(23), ContentType::PingRequest);
        assert_eq!(ContentType::PingRequest.answer_type(), Some(ContentType::PingAnswer));
        assert_eq!(ContentType::PingAnswer.answer_type(), None);
        assert!(ContentType::Error.is_answer());
        assert!(ContentType::Other(100).is_answer());
        assert!(!ContentType::Other(101).is_answer());
        assert_eq!(ContentType::from(ERROR_CODE).code(), 0xFFFF);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::from(10), ErrorCode::TtlExceeded);
        assert_eq!(ErrorCode::InvalidMessage.code(), 20);
        assert_eq!(ErrorCode::from(4242), ErrorCode::Other(4242));
        assert_eq!(ErrorCode::Other(4242).code(), 4242);
    }

    #[test]
    fn test_ping_round_trip() {
        round_trip(Content::ping().into());
        round_trip(
            Content::PingRequest {
                padding: Bytes::from(vec![0u8; u16::MAX as usize]),
            }
            .into(),
        );
        round_trip(
            Content::PingAnswer {
                response_id: 7,
                time: 1_700_000_000_000,
            }
            .into(),
        );
    }

    #[test]
    fn test_probe_round_trip() {
        round_trip(
            Content::ProbeRequest {
                requested_info: vec![1, 2, 3],
            }
            .into(),
        );
        round_trip(
            Content::ProbeAnswer {
                info: vec![
                    ProbeInformation {
                        info_type: 1,
                        value: Bytes::from_static(&[0, 0, 0, 5]),
                    },
                    ProbeInformation {
                        info_type: 3,
                        value: Bytes::new(),
                    },
                ],
            }
            .into(),
        );
    }

    #[test]
    fn test_leave_and_route_query_round_trip() {
        round_trip(
            Content::LeaveRequest {
                node_id: NodeId::new(vec![3u8; 16]),
                overlay_data: Bytes::from_static(b"bye"),
            }
            .into(),
        );
        round_trip(Content::LeaveAnswer.into());
        round_trip(
            Content::RouteQueryRequest {
                send_update: true,
                destination: ResourceId::new(vec![1, 2]).into(),
                overlay_data: Bytes::new(),
            }
            .into(),
        );
        round_trip(
            Content::RouteQueryAnswer {
                overlay_data: Bytes::from_static(b"route"),
            }
            .into(),
        );
    }

    #[test]
    fn test_error_and_unknown_round_trip() {
        round_trip(Content::error(ErrorCode::TtlExceeded, "ttl").into());
        round_trip(
            Content::Error(ErrorResponse {
                code: ErrorCode::Other(999),
                info: Bytes::new(),
            })
            .into(),
        );
        round_trip(
            Content::Unknown {
                code: 77,
                body: Bytes::from_static(b"\x01\x02\x03"),
            }
            .into(),
        );
    }

    #[test]
    fn test_extensions_round_trip() {
        round_trip(ContentBlock {
            content: Content::ping(),
            extensions: vec![
                MessageExtension {
                    extension_type: 9,
                    critical: true,
                    contents: Bytes::from_static(b"ext"),
                },
                MessageExtension {
                    extension_type: 10,
                    critical: false,
                    contents: Bytes::new(),
                },
            ],
        });
    }

    #[test]
    fn test_body_trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(24);
        write_opaque(&mut buf, FieldWidth::U32, &[0u8; 17]).unwrap();
        write_opaque(&mut buf, FieldWidth::U32, &[]).unwrap();
        assert_eq!(
            codec().decode(&mut buf.freeze()),
            Err(WireError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_empty_ping_wire_form() {
        let bytes = codec().encode_to_bytes(&Content::ping().into()).unwrap();
        assert_eq!(
            &bytes[..],
            &[0, 23, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0]
        );
    }
}
