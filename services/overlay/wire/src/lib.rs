//! Wire protocol for the RELOAD overlay: codec framework, identifiers,
//! forwarding header, message contents, security block and link frames.
//!
//! ## Features
//!
//! - **Length-prefixed fields**: reserve, write, backpatch; bounded sub-views on read
//! - **Codec registry**: one shared instance per codec type, built on first use
//! - **Header-only decode**: forward a message without parsing its contents
//! - **Zero-Copy I/O**: `Bytes`/`BytesMut` throughout
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------------------+
//! | forwarding header    | 38 fixed bytes + via/destination lists |
//! |                      | + forwarding options                   |
//! +----------------------+----------------------------------------+
//! | message contents     | code(u16) body<u32> extensions<u32>    |
//! +----------------------+----------------------------------------+
//! | security block       | certificates<u16> signature            |
//! +----------------------+----------------------------------------+
//! ```
//!
//! On a link, each message travels inside a DATA frame
//! (`type(u8) sequence(u32) message<u24>`) and is acknowledged by an ACK
//! frame (`type(u8) sequence(u32) received(u32)`).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod content;
pub mod error;
pub mod frame;
pub mod header;
pub mod ids;
pub mod message;
pub mod security;

// Re-export main types
pub use codec::{
    allocate_field, expect_drained, read_field, write_field, Codec, CodecRegistry, Field,
    FieldWidth, RegisteredCodec, WireConfig, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_NODE_ID_LENGTH,
};
pub use content::{
    Content, ContentBlock, ContentCodec, ContentType, ErrorCode, ErrorResponse, MessageExtension,
    ProbeInformation,
};
pub use error::WireError;
pub use frame::{FrameDecoder, FramedMessage, FramedMessageCodec, MAX_FRAME_PAYLOAD};
pub use header::{
    overlay_hash, ForwardingFlags, ForwardingOption, Header, HeaderBuilder, HeaderCodec,
    DEFAULT_INITIAL_TTL, RELO_TOKEN, WIRE_VERSION,
};
pub use ids::{DestinationCodec, NodeId, NodeIdCodec, OpaqueId, ResourceId, RoutableId};
pub use message::{DecodedMessage, ForwardMessage, Message, MessageCodec};
pub use security::{
    signature_input, DigestSigner, NullSigner, SecurityBlock, SecurityBlockCodec, SecurityError,
    Signature, Signer, SignerIdentity,
};
