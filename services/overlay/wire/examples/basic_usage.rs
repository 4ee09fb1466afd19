//! Basic usage example for the RELOAD wire protocol.

use bytes::BytesMut;
use reload_wire::{
    overlay_hash, Codec, CodecRegistry, Content, FrameDecoder, FramedMessage,
    FramedMessageCodec, Header, Message, MessageCodec, NodeId,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== RELOAD Wire Protocol Example ===\n");

    let registry = CodecRegistry::default();
    let messages = registry.get::<MessageCodec>();
    let frames = registry.get::<FramedMessageCodec>();

    // 1. Build a ping request
    println!("1. Building a PingRequest...");
    let sender = NodeId::random(16);
    let target = NodeId::random(16);
    let header = Header::builder(overlay_hash("example.org"))
        .via_list(vec![sender.clone()])
        .destination(target.clone())
        .build();
    let message = Message::new(header, Content::ping());
    let encoded = messages.encode_to_bytes(&message)?;
    println!("   Encoded message size: {} bytes", encoded.len());

    // 2. Wrap it in a DATA frame
    println!("\n2. Framing...");
    let frame = FramedMessage::Data {
        sequence: 1,
        payload: encoded,
    };
    let wire = frames.encode_to_bytes(&frame)?;
    println!("   Frame size: {} bytes", wire.len());

    // 3. Decode the frame, then only the header
    println!("\n3. Decoding...");
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::from(wire.as_ref());
    if let Some(FramedMessage::Data { sequence, payload }) = decoder.decode(&mut buf)? {
        let forward = messages.decode_header(payload)?;
        println!("   Sequence: {}", sequence);
        println!("   Transaction: {:#018x}", forward.header.transaction_id);
        println!("   TTL: {}", forward.header.ttl);
        println!("   Destination: {:?}", forward.header.final_destination());

        // 4. Decode the rest
        let decoded = messages.decode_payload(forward)?;
        println!("   Content: {}", decoded.message.content.content_type());
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
