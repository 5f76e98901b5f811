//! Basic usage example for the p2p wire codec.

use bytes::BytesMut;
use p2p_wire::{level, Message, MessageCodec, RejectMessage, VersionMessage, DEFAULT_MAX_PAYLOAD};

const MAGIC: u32 = 0xd9b4_bef9;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== P2P Wire Codec Example ===\n");

    let codec = MessageCodec::new(MAGIC, DEFAULT_MAX_PAYLOAD);

    // 1. Encode a version announcement
    println!("1. Encoding a version message...");
    let version = Message::Version(VersionMessage {
        value: level::MAXIMUM,
        services: 1,
        timestamp: 1_700_000_000,
        address_receiver: None,
        address_sender: None,
        nonce: 0x1234_5678_9abc_def0,
        user_agent: "/p2p-node:0.1.0/".to_string(),
    });
    let frame = codec.encode(&version)?;
    println!("   Encoded frame size: {} bytes", frame.len());

    // 2. Decode it back from a partially filled buffer
    println!("\n2. Decoding in two reads...");
    let (head, tail) = frame.split_at(frame.len() / 2);
    let mut buf = BytesMut::from(head);
    assert!(codec.decode(&mut buf)?.is_none());
    println!("   Partial frame buffered ({} bytes)", buf.len());

    buf.extend_from_slice(tail);
    if let Some(Message::Version(decoded)) = codec.decode(&mut buf)? {
        println!("   Decoded version {} from {}", decoded.value, decoded.user_agent);
    }

    // 3. Several frames in one buffer
    println!("\n3. Decoding a batch...");
    let mut buf = BytesMut::new();
    for message in [
        Message::Verack,
        Message::Ping { nonce: 42 },
        Message::Reject(RejectMessage::obsolete_version("version too old")),
    ] {
        buf.extend_from_slice(&codec.encode(&message)?);
    }
    while let Some(message) = codec.decode(&mut buf)? {
        println!("   Received {}", message);
    }

    // 4. Frames for another network are refused
    println!("\n4. Decoding with the wrong magic...");
    let other = MessageCodec::new(MAGIC + 1, DEFAULT_MAX_PAYLOAD);
    let mut buf = BytesMut::from(frame.as_ref());
    match other.decode(&mut buf) {
        Err(e) => println!("   Refused: {}", e),
        Ok(_) => println!("   Unexpectedly accepted"),
    }

    println!("\n=== Example completed ===");
    Ok(())
}
