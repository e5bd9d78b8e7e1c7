//! Glink Protocol -- wire types, message codec, type-id registry.
//!
//! TCP between peers, UDP multicast for discovery.
//! 6-byte header (4-byte little-endian payload length + 2-byte little-endian
//! type id) followed by a serde JSON payload.

use std::collections::BTreeMap;

pub mod codec;
pub mod messages;

pub use codec::{decode_payload, encode_message, Frame, FrameHeader, MessageCodec};
pub use messages::*;

/// Peer identifier (opaque, generated once per node and persisted).
pub type Uid = String;

/// Chat identifier (opaque, generated by the chat initiator).
pub type Cid = String;

/// Highest message index seen per author, scoped to one chat.
pub type VectorClock = BTreeMap<Uid, u32>;

/// Vector clocks for a set of chats.
pub type ChatsClock = BTreeMap<Cid, VectorClock>;

/// Frame header size: 4 bytes payload length + 2 bytes type id.
pub const HEADER_SIZE: usize = 6;

/// Maximum payload size: 16 MB (a ChatMessagePack can carry a whole chat history).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default multicast group/port for node announcements.
pub const DEFAULT_DISCOVERY_ADDR: &str = "224.0.0.1:9999";

/// Maximum discovery datagram size.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Interval between own announcements.
pub const ANNOUNCE_INTERVAL_MS: u64 = 1000;

/// Leading character that routes user input to the command interpreter.
pub const COMMAND_SENTINEL: char = '!';

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type id {0}")]
    UnknownType(u16),
    #[error("malformed payload for message type {msg_type}: {source}")]
    MalformedPayload {
        msg_type: u16,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
