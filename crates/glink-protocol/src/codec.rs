//! Frame codec for TCP streams and discovery datagrams.
//!
//! Wire format: 4-byte little-endian payload length + 2-byte little-endian
//! type id + serde JSON payload. A receiver reads exactly the 6 header bytes,
//! then exactly `length` payload bytes, before interpreting anything.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Message, MessageType, WireMessage};
use crate::{ProtocolError, Result, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Parsed frame header. No validation beyond field extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_size: u32,
    pub msg_type: u16,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.payload_size.to_le_bytes());
        out[4..].copy_from_slice(&self.msg_type.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            payload_size: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            msg_type: u16::from_le_bytes([bytes[4], bytes[5]]),
        }
    }

    /// Decode the header at the front of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let header: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or(ProtocolError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            })?;
        Ok(Self::decode(header))
    }
}

/// An encoded message: header and payload kept apart so a writer can send
/// both without re-encoding per recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            header: FrameHeader {
                payload_size: payload.len() as u32,
                msg_type: msg_type.id(),
            },
            payload,
        })
    }

    /// Header followed by payload, as written to the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one complete frame (e.g. a discovery datagram). Trailing bytes
    /// beyond the declared payload are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Message> {
        let header = FrameHeader::from_slice(bytes)?;
        let len = header.payload_size as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let payload = bytes
            .get(HEADER_SIZE..HEADER_SIZE + len)
            .ok_or(ProtocolError::Truncated {
                needed: HEADER_SIZE + len,
                available: bytes.len(),
            })?;
        let msg_type = MessageType::try_from(header.msg_type)?;
        Message::from_payload(msg_type, payload)
    }
}

impl Message {
    pub fn encode(&self) -> Result<Frame> {
        Frame::new(self.message_type(), self.to_payload()?)
    }
}

/// Encode a single typed value.
pub fn encode_message<T: WireMessage>(msg: &T) -> Result<Frame> {
    let payload = serde_json::to_vec(msg).map_err(ProtocolError::Encode)?;
    Frame::new(T::TYPE, payload)
}

/// Decode a payload into the statically expected type.
pub fn decode_payload<T: WireMessage>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|source| ProtocolError::MalformedPayload {
        msg_type: T::TYPE.id(),
        source,
    })
}

/// Codec for framing Message values over a byte stream.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::from_slice(&src[..])?;
        let length = header.payload_size as usize;

        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length);

        let msg_type = MessageType::try_from(header.msg_type)?;
        let message = Message::from_payload(msg_type, &payload)?;
        tracing::trace!(%msg_type, size = length, "codec: frame decoded");
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let frame = item.encode()?;
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_slice(&frame.header.encode());
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
