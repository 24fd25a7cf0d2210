use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Handshake, PeerMessage};

/// Upper bound on a single frame; a standard block is 16 KiB plus header,
/// so anything past this is stream corruption rather than a large message.
const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Reassembles complete protocol messages out of raw socket bytes and
/// serializes outgoing messages into ready-to-write chunks.
///
/// The inbound side is stateful: constructed with [`MessageCodec::inbound`]
/// it first expects the handshake (which has its own framing) and only then
/// switches to length-prefixed messages.
#[derive(Debug)]
pub struct MessageCodec {
    awaiting_handshake: bool,
}

impl MessageCodec {
    /// Codec for a connection whose handshake was already consumed, and for
    /// the outgoing direction.
    pub fn new() -> Self {
        Self {
            awaiting_handshake: false,
        }
    }

    /// Codec for a fresh inbound byte stream: the first frame is a handshake.
    pub fn inbound() -> Self {
        Self {
            awaiting_handshake: true,
        }
    }

    fn decode_handshake(&mut self, src: &mut BytesMut) -> Option<PeerMessage> {
        let pstrlen = *src.first()? as usize;
        let total = 1 + pstrlen + 48;
        if src.len() < total {
            return None;
        }

        let raw = src.split_to(total);
        self.awaiting_handshake = false;
        Some(match Handshake::parse(&raw) {
            Ok(handshake) => PeerMessage::Handshake(handshake),
            Err(reason) => PeerMessage::SerializeError {
                raw: raw.to_vec(),
                reason,
            },
        })
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = PeerMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.awaiting_handshake {
            return Ok(self.decode_handshake(src));
        }

        if src.len() < 4 {
            return Ok(None);
        }

        // Peek the prefix without consuming; a partial frame must leave the
        // buffer untouched for the next read.
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        if length > MAX_MESSAGE_SIZE {
            let raw = src.split_to(4).to_vec();
            return Ok(Some(PeerMessage::SerializeError {
                raw,
                reason: format!("frame length {} exceeds maximum {}", length, MAX_MESSAGE_SIZE),
            }));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(length);
        Ok(Some(PeerMessage::decode(&frame)))
    }
}

impl Encoder<PeerMessage> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}
