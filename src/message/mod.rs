mod bitfield;
mod codec;
mod handshake;

pub use bitfield::Bitfield;
pub use codec::MessageCodec;
pub use handshake::{Handshake, HANDSHAKE_MESSAGE_LENGTH, PROTOCOL_IDENTIFIER};

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};

pub type PieceIndex = u32;

/// The complete message vocabulary of the peer wire protocol.
///
/// Every variant except `Handshake` and `KeepAlive` travels as a 4-byte
/// big-endian length prefix, a 1-byte type tag and the payload. `KeepAlive`
/// is a bare zero length. Undecodable input becomes `SerializeError` so a
/// single malformed peer message never takes down the decode path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Handshake(Handshake),
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    SerializeError {
        raw: Vec<u8>,
        reason: String,
    },
}

impl PeerMessage {
    /// The wire type tag; `None` for the variants with their own framing.
    pub fn message_id(&self) -> Option<u8> {
        match self {
            PeerMessage::Handshake(_) => None,
            PeerMessage::KeepAlive => None,
            PeerMessage::Choke => Some(0),
            PeerMessage::Unchoke => Some(1),
            PeerMessage::Interested => Some(2),
            PeerMessage::NotInterested => Some(3),
            PeerMessage::Have(_) => Some(4),
            PeerMessage::Bitfield(_) => Some(5),
            PeerMessage::Request { .. } => Some(6),
            PeerMessage::Piece { .. } => Some(7),
            PeerMessage::Cancel { .. } => Some(8),
            PeerMessage::Port(_) => Some(9),
            PeerMessage::SerializeError { .. } => None,
        }
    }

    /// Decode one complete frame: the type tag plus payload, with the length
    /// prefix already stripped by the framer. Unknown tags and size
    /// mismatches yield `SerializeError`, never a hard failure.
    pub fn decode(frame: &[u8]) -> PeerMessage {
        let Some(&tag) = frame.first() else {
            return Self::malformed(frame, "empty frame");
        };
        let payload = &frame[1..];

        match tag {
            0 | 1 | 2 | 3 => {
                if !payload.is_empty() {
                    return Self::malformed(frame, "unexpected payload on flag message");
                }
                match tag {
                    0 => PeerMessage::Choke,
                    1 => PeerMessage::Unchoke,
                    2 => PeerMessage::Interested,
                    _ => PeerMessage::NotInterested,
                }
            }
            4 => match Self::read_u32(payload, 0) {
                Some(index) if payload.len() == 4 => PeerMessage::Have(index),
                _ => Self::malformed(frame, "have payload must be 4 bytes"),
            },
            5 => PeerMessage::Bitfield(Bitfield::from_bytes(payload.to_vec())),
            6 | 8 => {
                if payload.len() != 12 {
                    return Self::malformed(frame, "request/cancel payload must be 12 bytes");
                }
                let index = Self::read_u32(payload, 0).unwrap_or_default();
                let begin = Self::read_u32(payload, 4).unwrap_or_default();
                let length = Self::read_u32(payload, 8).unwrap_or_default();
                if tag == 6 {
                    PeerMessage::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Self::malformed(frame, "piece payload shorter than its header");
                }
                let index = Self::read_u32(payload, 0).unwrap_or_default();
                let begin = Self::read_u32(payload, 4).unwrap_or_default();
                PeerMessage::Piece {
                    index,
                    begin,
                    block: payload[8..].to_vec(),
                }
            }
            9 => {
                if payload.len() != 2 {
                    return Self::malformed(frame, "port payload must be 2 bytes");
                }
                PeerMessage::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            other => Self::malformed(frame, format!("unknown message tag {}", other)),
        }
    }

    /// Append the bit-exact wire form of this message.
    ///
    /// `SerializeError` is a decode artifact and has no wire form.
    pub fn encode(&self, dst: &mut BytesMut) -> io::Result<()> {
        match self {
            PeerMessage::Handshake(handshake) => {
                dst.extend_from_slice(&handshake.to_bytes());
            }
            PeerMessage::KeepAlive => {
                dst.put_u32(0);
            }
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(self.tag());
            }
            PeerMessage::Have(index) => {
                dst.put_u32(1 + 4);
                dst.put_u8(self.tag());
                dst.put_u32(*index);
            }
            PeerMessage::Bitfield(bitfield) => {
                let bytes = bitfield.as_bytes();
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(self.tag());
                dst.extend_from_slice(bytes);
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            }
            | PeerMessage::Cancel {
                index,
                begin,
                length,
            } => {
                dst.put_u32(1 + 12);
                dst.put_u8(self.tag());
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(*length);
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(1 + 8 + block.len() as u32);
                dst.put_u8(self.tag());
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.extend_from_slice(block);
            }
            PeerMessage::Port(port) => {
                dst.put_u32(1 + 2);
                dst.put_u8(self.tag());
                dst.put_u16(*port);
            }
            PeerMessage::SerializeError { reason, .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("refusing to encode undecodable message: {}", reason),
                ));
            }
        }
        Ok(())
    }

    fn tag(&self) -> u8 {
        // Callers only reach this for variants with a wire tag.
        self.message_id().unwrap_or(u8::MAX)
    }

    fn malformed(frame: &[u8], reason: impl Into<String>) -> PeerMessage {
        PeerMessage::SerializeError {
            raw: frame.to_vec(),
            reason: reason.into(),
        }
    }

    fn read_u32(payload: &[u8], offset: usize) -> Option<u32> {
        let bytes = payload.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: PeerMessage) {
        let mut wire = BytesMut::new();
        message.encode(&mut wire).unwrap();
        // Strip the length prefix the way the framer would.
        let length = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(wire.len(), 4 + length);
        assert_eq!(PeerMessage::decode(&wire[4..]), message);
    }

    #[test]
    fn flag_messages_round_trip() {
        round_trip(PeerMessage::Choke);
        round_trip(PeerMessage::Unchoke);
        round_trip(PeerMessage::Interested);
        round_trip(PeerMessage::NotInterested);
    }

    #[test]
    fn payload_messages_round_trip() {
        round_trip(PeerMessage::Have(42));
        round_trip(PeerMessage::Bitfield(Bitfield::from_bytes(vec![
            0b1010_1010,
            0b1111_0000,
        ])));
        round_trip(PeerMessage::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        });
        round_trip(PeerMessage::Piece {
            index: 3,
            begin: 0,
            block: b"block payload".to_vec(),
        });
        round_trip(PeerMessage::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        });
        round_trip(PeerMessage::Port(6881));
    }

    #[test]
    fn keep_alive_is_four_zero_bytes() {
        let mut wire = BytesMut::new();
        PeerMessage::KeepAlive.encode(&mut wire).unwrap();
        assert_eq!(&wire[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn request_layout_is_bit_exact() {
        let mut wire = BytesMut::new();
        PeerMessage::Request {
            index: 1,
            begin: 2,
            length: 3,
        }
        .encode(&mut wire)
        .unwrap();
        assert_eq!(
            &wire[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[test]
    fn unknown_tag_becomes_serialize_error() {
        let decoded = PeerMessage::decode(&[99, 1, 2, 3]);
        match decoded {
            PeerMessage::SerializeError { raw, reason } => {
                assert_eq!(raw, vec![99, 1, 2, 3]);
                assert!(reason.contains("99"));
            }
            other => panic!("expected SerializeError, got {:?}", other),
        }
    }

    #[test]
    fn undersized_payload_becomes_serialize_error() {
        assert!(matches!(
            PeerMessage::decode(&[4, 0, 0]),
            PeerMessage::SerializeError { .. }
        ));
        assert!(matches!(
            PeerMessage::decode(&[7, 0, 0, 0, 0]),
            PeerMessage::SerializeError { .. }
        ));
    }

    #[test]
    fn serialize_error_refuses_to_encode() {
        let mut wire = BytesMut::new();
        let err = PeerMessage::SerializeError {
            raw: vec![1],
            reason: "test".into(),
        }
        .encode(&mut wire);
        assert!(err.is_err());
        assert!(wire.is_empty());
    }
}
