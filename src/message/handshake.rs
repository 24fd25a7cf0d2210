use crate::torrent::InfoHash;

pub const PROTOCOL_IDENTIFIER: [u8; 19] = *b"BitTorrent protocol";
pub const HANDSHAKE_MESSAGE_LENGTH: usize = 68;

/// The fixed-format first message on every connection. Unlike every other
/// message it has no length prefix: one byte of protocol-string length,
/// the protocol string, 8 reserved bytes, the info hash and the peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0; 8],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_MESSAGE_LENGTH);
        bytes.push(PROTOCOL_IDENTIFIER.len() as u8);
        bytes.extend_from_slice(&PROTOCOL_IDENTIFIER);
        bytes.extend_from_slice(&self.reserved);
        bytes.extend_from_slice(self.info_hash.as_bytes());
        bytes.extend_from_slice(&self.peer_id);
        bytes
    }

    /// Parse a complete handshake. `raw` must already span the full message,
    /// i.e. `1 + pstrlen + 48` bytes as announced by its first byte; the
    /// framer guarantees this.
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let Some(&pstrlen) = raw.first() else {
            return Err("empty handshake".into());
        };
        let pstrlen = pstrlen as usize;
        if raw.len() != 1 + pstrlen + 48 {
            return Err(format!(
                "handshake length {} does not match pstrlen {}",
                raw.len(),
                pstrlen
            ));
        }
        if raw[1..1 + pstrlen] != PROTOCOL_IDENTIFIER {
            return Err("unsupported protocol identifier".into());
        }

        let rest = &raw[1 + pstrlen..];
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&rest[..8]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[8..28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[28..48]);

        Ok(Self {
            info_hash: InfoHash::new(info_hash),
            peer_id,
            reserved,
        })
    }
}
