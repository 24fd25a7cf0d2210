use sha1::{Digest, Sha1};

use crate::message::PieceIndex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block offset {got} does not match the next write offset {expected}")]
    OffsetMismatch { expected: u64, got: u64 },
    #[error("block of {len} bytes at offset {offset} overruns the piece size {max_size}")]
    Overrun { offset: u64, len: u64, max_size: u64 },
    #[error("no piece with index {0}")]
    UnknownPiece(PieceIndex),
}

/// Assembly state of a single piece.
///
/// Blocks are appended strictly in increasing offset order; the buffer never
/// has holes. Callers that receive blocks out of order are expected to
/// discard them rather than hand them here.
#[derive(Debug, Clone)]
pub struct PieceState {
    index: PieceIndex,
    max_size: u64,
    expected_digest: [u8; 20],
    buffer: Vec<u8>,
}

impl PieceState {
    pub fn new(index: PieceIndex, max_size: u64, expected_digest: [u8; 20]) -> Self {
        Self {
            index,
            max_size,
            expected_digest,
            buffer: Vec::new(),
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes still missing.
    pub fn remaining(&self) -> u64 {
        self.max_size - self.buffer.len() as u64
    }

    /// The offset the next block must start at.
    pub fn next_offset(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn expected_digest(&self) -> &[u8; 20] {
        &self.expected_digest
    }

    /// Append a block. Fails unless `offset` equals the current buffer
    /// length, so a duplicate delivery of the previous block is rejected
    /// rather than applied twice.
    pub fn add_block(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BlockError> {
        if offset != self.next_offset() {
            return Err(BlockError::OffsetMismatch {
                expected: self.next_offset(),
                got: offset,
            });
        }
        if offset + bytes.len() as u64 > self.max_size {
            return Err(BlockError::Overrun {
                offset,
                len: bytes.len() as u64,
                max_size: self.max_size,
            });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// SHA-1 of the assembled buffer against the expected digest.
    pub fn hash_check(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.buffer);
        let actual: [u8; 20] = hasher.finalize().into();
        actual == self.expected_digest
    }

    pub fn assembled(&self) -> &[u8] {
        &self.buffer
    }

    /// Discard everything received so far; the piece starts over.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn blocks_append_in_order() {
        let mut piece = PieceState::new(0, 4, digest_of(b"abcd"));
        piece.add_block(0, b"ab").unwrap();
        piece.add_block(2, b"cd").unwrap();
        assert!(piece.is_complete());
        assert_eq!(piece.assembled(), b"abcd");
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let mut piece = PieceState::new(0, 4, digest_of(b"abcd"));
        piece.add_block(0, b"ab").unwrap();
        let err = piece.add_block(0, b"ab").unwrap_err();
        assert_eq!(err, BlockError::OffsetMismatch { expected: 2, got: 0 });
        assert_eq!(piece.assembled(), b"ab");
    }

    #[test]
    fn gap_offset_is_rejected() {
        let mut piece = PieceState::new(0, 8, [0; 20]);
        assert!(piece.add_block(4, b"late").is_err());
        assert_eq!(piece.next_offset(), 0);
    }

    #[test]
    fn overrun_is_rejected() {
        let mut piece = PieceState::new(0, 3, [0; 20]);
        assert!(matches!(
            piece.add_block(0, b"toolong"),
            Err(BlockError::Overrun { .. })
        ));
    }

    #[test]
    fn hash_check_matches_content() {
        let mut piece = PieceState::new(0, 2, digest_of(b"ab"));
        piece.add_block(0, b"ab").unwrap();
        assert!(piece.hash_check());
        // Deterministic under repeated calls.
        assert!(piece.hash_check());
    }

    #[test]
    fn hash_check_detects_corruption() {
        let mut piece = PieceState::new(0, 2, digest_of(b"ab"));
        piece.add_block(0, b"ac").unwrap();
        assert!(!piece.hash_check());
    }

    #[test]
    fn reset_restarts_assembly() {
        let mut piece = PieceState::new(0, 2, digest_of(b"ab"));
        piece.add_block(0, b"a").unwrap();
        piece.reset();
        assert_eq!(piece.next_offset(), 0);
        assert_eq!(piece.remaining(), 2);
    }
}
