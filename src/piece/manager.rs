use std::collections::{BTreeSet, HashMap};

use sha1::{Digest, Sha1};
use tracing::debug;

use super::state::{BlockError, PieceState};
use crate::message::PieceIndex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PopulateError {
    #[error("torrent has no pieces")]
    Empty,
    #[error("uniform piece size must be non-zero")]
    ZeroPieceSize,
    #[error("total size {total} is out of range for {count} pieces of {uniform} bytes")]
    SizeMismatch { total: u64, uniform: u64, count: u64 },
    #[error("manager is already populated")]
    AlreadyPopulated,
}

/// Owns every [`PieceState`] plus the membership sets that drive piece
/// selection.
///
/// Every piece index is a member of exactly one of not-started, in-progress
/// or complete at all times; the three sets partition the torrent.
#[derive(Debug, Default)]
pub struct PieceStateManager {
    pieces: HashMap<PieceIndex, PieceState>,
    not_started: BTreeSet<PieceIndex>,
    in_progress: BTreeSet<PieceIndex>,
    complete: BTreeSet<PieceIndex>,
}

impl PieceStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-time initialisation from the torrent geometry. The final piece
    /// gets `total_size - uniform_size * (count - 1)` bytes, which must be
    /// in `1..=uniform_size`.
    pub fn populate(
        &mut self,
        digests: &[[u8; 20]],
        total_size: u64,
        uniform_size: u64,
    ) -> Result<(), PopulateError> {
        if !self.pieces.is_empty() {
            return Err(PopulateError::AlreadyPopulated);
        }
        let count = digests.len() as u64;
        if count == 0 {
            return Err(PopulateError::Empty);
        }
        if uniform_size == 0 {
            return Err(PopulateError::ZeroPieceSize);
        }

        let body = uniform_size
            .checked_mul(count - 1)
            .ok_or(PopulateError::SizeMismatch {
                total: total_size,
                uniform: uniform_size,
                count,
            })?;
        let final_size = total_size.checked_sub(body).unwrap_or(0);
        if final_size == 0 || final_size > uniform_size {
            return Err(PopulateError::SizeMismatch {
                total: total_size,
                uniform: uniform_size,
                count,
            });
        }

        for (index, digest) in digests.iter().enumerate() {
            let index = index as PieceIndex;
            let size = if u64::from(index) == count - 1 {
                final_size
            } else {
                uniform_size
            };
            self.pieces.insert(index, PieceState::new(index, size, *digest));
            self.not_started.insert(index);
        }
        Ok(())
    }

    /// Resume path: record a piece as already verified on disk. Valid for
    /// not-started pieces only; anything else is ignored.
    pub fn mark_known_complete(&mut self, index: PieceIndex) {
        if self.not_started.remove(&index) {
            self.complete.insert(index);
        }
    }

    pub fn get(&self, index: PieceIndex) -> Option<&PieceState> {
        self.pieces.get(&index)
    }

    pub fn get_mut(&mut self, index: PieceIndex) -> Option<&mut PieceState> {
        self.pieces.get_mut(&index)
    }

    /// Pick the next piece to download from a peer advertising `advertised`:
    /// the lowest not-started index the peer has. The chosen piece moves to
    /// in-progress. Identical inputs always pick the same piece.
    pub fn next_available(&mut self, advertised: &BTreeSet<PieceIndex>) -> Option<PieceIndex> {
        let index = self
            .not_started
            .iter()
            .copied()
            .find(|index| advertised.contains(index))?;
        self.not_started.remove(&index);
        self.in_progress.insert(index);
        Some(index)
    }

    /// Append a block to an in-progress piece.
    pub fn add_block(
        &mut self,
        index: PieceIndex,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), BlockError> {
        match self.pieces.get_mut(&index) {
            Some(piece) => piece.add_block(offset, bytes),
            None => Err(BlockError::UnknownPiece(index)),
        }
    }

    /// Recompute the digest of `data` and compare it against the piece's
    /// expected digest. Pure; same input, same answer.
    pub fn hash_check(&self, index: PieceIndex, data: &[u8]) -> bool {
        let Some(piece) = self.pieces.get(&index) else {
            return false;
        };
        let mut hasher = Sha1::new();
        hasher.update(data);
        let actual: [u8; 20] = hasher.finalize().into();
        actual == *piece.expected_digest()
    }

    /// Transition an in-progress piece to complete. Only valid after a
    /// successful hash check.
    pub fn make_completed(&mut self, index: PieceIndex) {
        if self.in_progress.remove(&index) {
            self.complete.insert(index);
        } else {
            debug!(index, "make_completed on a piece that was not in progress");
        }
    }

    /// Return an in-progress piece to the not-started pool with an empty
    /// buffer, so another peer can supply it from scratch.
    pub fn make_failed(&mut self, index: PieceIndex) {
        if self.in_progress.remove(&index) {
            if let Some(piece) = self.pieces.get_mut(&index) {
                piece.reset();
            }
            self.not_started.insert(index);
        }
    }

    pub fn is_piece_complete(&self, index: PieceIndex) -> bool {
        self.complete.contains(&index)
    }

    pub fn is_torrent_complete(&self) -> bool {
        self.complete.len() == self.pieces.len() && !self.pieces.is_empty()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn completed_count(&self) -> usize {
        self.complete.len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    pub fn completed(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        self.complete.iter().copied()
    }

    /// Bytes not yet received across every unfinished piece. Pieces marked
    /// complete from resume state count as fully received.
    pub fn bytes_remaining(&self) -> u64 {
        self.pieces
            .values()
            .filter(|piece| !self.complete.contains(&piece.index()))
            .map(|piece| piece.remaining())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn digest_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn populated(count: usize, uniform: u64, total: u64) -> PieceStateManager {
        let digests = vec![[0u8; 20]; count];
        let mut manager = PieceStateManager::new();
        manager.populate(&digests, total, uniform).unwrap();
        manager
    }

    #[test]
    fn uniform_and_final_piece_sizes() {
        let manager = populated(3, 100, 250);
        assert_eq!(manager.get(0).unwrap().max_size(), 100);
        assert_eq!(manager.get(1).unwrap().max_size(), 100);
        assert_eq!(manager.get(2).unwrap().max_size(), 50);
    }

    #[test]
    fn exact_multiple_gives_full_final_piece() {
        let manager = populated(3, 100, 300);
        assert_eq!(manager.get(2).unwrap().max_size(), 100);
    }

    #[test]
    fn populate_rejects_impossible_geometry() {
        let digests = vec![[0u8; 20]; 3];
        let mut manager = PieceStateManager::new();
        // Final piece would be zero bytes.
        assert!(matches!(
            manager.populate(&digests, 200, 100),
            Err(PopulateError::SizeMismatch { .. })
        ));
        // Final piece would be oversized.
        let mut manager = PieceStateManager::new();
        assert!(matches!(
            manager.populate(&digests, 500, 100),
            Err(PopulateError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn membership_sets_partition_the_torrent() {
        let mut manager = populated(4, 10, 40);
        let advertised: BTreeSet<_> = [0, 1, 2, 3].into_iter().collect();

        assert_eq!(manager.piece_count(), 4);
        let picked = manager.next_available(&advertised).unwrap();
        assert_eq!(manager.in_progress_count(), 1);

        manager.make_completed(picked);
        assert_eq!(manager.completed_count(), 1);
        assert_eq!(manager.in_progress_count(), 0);
        assert_eq!(manager.bytes_remaining(), 30);

        // A completed piece cannot be picked or failed back into the pool.
        manager.make_failed(picked);
        assert_eq!(manager.completed_count(), 1);
    }

    #[test]
    fn next_available_is_deterministic_lowest_first() {
        let mut first = populated(5, 10, 50);
        let mut second = populated(5, 10, 50);
        let advertised: BTreeSet<_> = [3, 1, 4].into_iter().collect();

        assert_eq!(first.next_available(&advertised), Some(1));
        assert_eq!(second.next_available(&advertised), Some(1));
        assert_eq!(first.next_available(&advertised), Some(3));
        assert_eq!(first.next_available(&advertised), Some(4));
        assert_eq!(first.next_available(&advertised), None);
    }

    #[test]
    fn next_available_skips_complete_pieces() {
        let mut manager = populated(3, 10, 30);
        manager.mark_known_complete(0);
        let advertised: BTreeSet<_> = [0, 1].into_iter().collect();
        assert_eq!(manager.next_available(&advertised), Some(1));
    }

    #[test]
    fn failed_piece_returns_to_pool_empty() {
        let mut manager = populated(2, 4, 8);
        let advertised: BTreeSet<_> = [0].into_iter().collect();
        let picked = manager.next_available(&advertised).unwrap();
        manager.add_block(picked, 0, b"ab").unwrap();

        manager.make_failed(picked);
        assert_eq!(manager.get(picked).unwrap().next_offset(), 0);
        // Eligible for selection again.
        assert_eq!(manager.next_available(&advertised), Some(picked));
    }

    #[test]
    fn hash_check_uses_stored_digest() {
        let digests = vec![digest_of(b"ab")];
        let mut manager = PieceStateManager::new();
        manager.populate(&digests, 2, 2).unwrap();
        assert!(manager.hash_check(0, b"ab"));
        assert!(!manager.hash_check(0, b"ac"));
        assert!(!manager.hash_check(99, b"ab"));
    }

    #[test]
    fn torrent_complete_when_every_piece_is() {
        let mut manager = populated(2, 10, 20);
        assert!(!manager.is_torrent_complete());
        manager.mark_known_complete(0);
        manager.mark_known_complete(1);
        assert!(manager.is_torrent_complete());
    }
}
