use super::PieceIndex;

/// Per-piece availability vector, one bit per piece index, most-significant
/// bit first, zero-padded to a byte boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    data: Vec<u8>,
}

impl Bitfield {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { data: bytes }
    }

    /// An all-zero bitfield sized for `num_pieces` pieces.
    pub fn with_capacity(num_pieces: usize) -> Self {
        Self {
            data: vec![0u8; num_pieces.div_ceil(8)],
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        let byte_index = index / 8;
        let bit_index = index % 8;

        if byte_index >= self.data.len() {
            return false;
        }

        self.data[byte_index] & (1 << (7 - bit_index)) != 0
    }

    /// No-op when `index` is beyond the vector; padding bits stay zero.
    pub fn set_piece(&mut self, index: usize) {
        let byte_index = index / 8;
        let bit_index = index % 8;

        if byte_index < self.data.len() {
            self.data[byte_index] |= 1 << (7 - bit_index);
        }
    }

    /// Iterates the set piece indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.data.len() * 8)
            .filter(|index| self.has_piece(*index))
            .map(|index| index as PieceIndex)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}
