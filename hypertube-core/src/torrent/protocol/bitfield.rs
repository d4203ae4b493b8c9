//! Piece availability bitfield
//!
//! Bit `i` lives in byte `i / 8` at bit `7 - i % 8`, most significant first.

use bytes::Bytes;

/// Set of pieces a remote peer has advertised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    /// Wraps raw bitfield bytes received from a peer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// All-zero bitfield wide enough for `piece_count` pieces.
    pub fn empty(piece_count: usize) -> Self {
        Self(vec![0; piece_count.div_ceil(8)])
    }

    /// Whether the peer has piece `index`; out-of-range indices read false.
    pub fn has_piece(&self, index: usize) -> bool {
        self.0
            .get(index / 8)
            .is_some_and(|&byte| (byte >> (7 - index % 8)) & 1 == 1)
    }

    /// Bitfield received from a peer, padded or cut to `piece_count` pieces.
    pub fn sized(bytes: &[u8], piece_count: usize) -> Self {
        let mut field = bytes.to_vec();
        field.resize(piece_count.div_ceil(8), 0);
        Self(field)
    }

    /// Marks piece `index` as available; indices past the field are ignored.
    pub fn set_piece(&mut self, index: usize) {
        if let Some(byte) = self.0.get_mut(index / 8) {
            *byte |= 1 << (7 - index % 8);
        }
    }

    /// Number of pieces marked available.
    pub fn count(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Raw bytes, suitable for a bitfield message.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }

    /// Width of the field in bits.
    pub fn capacity(&self) -> usize {
        self.0.len() * 8
    }
}
