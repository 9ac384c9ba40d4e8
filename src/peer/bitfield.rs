use bytes::Bytes;

use super::error::PeerError;

/// One bit per piece, `true` meaning the piece is present.
///
/// Bits are numbered from the high bit of the first byte, matching the
/// `bitfield` wire message. The same type describes the local verified set
/// and what a remote peer claims to have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece present.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Parses a `bitfield` message payload.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes and the
    /// spare bits after the last piece must be zero.
    pub fn from_payload(payload: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if payload.len() != expected {
            return Err(PeerError::ProtocolViolation(format!(
                "bitfield length {} (expected {})",
                payload.len(),
                expected
            )));
        }

        let bf = Self {
            bits: payload.to_vec(),
            piece_count,
        };

        let spare = expected * 8 - piece_count;
        if spare > 0 && bf.bits[expected - 1] & ((1u8 << spare) - 1) != 0 {
            return Err(PeerError::ProtocolViolation(
                "bitfield has spare bits set".into(),
            ));
        }

        Ok(bf)
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets the bit; returns `true` if it was previously clear.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count || self.has(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        true
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Number of pieces present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// Indices of present pieces in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has(i))
    }

    /// Whether `self` has at least one piece `ours` lacks.
    pub fn has_any_missing_from(&self, ours: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(ours.bits.iter())
            .any(|(theirs, ours)| theirs & !ours != 0)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            let last = self.bits.len() - 1;
            self.bits[last] &= 0xFFu8 << spare;
        }
    }
}
