//! The in-memory torrent descriptor consumed by the download core.
//!
//! Parsing `.torrent` files is left to the caller; this module only holds the
//! pieces of metadata the core needs and the piece/block arithmetic derived
//! from them.

use std::fmt;

use thiserror::Error;

/// Errors raised while validating a [`TorrentDescriptor`].
#[derive(Debug, Error)]
pub enum TorrentError {
    /// The piece length is zero.
    #[error("piece length must be non-zero")]
    ZeroPieceLength,

    /// The total length is zero.
    #[error("total length must be non-zero")]
    ZeroLength,

    /// The number of piece hashes does not match the piece layout.
    #[error("expected {expected} piece hashes, got {actual}")]
    PieceCountMismatch { expected: usize, actual: usize },

    /// A hex info hash could not be decoded.
    #[error("invalid info hash")]
    InvalidInfoHash,
}

/// The 20-byte SHA1 of a torrent's info dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_hex(s: &str) -> Result<Self, TorrentError> {
        if s.len() != 40 || !s.is_ascii() {
            return Err(TorrentError::InvalidInfoHash);
        }
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| TorrentError::InvalidInfoHash)?;
        }
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().fold(String::with_capacity(40), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Immutable description of the content being downloaded.
///
/// Pieces are `piece_length` bytes except the last, which holds the remainder
/// of `total_length`. Piece `i` is verified against `piece_hashes[i]`.
///
/// # Examples
///
/// ```
/// use bitleech::torrent::{InfoHash, TorrentDescriptor};
///
/// let descriptor = TorrentDescriptor::new(
///     InfoHash([0u8; 20]),
///     3 * 16384 + 10240,
///     16384,
///     vec![[0u8; 20]; 4],
///     vec!["http://tracker.example.com/announce".into()],
/// )
/// .unwrap();
///
/// assert_eq!(descriptor.piece_count(), 4);
/// assert_eq!(descriptor.piece_len(3), 10240);
/// ```
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    info_hash: InfoHash,
    total_length: u64,
    piece_length: u32,
    piece_hashes: Vec<[u8; 20]>,
    announce_urls: Vec<String>,
}

impl TorrentDescriptor {
    pub fn new(
        info_hash: InfoHash,
        total_length: u64,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        announce_urls: Vec<String>,
    ) -> Result<Self, TorrentError> {
        if piece_length == 0 {
            return Err(TorrentError::ZeroPieceLength);
        }
        if total_length == 0 {
            return Err(TorrentError::ZeroLength);
        }

        let expected = total_length.div_ceil(piece_length as u64) as usize;
        if piece_hashes.len() != expected {
            return Err(TorrentError::PieceCountMismatch {
                expected,
                actual: piece_hashes.len(),
            });
        }

        Ok(Self {
            info_hash,
            total_length,
            piece_length,
            piece_hashes,
            announce_urls,
        })
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn announce_urls(&self) -> &[String] {
        &self.announce_urls
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    /// Byte offset of the piece within the flat content.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Length of the given piece; only the last piece may be short.
    /// Out-of-range indexes have length zero.
    pub fn piece_len(&self, index: u32) -> u32 {
        let count = self.piece_count() as u32;
        if index >= count {
            return 0;
        }
        if index + 1 < count {
            return self.piece_length;
        }
        (self.total_length - self.piece_offset(index)) as u32
    }

    pub fn block_count(&self, index: u32, block_size: u32) -> u32 {
        self.piece_len(index).div_ceil(block_size)
    }

    /// Length of block `block` of piece `index`; the final block is sized to
    /// the remainder of the piece.
    pub fn block_len(&self, index: u32, block: u32, block_size: u32) -> u32 {
        let piece_len = self.piece_len(index);
        let begin = block.saturating_mul(block_size);
        piece_len.saturating_sub(begin).min(block_size)
    }

    /// Bytes outstanding given how many bytes are already complete.
    pub fn left(&self, completed: u64) -> u64 {
        self.total_length.saturating_sub(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(total: u64, piece_length: u32) -> TorrentDescriptor {
        let count = total.div_ceil(piece_length as u64) as usize;
        TorrentDescriptor::new(
            InfoHash([7u8; 20]),
            total,
            piece_length,
            vec![[0u8; 20]; count],
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_piece_count_is_ceiling() {
        for (total, plen) in [(1u64, 16384u32), (16384, 16384), (16385, 16384), (59392, 16384)] {
            let d = descriptor(total, plen);
            assert_eq!(d.piece_count() as u64, total.div_ceil(plen as u64));
        }
    }

    #[test]
    fn test_last_piece_length() {
        let d = descriptor(3 * 16384 + 10240, 16384);
        assert_eq!(d.piece_count(), 4);
        assert_eq!(d.piece_len(0), 16384);
        assert_eq!(d.piece_len(2), 16384);
        assert_eq!(
            d.piece_len(3) as u64,
            d.total_length() - d.piece_length() as u64 * (d.piece_count() as u64 - 1)
        );
        assert_eq!(d.piece_len(4), 0);

        let exact = descriptor(2 * 16384, 16384);
        assert_eq!(exact.piece_len(1), 16384);
    }

    #[test]
    fn test_block_layout() {
        let d = descriptor(40000 + 32768, 40000);
        assert_eq!(d.block_count(0, 16384), 3);
        assert_eq!(d.block_len(0, 0, 16384), 16384);
        assert_eq!(d.block_len(0, 2, 16384), 40000 - 32768);
        assert_eq!(d.block_len(0, 3, 16384), 0);
        assert_eq!(d.block_count(1, 16384), 2);
        assert_eq!(d.block_len(1, 1, 16384), 16384);
    }

    #[test]
    fn test_rejects_bad_layout() {
        let err = TorrentDescriptor::new(InfoHash([0; 20]), 100, 10, vec![[0; 20]; 9], Vec::new());
        assert!(matches!(
            err,
            Err(TorrentError::PieceCountMismatch {
                expected: 10,
                actual: 9
            })
        ));
        assert!(TorrentDescriptor::new(InfoHash([0; 20]), 100, 0, vec![], Vec::new()).is_err());
        assert!(TorrentDescriptor::new(InfoHash([0; 20]), 0, 10, vec![], Vec::new()).is_err());
    }

    #[test]
    fn test_info_hash_hex() {
        let hex = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
        let hash = InfoHash::from_hex(hex).unwrap();
        assert_eq!(hash.to_hex(), hex);
        assert_eq!(hash.0[0], 0xc1);
        assert!(InfoHash::from_hex("abc").is_err());
        assert!(InfoHash::from_hex(&"zz".repeat(20)).is_err());
    }
}
