//! Persistence of verified pieces.
//!
//! The download core hands every verified piece to a [`PieceWriter`] and
//! only marks the piece complete once the writer acknowledges it. Mapping a
//! flat piece offset onto the files of a multi-file torrent is the writer's
//! business.
//!
//! - [`FileWriter`] - single flat file, piece `i` at `i * piece_length`
//! - [`MemoryWriter`] - keeps pieces in memory
//!
//! # Examples
//!
//! ```no_run
//! use bitleech::storage::{FileWriter, PieceWriter};
//! use bitleech::torrent::{InfoHash, TorrentDescriptor};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let descriptor = TorrentDescriptor::new(
//!     InfoHash([0u8; 20]),
//!     1000,
//!     512,
//!     vec![[0u8; 20]; 2],
//!     vec![],
//! )?;
//!
//! let writer = FileWriter::create("./download.bin", &descriptor)?;
//! writer.write_piece(1, &[0u8; 488])?;
//! # Ok(())
//! # }
//! ```

mod error;
mod file;
mod memory;

pub use error::StorageError;
pub use file::FileWriter;
pub use memory::MemoryWriter;

use bytes::Bytes;

/// The persisted-bytes collaborator.
///
/// Implementations are called from blocking threads and must be safe to
/// call concurrently for different pieces.
pub trait PieceWriter: Send + Sync {
    /// Durably stores a whole verified piece. Returning `Ok` is the
    /// acknowledgment that lets the piece be marked complete.
    fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Reads back part of a stored piece to serve a peer's request.
    ///
    /// `Ok(None)` means the writer cannot serve reads, or the range is not
    /// stored.
    fn read_block(
        &self,
        _index: u32,
        _offset: u32,
        _length: u32,
    ) -> Result<Option<Bytes>, StorageError> {
        Ok(None)
    }
}

/// Piece boundaries shared by the bundled writers.
#[derive(Debug, Clone, Copy)]
struct Layout {
    piece_length: u32,
    total_length: u64,
}

impl Layout {
    fn new(descriptor: &crate::torrent::TorrentDescriptor) -> Self {
        Self {
            piece_length: descriptor.piece_length(),
            total_length: descriptor.total_length(),
        }
    }

    fn offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    fn piece_len(&self, index: u32) -> Result<u32, StorageError> {
        let offset = self.offset(index);
        if offset >= self.total_length {
            return Err(StorageError::InvalidPieceIndex(index));
        }
        Ok((self.total_length - offset).min(self.piece_length as u64) as u32)
    }

    fn check_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        let expected = self.piece_len(index)?;
        if data.len() != expected as usize {
            return Err(StorageError::LengthMismatch {
                piece: index,
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }

    /// Whether `offset..offset + length` lies inside piece `index`.
    fn contains(&self, index: u32, offset: u32, length: u32) -> bool {
        match self.piece_len(index) {
            Ok(len) => length > 0 && offset as u64 + length as u64 <= len as u64,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests;
