//! Reassembly and verification of pieces.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::torrent::TorrentDescriptor;

struct PieceBuffer {
    data: BytesMut,
    received: Vec<bool>,
    remaining: usize,
    contributors: HashSet<SocketAddr>,
}

/// A piece whose every block has arrived, ready to be hashed.
#[derive(Debug, Clone)]
pub struct AssembledPiece {
    pub index: u32,
    pub data: Bytes,
    /// Peers that supplied at least one block.
    pub contributors: Vec<SocketAddr>,
}

impl AssembledPiece {
    /// Checks the bytes against the expected SHA1.
    pub fn verify(&self, expected: &[u8; 20]) -> bool {
        verify_piece(&self.data, expected)
    }
}

#[derive(Debug)]
pub enum AssemblyOutcome {
    /// Out of range, misaligned, or already buffered.
    Ignored,
    Stored,
    Ready(AssembledPiece),
}

/// Per-piece block buffers.
///
/// Blocks may arrive in any order and from any number of peers. A buffer is
/// created by the first block of its piece and handed out, then forgotten,
/// once the last block lands.
pub struct PieceAssembler {
    piece_length: u32,
    total_length: u64,
    block_size: u32,
    buffers: HashMap<u32, PieceBuffer>,
}

impl PieceAssembler {
    pub fn new(descriptor: &TorrentDescriptor, block_size: u32) -> Self {
        Self {
            piece_length: descriptor.piece_length(),
            total_length: descriptor.total_length(),
            block_size: block_size.max(1),
            buffers: HashMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        from: SocketAddr,
        index: u32,
        offset: u32,
        data: &[u8],
    ) -> AssemblyOutcome {
        let Some(piece_len) = self.piece_len(index) else {
            return AssemblyOutcome::Ignored;
        };
        if offset % self.block_size != 0 || offset >= piece_len {
            return AssemblyOutcome::Ignored;
        }
        let block = (offset / self.block_size) as usize;
        let expected = (piece_len - offset).min(self.block_size);
        if data.len() != expected as usize {
            return AssemblyOutcome::Ignored;
        }

        let block_count = piece_len.div_ceil(self.block_size) as usize;
        let buffer = self.buffers.entry(index).or_insert_with(|| PieceBuffer {
            data: BytesMut::zeroed(piece_len as usize),
            received: vec![false; block_count],
            remaining: block_count,
            contributors: HashSet::new(),
        });

        if buffer.received[block] {
            return AssemblyOutcome::Ignored;
        }
        let start = offset as usize;
        buffer.data[start..start + data.len()].copy_from_slice(data);
        buffer.received[block] = true;
        buffer.remaining -= 1;
        buffer.contributors.insert(from);

        if buffer.remaining > 0 {
            return AssemblyOutcome::Stored;
        }

        match self.buffers.remove(&index) {
            Some(buffer) => {
                let mut contributors: Vec<_> = buffer.contributors.into_iter().collect();
                contributors.sort();
                AssemblyOutcome::Ready(AssembledPiece {
                    index,
                    data: buffer.data.freeze(),
                    contributors,
                })
            }
            None => AssemblyOutcome::Stored,
        }
    }

    fn piece_len(&self, index: u32) -> Option<u32> {
        let offset = index as u64 * self.piece_length as u64;
        if offset >= self.total_length {
            return None;
        }
        Some((self.total_length - offset).min(self.piece_length as u64) as u32)
    }
}

pub fn verify_piece(data: &[u8], expected: &[u8; 20]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().as_slice() == expected
}
