use super::{Layout, PieceWriter, StorageError};
use crate::torrent::TorrentDescriptor;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Keeps written pieces in memory.
///
/// Useful for small torrents and tests; `fail_writes` makes the next writes
/// fail so that retry handling can be exercised.
pub struct MemoryWriter {
    layout: Layout,
    pieces: Mutex<HashMap<u32, Bytes>>,
    writes: AtomicUsize,
    failures_left: AtomicU32,
}

impl MemoryWriter {
    pub fn new(descriptor: &TorrentDescriptor) -> Self {
        Self {
            layout: Layout::new(descriptor),
            pieces: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            failures_left: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` calls to `write_piece` fail with an I/O error.
    pub fn fail_writes(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn piece(&self, index: u32) -> Option<Bytes> {
        self.pieces.lock().get(&index).cloned()
    }

    /// Number of successful `write_piece` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// All stored pieces concatenated in index order, or `None` while any
    /// piece is missing.
    pub fn contents(&self) -> Option<Vec<u8>> {
        let pieces = self.pieces.lock();
        let mut out = Vec::with_capacity(self.layout.total_length as usize);
        let mut index = 0;
        while self.layout.offset(index) < self.layout.total_length {
            out.extend_from_slice(pieces.get(&index)?);
            index += 1;
        }
        Some(out)
    }
}

impl PieceWriter for MemoryWriter {
    fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        self.layout.check_piece(index, data)?;

        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Io(std::io::Error::other("injected write failure")));
        }

        self.pieces
            .lock()
            .insert(index, Bytes::copy_from_slice(data));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_block(
        &self,
        index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Option<Bytes>, StorageError> {
        if !self.layout.contains(index, offset, length) {
            return Ok(None);
        }
        let start = offset as usize;
        Ok(self
            .pieces
            .lock()
            .get(&index)
            .map(|piece| piece.slice(start..start + length as usize)))
    }
}
