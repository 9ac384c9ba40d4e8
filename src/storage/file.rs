use super::{Layout, PieceWriter, StorageError};
use crate::torrent::TorrentDescriptor;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Writes the torrent as one flat file.
pub struct FileWriter {
    path: PathBuf,
    file: Mutex<File>,
    layout: Layout,
}

impl FileWriter {
    /// Creates (or truncates) `path` and sizes it to the torrent length.
    /// The file is sparse where the platform allows.
    pub fn create(
        path: impl AsRef<Path>,
        descriptor: &TorrentDescriptor,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(descriptor.total_length())?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            layout: Layout::new(descriptor),
        })
    }

    /// Opens an existing file without discarding its contents, for resuming.
    pub fn open(
        path: impl AsRef<Path>,
        descriptor: &TorrentDescriptor,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() < descriptor.total_length() {
            file.set_len(descriptor.total_length())?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            layout: Layout::new(descriptor),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PieceWriter for FileWriter {
    fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        self.layout.check_piece(index, data)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.layout.offset(index)))?;
        file.write_all(data)?;
        file.sync_data()?;

        trace!("wrote piece {} to {}", index, self.path.display());
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

        let mut buf = vec![0u8; length as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.layout.offset(index) + offset as u64))?;
        file.read_exact(&mut buf)?;
        Ok(Some(Bytes::from(buf)))
    }
}
