use thiserror::Error;

use crate::storage::StorageError;

/// Why a download ended without completing.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The writer kept failing on a verified piece.
    #[error("writer failed on piece {piece}: {source}")]
    WriterFailure {
        piece: u32,
        #[source]
        source: StorageError,
    },

    /// No tracker answers and no known peer makes progress.
    #[error("no reachable peers or trackers remain")]
    Exhausted,

    #[error("download stopped")]
    Stopped,

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
