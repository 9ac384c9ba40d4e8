use super::error::DownloadError;

/// A point-in-time view of a running download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub pieces_completed: usize,
    pub pieces_total: usize,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    /// Peers past the handshake.
    pub active_peers: usize,
    /// Payload bytes received, including discarded duplicates and
    /// corrupt pieces.
    pub downloaded: u64,
    pub uploaded: u64,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.pieces_total > 0 && self.pieces_completed == self.pieces_total
    }
}

/// Terminal state of [`Download::run`](super::Download::run).
#[derive(Debug)]
pub enum DownloadOutcome {
    Completed,
    Failed(DownloadError),
}

impl DownloadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DownloadOutcome::Completed)
    }
}
