use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, trace, warn};

use super::config::DownloadConfig;
use super::status::Progress;
use crate::assembler::{AssembledPiece, AssemblyOutcome, PieceAssembler};
use crate::constants::WRITER_RETRY_BASE;
use crate::peer::{Bitfield, Block, BlockRequest, CloseReason};
use crate::scheduler::PieceScheduler;
use crate::storage::{PieceWriter, StorageError};
use crate::torrent::TorrentDescriptor;
use crate::tracker::AnnounceStats;

/// Instructions from the swarm to one peer session.
#[derive(Debug, Clone)]
pub(crate) enum PeerCommand {
    /// Announce a newly verified piece.
    Have(u32),
    /// Withdraw a request another peer already answered.
    Cancel(BlockRequest),
    Close(CloseReason),
}

/// Reports from sessions to the coordinator.
#[derive(Debug)]
pub(crate) enum SwarmEvent {
    PieceCompleted(u32),
    HashMismatch { index: u32, peers: Vec<SocketAddr> },
    WriterFailed { index: u32, error: StorageError },
}

/// State shared by every session of one download.
///
/// The scheduler and the assembler sit behind separate locks that are never
/// held together, and never across an await point.
pub(crate) struct SwarmContext {
    pub descriptor: TorrentDescriptor,
    pub config: DownloadConfig,
    pub scheduler: Mutex<PieceScheduler>,
    assembler: Mutex<PieceAssembler>,
    writer: Arc<dyn PieceWriter>,
    peers: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<PeerCommand>>>,
    events: mpsc::UnboundedSender<SwarmEvent>,
    upload_slots: Arc<Semaphore>,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl SwarmContext {
    pub fn new(
        descriptor: TorrentDescriptor,
        config: DownloadConfig,
        writer: Arc<dyn PieceWriter>,
        events: mpsc::UnboundedSender<SwarmEvent>,
    ) -> Self {
        let scheduler = PieceScheduler::new(&descriptor, config.block_size);
        let assembler = PieceAssembler::new(&descriptor, config.block_size);
        let upload_slots = Arc::new(Semaphore::new(config.upload_slots));

        Self {
            descriptor,
            config,
            scheduler: Mutex::new(scheduler),
            assembler: Mutex::new(assembler),
            writer,
            peers: Mutex::new(HashMap::new()),
            events,
            upload_slots,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        }
    }

    /// Adds a live session to the registry and returns its command inbox.
    pub fn register(&self, addr: SocketAddr) -> mpsc::UnboundedReceiver<PeerCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(addr, tx);
        rx
    }

    pub fn unregister(&self, addr: SocketAddr) {
        self.peers.lock().remove(&addr);
    }

    pub fn send_to(&self, addr: SocketAddr, command: PeerCommand) {
        if let Some(tx) = self.peers.lock().get(&addr) {
            let _ = tx.send(command);
        }
    }

    pub fn broadcast(&self, command: PeerCommand) {
        for tx in self.peers.lock().values() {
            let _ = tx.send(command.clone());
        }
    }

    pub fn active_peers(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn try_upload_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.upload_slots).try_acquire_owned().ok()
    }

    pub fn have(&self) -> Bitfield {
        self.scheduler.lock().have().clone()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.scheduler.lock().have().has(index as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.scheduler.lock().is_complete()
    }

    pub fn mark_verified(&self, verified: &Bitfield) {
        let mut scheduler = self.scheduler.lock();
        for index in verified.iter_set() {
            scheduler.mark_verified(index as u32);
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> Progress {
        let (pieces_completed, bytes_completed) = {
            let scheduler = self.scheduler.lock();
            (scheduler.have().count(), scheduler.bytes_completed())
        };

        Progress {
            pieces_completed,
            pieces_total: self.descriptor.piece_count(),
            bytes_completed,
            bytes_total: self.descriptor.total_length(),
            active_peers: self.active_peers(),
            downloaded: self.downloaded(),
            uploaded: self.uploaded.load(Ordering::Relaxed),
        }
    }

    pub fn announce_stats(&self) -> AnnounceStats {
        let completed = self.scheduler.lock().bytes_completed();
        AnnounceStats {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded(),
            left: self.descriptor.left(completed),
        }
    }

    /// Takes a block that `from` delivered. Completing a piece verifies and
    /// persists it before returning; duplicates and late blocks are dropped.
    pub async fn on_block(&self, from: SocketAddr, block: Block) {
        self.downloaded
            .fetch_add(block.data.len() as u64, Ordering::Relaxed);

        let receipt = self
            .scheduler
            .lock()
            .block_received(from, &block.request());
        for (peer, request) in receipt.cancel {
            self.send_to(peer, PeerCommand::Cancel(request));
        }
        if !receipt.accepted {
            trace!("{}: ignoring block {:?}", from, block.request());
            return;
        }

        let outcome = self
            .assembler
            .lock()
            .insert(from, block.piece, block.offset, &block.data);
        if let AssemblyOutcome::Ready(piece) = outcome {
            self.complete_piece(piece).await;
        }
    }

    async fn complete_piece(&self, piece: AssembledPiece) {
        let index = piece.index;
        let Some(expected) = self.descriptor.piece_hash(index).copied() else {
            return;
        };

        let checked = tokio::task::spawn_blocking(move || {
            let verified = piece.verify(&expected);
            (piece, verified)
        })
        .await;
        let Some(piece) = self.settle_hash(index, checked) else {
            return;
        };

        match self.persist(index, piece.data).await {
            Ok(()) => {
                let cancels = self.scheduler.lock().piece_verified(index);
                for (peer, request) in cancels {
                    self.send_to(peer, PeerCommand::Cancel(request));
                }
                debug!("piece {} verified and stored", index);
                self.broadcast(PeerCommand::Have(index));
                let _ = self.events.send(SwarmEvent::PieceCompleted(index));
            }
            Err(error) => {
                self.scheduler.lock().piece_failed(index);
                let _ = self.events.send(SwarmEvent::WriterFailed { index, error });
            }
        }
    }

    /// Returns the piece if it hashed correctly. Otherwise its blocks go back
    /// to the scheduler, and only an actual mismatch is blamed on the
    /// contributors.
    fn settle_hash(
        &self,
        index: u32,
        checked: Result<(AssembledPiece, bool), JoinError>,
    ) -> Option<AssembledPiece> {
        match checked {
            Ok((piece, true)) => Some(piece),
            Ok((piece, false)) => {
                warn!(
                    "piece {} failed hash check (from {:?})",
                    index, piece.contributors
                );
                self.scheduler.lock().piece_failed(index);
                let _ = self.events.send(SwarmEvent::HashMismatch {
                    index,
                    peers: piece.contributors,
                });
                None
            }
            Err(e) => {
                warn!("hashing piece {} did not finish: {}", index, e);
                self.scheduler.lock().piece_failed(index);
                None
            }
        }
    }

    /// Hands a verified piece to the writer, retrying with backoff.
    async fn persist(&self, index: u32, data: Bytes) -> Result<(), StorageError> {
        let mut attempt = 0;
        loop {
            let writer = Arc::clone(&self.writer);
            let piece = data.clone();
            let result = tokio::task::spawn_blocking(move || writer.write_piece(index, &piece))
                .await
                .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.config.writer_attempts => {
                    let delay = WRITER_RETRY_BASE * 2u32.saturating_pow(attempt);
                    warn!(
                        "writing piece {} failed ({}), retrying in {:?}",
                        index, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("writing piece {} failed for good: {}", index, e);
                    return Err(e);
                }
            }
        }
    }

    /// Reads a block of a verified piece for upload. `None` if the writer
    /// cannot serve it.
    pub async fn read_block(&self, index: u32, offset: u32, length: u32) -> Option<Bytes> {
        let writer = Arc::clone(&self.writer);
        let result =
            tokio::task::spawn_blocking(move || writer.read_block(index, offset, length)).await;

        match result {
            Ok(Ok(Some(data))) if data.len() == length as usize => {
                self.uploaded.fetch_add(length as u64, Ordering::Relaxed);
                Some(data)
            }
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                debug!("reading piece {} for upload failed: {}", index, e);
                None
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryWriter;
    use crate::torrent::InfoHash;
    use bytes::Bytes;

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn setup() -> (SwarmContext, mpsc::UnboundedReceiver<SwarmEvent>) {
        let descriptor = TorrentDescriptor::new(
            InfoHash([3u8; 20]),
            32768,
            16384,
            vec![[0u8; 20]; 2],
            Vec::new(),
        )
        .unwrap();
        let writer = Arc::new(MemoryWriter::new(&descriptor));
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SwarmContext::new(descriptor, DownloadConfig::default(), writer, tx);
        (ctx, rx)
    }

    fn assembled(index: u32) -> AssembledPiece {
        AssembledPiece {
            index,
            data: Bytes::from(vec![0u8; 16384]),
            contributors: vec![peer(1), peer(2)],
        }
    }

    /// Requests every block of piece 0 from `peer(1)`, as a session would.
    fn request_all(ctx: &SwarmContext) -> usize {
        let remote = Bitfield::full(2);
        let mut scheduler = ctx.scheduler.lock();
        scheduler.add_availability(&remote);
        scheduler.next_requests(peer(1), &remote, 0, 16).len()
    }

    #[tokio::test]
    async fn test_interrupted_hashing_requeues_without_blame() {
        let (ctx, mut events) = setup();
        assert_eq!(request_all(&ctx), 2);

        let join_error = tokio::spawn(async { panic!("hasher died") })
            .await
            .unwrap_err();
        assert!(ctx.settle_hash(0, Err(join_error)).is_none());

        assert!(events.try_recv().is_err());
        assert!(!ctx.has_piece(0));
        // piece 0 is assignable again
        let remote = Bitfield::full(2);
        let again = ctx.scheduler.lock().next_requests(peer(3), &remote, 0, 16);
        assert!(again.iter().any(|r| r.piece == 0));
    }

    #[tokio::test]
    async fn test_hash_mismatch_blames_contributors() {
        let (ctx, mut events) = setup();
        request_all(&ctx);

        assert!(ctx.settle_hash(0, Ok((assembled(0), false))).is_none());
        match events.try_recv() {
            Ok(SwarmEvent::HashMismatch { index, peers }) => {
                assert_eq!(index, 0);
                assert_eq!(peers, vec![peer(1), peer(2)]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let piece = ctx.settle_hash(1, Ok((assembled(1), true))).unwrap();
        assert_eq!(piece.index, 1);
        assert!(events.try_recv().is_err());
    }
}
