//! bitleech - BitTorrent download core
//!
//! Given a [`TorrentDescriptor`] and a [`PieceWriter`], a [`Download`] finds
//! peers through HTTP and UDP trackers, speaks the BEP-3 peer wire protocol,
//! schedules blocks rarest-first with an endgame phase, verifies each piece
//! against its SHA1 and hands verified pieces to the writer.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode decoding for tracker responses
//! - [`torrent`] - The torrent descriptor and piece/block arithmetic
//! - [`peer`] - BEP-3 handshake, message framing, per-peer state
//! - [`tracker`] - BEP-3/15/23 HTTP and UDP announce
//! - [`scheduler`] - Rarest-first block selection and endgame
//! - [`assembler`] - Block reassembly and piece verification
//! - [`storage`] - The piece writer seam, file and memory writers
//! - [`download`] - Swarm coordination for one torrent

pub mod assembler;
pub mod bencode;
pub mod constants;
pub mod download;
pub mod peer;
pub mod scheduler;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use assembler::{verify_piece, AssembledPiece, AssemblyOutcome, PieceAssembler};
pub use bencode::{decode, BencodeError, Value};
pub use download::{
    Download, DownloadConfig, DownloadError, DownloadHandle, DownloadOutcome, Progress,
};
pub use peer::{
    Bitfield, Block, BlockRequest, CloseReason, ConnectionTimeouts, Handshake, Message,
    PeerConnection, PeerError, PeerId, PeerState,
};
pub use scheduler::PieceScheduler;
pub use storage::{FileWriter, MemoryWriter, PieceWriter, StorageError};
pub use torrent::{InfoHash, TorrentDescriptor, TorrentError};
pub use tracker::{
    AnnounceResponse, AnnounceStats, CompactPeer, HttpTracker, Tracker, TrackerError,
    TrackerEvent, UdpTracker,
};
