//! Swarm coordination for one torrent.
//!
//! A [`Download`] dials peers learned from trackers (or handed in directly),
//! runs one session task per connected peer, and stops once every piece is
//! verified and written, the swarm is exhausted, the writer gives up, or
//! [`DownloadHandle::stop`] is called.
//!
//! Sessions share a scheduler that hands out blocks rarest-first and an
//! assembler that collects blocks into pieces. Completed pieces are
//! SHA1-verified before the [`PieceWriter`](crate::storage::PieceWriter) sees
//! them and a `have` is broadcast to every live session.

mod announce;
mod config;
mod context;
mod coordinator;
mod error;
mod session;
mod status;

pub use config::DownloadConfig;
pub use coordinator::{Download, DownloadHandle};
pub use error::DownloadError;
pub use status::{DownloadOutcome, Progress};
