use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::piece::BlockRequest;

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connection in progress.
    Connecting,
    /// Connected, exchanging the 68-byte handshake.
    Handshaking,
    /// Handshake matched; wire messages flow.
    Exchanging,
    /// Terminal.
    Closed(CloseReason),
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Timeout,
    HandshakeMismatch,
    ProtocolViolation(String),
    Io(String),
    /// The remote side closed the stream.
    RemoteClosed,
    /// Banned after repeated hash failures.
    Banned,
    /// Local shutdown.
    Shutdown,
}

impl From<&PeerError> for CloseReason {
    fn from(err: &PeerError) -> Self {
        match err {
            PeerError::Io(e) => CloseReason::Io(e.to_string()),
            PeerError::HandshakeMismatch => CloseReason::HandshakeMismatch,
            PeerError::ProtocolViolation(msg) => CloseReason::ProtocolViolation(msg.clone()),
            PeerError::Timeout => CloseReason::Timeout,
            PeerError::ConnectionClosed => CloseReason::RemoteClosed,
        }
    }
}

impl From<PeerError> for CloseReason {
    fn from(err: PeerError) -> Self {
        CloseReason::from(&err)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Timeout => f.write_str("timeout"),
            CloseReason::HandshakeMismatch => f.write_str("handshake mismatch"),
            CloseReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::Io(msg) => write!(f, "io error: {}", msg),
            CloseReason::RemoteClosed => f.write_str("closed by peer"),
            CloseReason::Banned => f.write_str("banned"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Per-connection view of a remote peer.
///
/// Owned by the peer's session task; the scheduler only ever sees borrowed
/// snapshots of `remote` and the size of `outstanding`.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Pieces the peer claims to have.
    pub remote: Bitfield,
    /// Requests sent to this peer and not yet answered.
    pub outstanding: HashSet<BlockRequest>,
    pub choking: ChokingState,
    /// Last time any message arrived from the peer.
    pub last_activity: Instant,
    /// Last time a requested block arrived (or the first request went out).
    pub last_block_at: Instant,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl PeerState {
    pub fn new(piece_count: usize) -> Self {
        let now = Instant::now();
        Self {
            remote: Bitfield::new(piece_count),
            outstanding: HashSet::new(),
            choking: ChokingState::default(),
            last_activity: now,
            last_block_at: now,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }

    /// Unchoked by the peer and interested in it.
    pub fn can_request(&self) -> bool {
        !self.choking.peer_choking && self.choking.am_interested
    }

    /// Free request slots under the given pipeline bound.
    pub fn spare_capacity(&self, max_in_flight: usize) -> usize {
        max_in_flight.saturating_sub(self.outstanding.len())
    }

    /// Empties the outstanding set, returning what was in it.
    pub fn take_outstanding(&mut self) -> Vec<BlockRequest> {
        let mut requests: Vec<_> = self.outstanding.drain().collect();
        requests.sort_unstable();
        requests
    }
}
