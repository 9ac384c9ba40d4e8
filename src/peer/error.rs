use thiserror::Error;

/// Errors that end a peer session.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer answered the handshake for a different torrent.
    #[error("info hash mismatch")]
    HandshakeMismatch,

    /// Malformed handshake, frame or payload.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connect, handshake, read or write exceeded its time bound.
    #[error("timeout")]
    Timeout,

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,
}
