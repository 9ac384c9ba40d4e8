//! Protocol constants and tuning defaults.
//!
//! Wire-format values are fixed by BEP-3 and BEP-15. The tuning values are
//! the defaults used by [`DownloadConfig`](crate::download::DownloadConfig)
//! and can be overridden per download.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-BL0001-";

/// Default BitTorrent listen port
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Wire protocol
// ============================================================================

/// Protocol name sent in the handshake
pub const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// Total handshake length: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Requests for more than this are ignored when serving (BEP-3 guidance, 128KB)
pub const MAX_REQUEST_LENGTH: u32 = 131_072;

/// Largest frame we accept from a peer. A piece message carrying a maximal
/// block plus header is far below this.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

// ============================================================================
// UDP tracker (BEP-15)
// ============================================================================

/// Magic constant identifying a UDP tracker connect request
pub const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// A connection id is valid for one minute after it was issued
pub const UDP_CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);

/// First retry timeout; attempt `n` waits `base * 2^n`
pub const UDP_RETRY_BASE: Duration = Duration::from_secs(15);

/// Number of send attempts before giving up on a UDP request
pub const UDP_MAX_ATTEMPTS: u32 = 4;

/// Transaction id mismatches tolerated before the response is declared bogus
pub const UDP_MAX_MISMATCHES: u32 = 4;

// ============================================================================
// Connection limits
// ============================================================================

/// Target number of concurrently connected peers
pub const MAX_PEERS_PER_TORRENT: usize = 30;

/// Maximum outstanding block requests per peer
pub const MAX_REQUESTS_PER_PEER: usize = 16;

/// Peers we keep unchoked for uploads
pub const UPLOAD_SLOTS: usize = 4;

// ============================================================================
// Timeouts - Peers
// ============================================================================

/// TCP connection timeout
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake timeout after TCP connect
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer that sends nothing (not even a keep-alive) for this long is dropped
pub const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(150);

/// Per-write timeout
pub const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Close a peer holding outstanding requests that delivers nothing for this long
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Keep-alive is sent when we have been silent this long
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

// ============================================================================
// Timeouts - Tracker
// ============================================================================

/// HTTP tracker request timeout
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Base delay before retrying a failed announce round
pub const ANNOUNCE_RETRY_BASE: Duration = Duration::from_secs(15);

/// Upper bound for announce retry backoff
pub const ANNOUNCE_RETRY_CAP: Duration = Duration::from_secs(30 * 60);

/// Used when a tracker answers with a zero interval
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Bound for the best-effort `completed`/`stopped` announce during shutdown
pub const FINAL_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Coordinator
// ============================================================================

/// Housekeeping cadence (pool refill, stall detection)
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive no-progress passes over all known peers before giving up
pub const MAX_IDLE_PASSES: u32 = 3;

/// A pass whose sessions are still open ends after this long
pub const STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Hash mismatch contributions after which a peer is banned
pub const BAN_AFTER_HASH_FAILURES: u32 = 3;

/// Attempts at persisting a verified piece
pub const WRITER_ATTEMPTS: u32 = 3;

/// Base backoff between writer attempts
pub const WRITER_RETRY_BASE: Duration = Duration::from_millis(100);
