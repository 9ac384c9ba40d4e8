use std::time::Duration;

use super::error::DownloadError;
use crate::constants::*;
use crate::peer::{ConnectionTimeouts, PeerId};

/// Tuning for one download.
///
/// `Default` takes every value from [`crate::constants`] and a fresh
/// random peer id.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub peer_id: PeerId,
    /// Port reported to trackers.
    pub listen_port: u16,
    /// Target number of concurrent peer sessions.
    pub max_peers: usize,
    /// Outstanding block requests per peer.
    pub max_in_flight: usize,
    pub block_size: u32,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Silence after which a peer is dropped.
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    /// How long a peer may hold requests without delivering a block.
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub announce_retry_base: Duration,
    pub announce_retry_cap: Duration,
    pub udp_retry_base: Duration,
    pub udp_max_attempts: u32,
    pub final_announce_timeout: Duration,
    /// Consecutive fruitless passes over all known peers before giving up.
    pub max_idle_passes: u32,
    /// Longest a pass lasts while sessions stay open. Sessions that keep us
    /// choked or have nothing we need never close on their own.
    pub stall_timeout: Duration,
    /// Hash failures a peer may contribute to before it is banned.
    /// `None` never bans.
    pub ban_after_hash_failures: Option<u32>,
    pub writer_attempts: u32,
    /// Interested peers we unchoke at once.
    pub upload_slots: usize,
    pub housekeeping_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::generate(),
            listen_port: DEFAULT_PORT,
            max_peers: MAX_PEERS_PER_TORRENT,
            max_in_flight: MAX_REQUESTS_PER_PEER,
            block_size: BLOCK_SIZE,
            connect_timeout: CONNECTION_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: PEER_IDLE_TIMEOUT,
            write_timeout: PEER_WRITE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            announce_retry_base: ANNOUNCE_RETRY_BASE,
            announce_retry_cap: ANNOUNCE_RETRY_CAP,
            udp_retry_base: UDP_RETRY_BASE,
            udp_max_attempts: UDP_MAX_ATTEMPTS,
            final_announce_timeout: FINAL_ANNOUNCE_TIMEOUT,
            max_idle_passes: MAX_IDLE_PASSES,
            stall_timeout: STALL_TIMEOUT,
            ban_after_hash_failures: Some(BAN_AFTER_HASH_FAILURES),
            writer_attempts: WRITER_ATTEMPTS,
            upload_slots: UPLOAD_SLOTS,
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
        }
    }
}

impl DownloadConfig {
    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_announce_retry(mut self, base: Duration, cap: Duration) -> Self {
        self.announce_retry_base = base;
        self.announce_retry_cap = cap;
        self
    }

    pub fn with_udp_retry(mut self, base: Duration, max_attempts: u32) -> Self {
        self.udp_retry_base = base;
        self.udp_max_attempts = max_attempts;
        self
    }

    pub fn with_max_idle_passes(mut self, passes: u32) -> Self {
        self.max_idle_passes = passes;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_ban_after_hash_failures(mut self, threshold: Option<u32>) -> Self {
        self.ban_after_hash_failures = threshold;
        self
    }

    pub fn with_writer_attempts(mut self, attempts: u32) -> Self {
        self.writer_attempts = attempts;
        self
    }

    pub fn with_upload_slots(mut self, slots: usize) -> Self {
        self.upload_slots = slots;
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            connect: self.connect_timeout,
            handshake: self.handshake_timeout,
            write: self.write_timeout,
        }
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        let invalid = |msg: &str| Err(DownloadError::InvalidConfig(msg.to_string()));

        if self.block_size == 0 || self.block_size > MAX_REQUEST_LENGTH {
            return invalid("block size must be between 1 byte and 128 KiB");
        }
        if self.max_peers == 0 {
            return invalid("max peers must be non-zero");
        }
        if self.max_in_flight == 0 {
            return invalid("max in flight must be non-zero");
        }
        if self.writer_attempts == 0 {
            return invalid("writer attempts must be non-zero");
        }
        if self.max_idle_passes == 0 {
            return invalid("max idle passes must be non-zero");
        }
        if self.ban_after_hash_failures == Some(0) {
            return invalid("ban threshold must be non-zero");
        }
        if self.housekeeping_interval.is_zero()
            || self.keepalive_interval.is_zero()
            || self.idle_timeout.is_zero()
            || self.stall_timeout.is_zero()
        {
            return invalid("intervals must be non-zero");
        }
        Ok(())
    }
}
