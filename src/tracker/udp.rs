use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng as _;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse, AnnounceStats, TrackerEvent};
use crate::constants::{
    UDP_CONNECTION_ID_LIFETIME, UDP_MAX_ATTEMPTS, UDP_MAX_MISMATCHES, UDP_PROTOCOL_ID,
    UDP_RETRY_BASE,
};

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// A BEP-15 tracker client bound to one tracker address.
///
/// The connection id from the connect exchange is reused until it is older
/// than [`UDP_CONNECTION_ID_LIFETIME`], then fetched again.
pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
    url: String,
    connection: Option<(u64, Instant)>,
    retry_base: Duration,
    max_attempts: u32,
}

impl UdpTracker {
    /// Resolves the tracker host and binds a local socket. No packets are
    /// sent until the first announce.
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let host = parse_udp_url(url)?;
        let addr = lookup_host(host)
            .await?
            .next()
            .ok_or_else(|| TrackerError::Unreachable(format!("{} did not resolve", host)))?;

        let bind: SocketAddr = if addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        Ok(Self {
            socket,
            addr,
            url: url.to_string(),
            connection: None,
            retry_base: UDP_RETRY_BASE,
            max_attempts: UDP_MAX_ATTEMPTS,
        })
    }

    /// Overrides the retransmit schedule: attempt `n` waits `base * 2^n`.
    pub fn with_retry(mut self, base: Duration, max_attempts: u32) -> Self {
        self.retry_base = base;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn announce(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        stats: AnnounceStats,
        event: TrackerEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connection_id().await?;

        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(98);
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        request.extend_from_slice(info_hash);
        request.extend_from_slice(peer_id);
        request.extend_from_slice(&stats.downloaded.to_be_bytes());
        request.extend_from_slice(&stats.left.to_be_bytes());
        request.extend_from_slice(&stats.uploaded.to_be_bytes());
        request.extend_from_slice(&event.as_udp_id().to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes()); // IP address (0 = sender)
        request.extend_from_slice(&key.to_be_bytes());
        request.extend_from_slice(&(-1i32).to_be_bytes()); // num_want (-1 = default)
        request.extend_from_slice(&port.to_be_bytes());

        let response = match self
            .send_and_receive(&request, ACTION_ANNOUNCE, transaction_id, 20)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // a stale id is a common cause; fetch a fresh one next time
                self.connection = None;
                return Err(e);
            }
        };

        let interval = read_u32(&response, 8);
        let leechers = read_u32(&response, 12);
        let seeders = read_u32(&response, 16);

        let packed = &response[20..];
        if packed.len() % 6 != 0 {
            return Err(TrackerError::Protocol(format!(
                "packed peer list is {} bytes",
                packed.len()
            )));
        }

        let mut result = AnnounceResponse::new(interval);
        result.complete = Some(seeders);
        result.incomplete = Some(leechers);
        result.peers = parse_compact_peers(packed);

        debug!(
            "{} ({}): {} peers, interval {}s",
            self.url,
            self.addr,
            result.peers.len(),
            interval
        );
        Ok(result)
    }

    async fn connection_id(&mut self) -> Result<u64, TrackerError> {
        if let Some((id, obtained)) = self.connection {
            if obtained.elapsed() < UDP_CONNECTION_ID_LIFETIME {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self
            .send_and_receive(&request, ACTION_CONNECT, transaction_id, 16)
            .await?;

        let mut id = [0u8; 8];
        id.copy_from_slice(&response[8..16]);
        let id = u64::from_be_bytes(id);

        trace!("{}: connection id {:#x}", self.url, id);
        self.connection = Some((id, Instant::now()));
        Ok(id)
    }

    /// Sends `request` until a response echoing `transaction_id` arrives.
    ///
    /// Responses carrying another transaction id are discarded and the
    /// request resent, at most [`UDP_MAX_MISMATCHES`] times. Silence is
    /// retried with exponential backoff over `max_attempts` attempts.
    async fn send_and_receive(
        &self,
        request: &[u8],
        action: u32,
        transaction_id: u32,
        min_response_size: usize,
    ) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0u8; 2048];
        let mut attempt = 0;
        let mut mismatches = 0;

        while attempt < self.max_attempts {
            self.socket.send(request).await?;

            let wait = self.retry_base * 2u32.saturating_pow(attempt.min(8));
            let n = match timeout(wait, self.socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    trace!("{}: no response within {:?}", self.url, wait);
                    attempt += 1;
                    continue;
                }
            };

            let response = &buf[..n];
            if n < 8 {
                return Err(TrackerError::Protocol("response too short".into()));
            }

            if read_u32(response, 4) != transaction_id {
                mismatches += 1;
                if mismatches > UDP_MAX_MISMATCHES {
                    return Err(TrackerError::Protocol("transaction id mismatch".into()));
                }
                debug!("{}: discarding response with foreign transaction id", self.url);
                continue;
            }

            let got = read_u32(response, 0);
            if got == ACTION_ERROR {
                let message = String::from_utf8_lossy(&response[8..]).into_owned();
                return Err(TrackerError::Rejected(message));
            }
            if got != action {
                return Err(TrackerError::Protocol(format!(
                    "expected action {}, got {}",
                    action, got
                )));
            }
            if n < min_response_size {
                return Err(TrackerError::Protocol("response too short".into()));
            }

            return Ok(response.to_vec());
        }

        Err(TrackerError::Unreachable(format!(
            "{}: no response after {} attempts",
            self.url, self.max_attempts
        )))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Extracts `host:port` from `udp://host:port[/path]`.
fn parse_udp_url(url: &str) -> Result<&str, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() || !host.contains(':') {
        return Err(TrackerError::InvalidUrl(url.to_string()));
    }
    Ok(host)
}
