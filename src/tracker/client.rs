use super::error::TrackerError;
use super::http::HttpTracker;
use super::response::{AnnounceResponse, AnnounceStats, TrackerEvent};
use super::udp::UdpTracker;
use crate::constants::{UDP_MAX_ATTEMPTS, UDP_RETRY_BASE};
use crate::peer::PeerId;
use crate::torrent::TorrentDescriptor;
use std::time::Duration;

/// An announce endpoint of either flavor, chosen by URL scheme.
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub async fn from_url(url: &str) -> Result<Self, TrackerError> {
        Self::with_udp_retry(url, UDP_RETRY_BASE, UDP_MAX_ATTEMPTS).await
    }

    /// Like [`Tracker::from_url`]; a UDP tracker uses the given retransmit
    /// schedule.
    pub async fn with_udp_retry(
        url: &str,
        retry_base: Duration,
        max_attempts: u32,
    ) -> Result<Self, TrackerError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Tracker::Http(HttpTracker::new(url)?))
        } else if url.starts_with("udp://") {
            let tracker = UdpTracker::connect(url).await?;
            Ok(Tracker::Udp(tracker.with_retry(retry_base, max_attempts)))
        } else {
            let scheme = url.split("://").next().unwrap_or(url);
            Err(TrackerError::UnsupportedProtocol(scheme.to_string()))
        }
    }

    /// Announces once. Re-announcing on the returned interval is up to the
    /// caller.
    pub async fn announce(
        &mut self,
        descriptor: &TorrentDescriptor,
        peer_id: &PeerId,
        port: u16,
        stats: AnnounceStats,
        event: TrackerEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        let info_hash = descriptor.info_hash().as_bytes();
        match self {
            Tracker::Http(t) => {
                t.announce(info_hash, peer_id.as_bytes(), port, stats, event)
                    .await
            }
            Tracker::Udp(t) => {
                t.announce(info_hash, peer_id.as_bytes(), port, stats, event)
                    .await
            }
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(t) => t.url(),
            Tracker::Udp(t) => t.url(),
        }
    }
}
