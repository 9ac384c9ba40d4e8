use super::error::TrackerError;
use super::response::{
    parse_compact_peers, parse_compact_peers6, AnnounceResponse, AnnounceStats, TrackerEvent,
};
use crate::bencode::{decode, Value};
use crate::constants::HTTP_TRACKER_TIMEOUT;
use reqwest::Client;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        Self::with_timeout(url, HTTP_TRACKER_TIMEOUT)
    }

    /// Like [`HttpTracker::new`] with an explicit per-request time bound.
    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::InvalidUrl(format!("{}: {}", url, e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn announce(
        &self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        stats: AnnounceStats,
        event: TrackerEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = self.announce_url(info_hash, peer_id, port, stats, event);
        debug!("announcing to {} ({:?})", self.url, event);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Unreachable(format!("http status {}", status)));
        }

        let bytes = response.bytes().await?;
        let parsed = parse_announce_response(&bytes)?;

        if let Some(warning) = &parsed.warning_message {
            warn!("tracker {} warns: {}", self.url, warning);
        }
        Ok(parsed)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn announce_url(
        &self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        stats: AnnounceStats,
        event: TrackerEvent,
    ) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            separator,
            url_encode(info_hash),
            url_encode(peer_id),
            port,
            stats.uploaded,
            stats.downloaded,
            stats.left
        );

        let event_str = event.as_str();
        if !event_str.is_empty() {
            url.push_str("&event=");
            url.push_str(event_str);
        }
        url
    }
}

/// Decodes a bencoded announce response body.
///
/// `peers` may be either the compact byte string or a list of
/// `{ip, port}` dictionaries; a `failure reason` short-circuits to
/// [`TrackerError::Rejected`].
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    if value.as_dict().is_none() {
        return Err(TrackerError::Protocol("expected dict".into()));
    }

    if let Some(failure) = value.get(b"failure reason") {
        let reason = failure
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        return Err(TrackerError::Rejected(reason));
    }

    let interval = value
        .get(b"interval")
        .and_then(Value::as_integer)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| TrackerError::Protocol("missing interval".into()))?;

    let mut response = AnnounceResponse::new(interval);

    let counter = |key: &[u8]| {
        value
            .get(key)
            .and_then(Value::as_integer)
            .and_then(|v| u32::try_from(v).ok())
    };
    response.min_interval = counter(b"min interval");
    response.complete = counter(b"complete");
    response.incomplete = counter(b"incomplete");

    response.warning_message = value
        .get(b"warning message")
        .and_then(Value::as_str)
        .map(String::from);

    response.tracker_id = value
        .get(b"tracker id")
        .and_then(Value::as_str)
        .map(String::from);

    match value.get(b"peers") {
        Some(Value::Bytes(bytes)) => {
            if bytes.len() % 6 != 0 {
                return Err(TrackerError::Protocol(format!(
                    "compact peer list is {} bytes",
                    bytes.len()
                )));
            }
            response.peers = parse_compact_peers(bytes);
        }
        Some(Value::List(list)) => {
            response.peers = list.iter().filter_map(dictionary_peer).collect();
        }
        Some(_) => return Err(TrackerError::Protocol("peers has unexpected type".into())),
        None => {}
    }

    if let Some(peers6) = value.get(b"peers6").and_then(Value::as_bytes) {
        response.peers6 = parse_compact_peers6(peers6);
    }

    Ok(response)
}

fn dictionary_peer(peer: &Value) -> Option<SocketAddr> {
    let ip: IpAddr = peer.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(peer.get(b"port")?.as_integer()?).ok()?;
    if port == 0 {
        return None;
    }
    Some(SocketAddr::new(ip, port))
}

fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~' {
                format!("{}", b as char)
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}
