//! Tracker client (BEP-3, BEP-15, BEP-23)
//!
//! Resolves candidate peers for a swarm from an HTTP or UDP announce
//! endpoint. Each call is a single, time-bounded announce; scheduling the
//! next one is left to the caller.

mod client;
mod error;
mod http;
mod response;
mod udp;

pub use client::Tracker;
pub use error::TrackerError;
pub use http::{parse_announce_response, HttpTracker};
pub use response::{
    parse_compact_peers, AnnounceResponse, AnnounceStats, CompactPeer, TrackerEvent,
};
pub use udp::UdpTracker;
