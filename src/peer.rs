//! Peer wire protocol (BEP-3).
//!
//! Handshake, length-prefixed message framing, the per-connection state
//! machine and the bitfield type shared with the scheduler.

mod bitfield;
mod connection;
mod error;
mod message;
mod peer_id;
mod piece;
mod state;
mod transport;

pub use bitfield::Bitfield;
pub use connection::{ConnectionTimeouts, PeerConnection};
pub use error::PeerError;
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use piece::{Block, BlockRequest};
pub use state::{ChokingState, CloseReason, ConnectionState, PeerState};
pub use transport::PeerTransport;

#[cfg(test)]
mod tests;
