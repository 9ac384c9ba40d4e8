use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::state::{CloseReason, ConnectionState};
use super::transport::PeerTransport;
use crate::constants::{CONNECTION_TIMEOUT, HANDSHAKE_TIMEOUT, PEER_WRITE_TIMEOUT};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Time bounds for opening a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub write: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: CONNECTION_TIMEOUT,
            handshake: HANDSHAKE_TIMEOUT,
            write: PEER_WRITE_TIMEOUT,
        }
    }
}

/// A connection to a BitTorrent peer.
///
/// Walks `Connecting → Handshaking → Exchanging`; a connection is only handed
/// out once the remote handshake names our info hash. Any failure along the
/// way surfaces as the matching [`PeerError`].
///
/// # Examples
///
/// ```no_run
/// use bitleech::peer::{ConnectionTimeouts, Message, PeerConnection, PeerId};
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "192.168.1.100:6881".parse()?;
/// let peer_id = PeerId::generate();
///
/// let mut conn =
///     PeerConnection::connect(addr, [0u8; 20], peer_id, ConnectionTimeouts::default()).await?;
/// conn.send(&Message::Interested).await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerConnection<S = TcpStream> {
    /// The peer's socket address.
    pub addr: SocketAddr,
    /// The id the peer announced in its handshake.
    pub remote_id: PeerId,
    state: ConnectionState,
    transport: PeerTransport<S>,
}

impl PeerConnection<TcpStream> {
    /// Dials `addr` and performs the outbound handshake.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_id: PeerId,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self, PeerError> {
        trace!("{}: {:?}", addr, ConnectionState::Connecting);
        let stream = timeout(timeouts.connect, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        stream.set_nodelay(true)?;

        Self::handshake(stream, addr, info_hash, our_id, timeouts).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Performs the outbound handshake over an already-open stream.
    pub async fn handshake(
        stream: S,
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_id: PeerId,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self, PeerError> {
        trace!("{}: {:?}", addr, ConnectionState::Handshaking);
        let mut transport = PeerTransport::new(stream).with_write_timeout(timeouts.write);

        let theirs = timeout(timeouts.handshake, async {
            transport
                .send_handshake(&Handshake::new(info_hash, our_id.0))
                .await?;
            transport.receive_handshake().await
        })
        .await
        .map_err(|_| PeerError::Timeout)??;

        Self::finish(transport, addr, info_hash, theirs)
    }

    /// Answers an inbound handshake: theirs first, then ours.
    pub async fn accept(
        stream: S,
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_id: PeerId,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self, PeerError> {
        let mut transport = PeerTransport::new(stream).with_write_timeout(timeouts.write);

        let theirs = timeout(timeouts.handshake, transport.receive_handshake())
            .await
            .map_err(|_| PeerError::Timeout)??;

        if theirs.info_hash != info_hash {
            return Err(PeerError::HandshakeMismatch);
        }

        transport
            .send_handshake(&Handshake::new(info_hash, our_id.0))
            .await?;

        Self::finish(transport, addr, info_hash, theirs)
    }

    fn finish(
        transport: PeerTransport<S>,
        addr: SocketAddr,
        info_hash: [u8; 20],
        theirs: Handshake,
    ) -> Result<Self, PeerError> {
        if theirs.info_hash != info_hash {
            debug!("{}: handshake for a different torrent", addr);
            return Err(PeerError::HandshakeMismatch);
        }

        let remote_id = PeerId(theirs.peer_id);
        debug!("{}: handshake complete with {:?}", addr, remote_id);

        Ok(Self {
            addr,
            remote_id,
            state: ConnectionState::Exchanging,
            transport,
        })
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Exchanging
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::ConnectionClosed);
        }
        self.transport.send_message(message).await
    }

    /// Waits for the next message. Cancel-safe.
    pub async fn receive(&mut self) -> Result<Message, PeerError> {
        if !self.is_open() {
            return Err(PeerError::ConnectionClosed);
        }
        self.transport.receive_message().await
    }

    /// Moves to `Closed`; later sends and receives fail.
    pub fn close(&mut self, reason: CloseReason) {
        if self.is_open() {
            debug!("{}: closed ({})", self.addr, reason);
        }
        self.state = ConnectionState::Closed(reason);
    }
}
