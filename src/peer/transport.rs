use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::constants::{HANDSHAKE_LEN, MAX_MESSAGE_SIZE, PEER_WRITE_TIMEOUT};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Length-prefixed framing over a byte stream.
///
/// Incoming bytes accumulate in an internal buffer and a frame is only
/// consumed once it is complete, so dropping a pending `receive_message`
/// future (for example inside `tokio::select!`) never loses data.
pub struct PeerTransport<S = TcpStream> {
    stream: S,
    read_buf: BytesMut,
    write_timeout: Duration,
}

impl<S> PeerTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_timeout: PEER_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.write(&handshake.encode()).await
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            self.fill().await?;
        }

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        self.write(&message.encode()).await
    }

    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        loop {
            if let Some(message) = self.try_take_frame()? {
                return Ok(message);
            }
            self.fill().await?;
        }
    }

    /// Decodes a frame if one is fully buffered.
    fn try_take_frame(&mut self) -> Result<Option<Message>, PeerError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::ProtocolViolation(format!(
                "message too large: {}",
                length
            )));
        }

        if self.read_buf.len() < 4 + length {
            self.read_buf.reserve(4 + length - self.read_buf.len());
            return Ok(None);
        }

        let frame = self.read_buf.split_to(4 + length).freeze();
        Message::decode(frame).map(Some)
    }

    async fn fill(&mut self) -> Result<(), PeerError> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), PeerError> {
        timeout(self.write_timeout, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}
