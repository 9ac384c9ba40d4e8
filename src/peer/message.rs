use super::error::PeerError;
use crate::constants::{HANDSHAKE_LEN, PROTOCOL_NAME};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    /// Maps a wire id to a known message kind; `None` for ids we do not speak.
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            _ => return None,
        })
    }
}

/// The fixed 68-byte opening exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Builds a handshake with all reserved bits clear (no extensions).
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_NAME.len() as u8);
        buf.put_slice(PROTOCOL_NAME);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerError::ProtocolViolation(format!(
                "handshake is {} bytes",
                data.len()
            )));
        }

        if data[0] as usize != PROTOCOL_NAME.len() || &data[1..20] != PROTOCOL_NAME {
            return Err(PeerError::ProtocolViolation(
                "unknown protocol in handshake".into(),
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// A peer wire message.
///
/// `Unknown` carries the id of a message kind we do not implement; such
/// messages are skipped rather than treated as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Unknown { id: u8 },
}

impl Message {
    /// Encodes the message including its 4-byte length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(&mut buf, MessageId::Choke, 0),
            Message::Unchoke => put_header(&mut buf, MessageId::Unchoke, 0),
            Message::Interested => put_header(&mut buf, MessageId::Interested, 0),
            Message::NotInterested => put_header(&mut buf, MessageId::NotInterested, 0),
            Message::Have { piece } => {
                put_header(&mut buf, MessageId::Have, 4);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                put_header(&mut buf, MessageId::Bitfield, bits.len());
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                put_header(&mut buf, MessageId::Request, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                put_header(&mut buf, MessageId::Piece, 8 + data.len());
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                put_header(&mut buf, MessageId::Cancel, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Unknown { id } => {
                buf.put_u32(1);
                buf.put_u8(*id);
            }
        }

        buf.freeze()
    }

    /// Decodes one complete frame (length prefix included).
    ///
    /// Each known message kind has an exact payload size (or minimum, for
    /// `piece`); any deviation is a protocol violation.
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.len() < 4 {
            return Err(PeerError::ProtocolViolation("frame too short".into()));
        }

        let length = frame.get_u32() as usize;
        if frame.remaining() != length {
            return Err(PeerError::ProtocolViolation(format!(
                "length prefix {} but frame carries {} bytes",
                length,
                frame.remaining()
            )));
        }

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let raw_id = frame.get_u8();
        let Some(id) = MessageId::from_wire(raw_id) else {
            return Ok(Message::Unknown { id: raw_id });
        };

        let payload = frame.remaining();
        let expect = |exact: usize| -> Result<(), PeerError> {
            if payload == exact {
                Ok(())
            } else {
                Err(PeerError::ProtocolViolation(format!(
                    "{:?} payload is {} bytes (expected {})",
                    id, payload, exact
                )))
            }
        };

        match id {
            MessageId::Choke => expect(0).map(|_| Message::Choke),
            MessageId::Unchoke => expect(0).map(|_| Message::Unchoke),
            MessageId::Interested => expect(0).map(|_| Message::Interested),
            MessageId::NotInterested => expect(0).map(|_| Message::NotInterested),
            MessageId::Have => {
                expect(4)?;
                Ok(Message::Have {
                    piece: frame.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(frame)),
            MessageId::Request => {
                expect(12)?;
                Ok(Message::Request {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                })
            }
            MessageId::Piece => {
                if payload < 8 {
                    return Err(PeerError::ProtocolViolation("piece too short".into()));
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: frame,
                })
            }
            MessageId::Cancel => {
                expect(12)?;
                Ok(Message::Cancel {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                })
            }
        }
    }
}

fn put_header(buf: &mut BytesMut, id: MessageId, payload_len: usize) {
    buf.reserve(5 + payload_len);
    buf.put_u32(1 + payload_len as u32);
    buf.put_u8(id as u8);
}
