use super::*;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

const INFO_HASH: [u8; 20] = [1u8; 20];

fn addr() -> SocketAddr {
    "127.0.0.1:6881".parse().unwrap()
}

fn timeouts() -> ConnectionTimeouts {
    ConnectionTimeouts {
        connect: Duration::from_millis(200),
        handshake: Duration::from_millis(200),
        write: Duration::from_millis(200),
    }
}

/// Plays the remote side: reads our handshake and answers with `reply`.
fn remote_replies(
    mut remote: DuplexStream,
    reply: Vec<u8>,
) -> tokio::task::JoinHandle<DuplexStream> {
    tokio::spawn(async move {
        let mut ours = [0u8; 68];
        remote.read_exact(&mut ours).await.unwrap();
        remote.write_all(&reply).await.unwrap();
        remote
    })
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("BL0001"));
}

#[test]
fn test_bitfield() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));

    assert!(bf.set(0));
    assert!(!bf.set(0));
    assert!(bf.has(0));

    bf.set(99);
    assert!(bf.has(99));
    assert!(!bf.set(100));

    bf.clear(0);
    assert!(!bf.has(0));
    assert_eq!(bf.count(), 1);
    assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![99]);
}

#[test]
fn test_bitfield_full_clears_spare_bits() {
    let bf = Bitfield::full(10);
    assert_eq!(bf.count(), 10);
    assert!(bf.is_complete());
    assert_eq!(&bf.to_bytes()[..], &[0xFF, 0xC0]);
}

#[test]
fn test_bitfield_from_payload() {
    let bf = Bitfield::from_payload(&[0x80, 0x40], 16).unwrap();
    assert!(bf.has(0));
    assert!(!bf.has(1));
    assert!(bf.has(9));

    assert!(matches!(
        Bitfield::from_payload(&[0x80], 16),
        Err(PeerError::ProtocolViolation(_))
    ));
    // 10 pieces leave 6 spare bits in the second byte
    assert!(Bitfield::from_payload(&[0x00, 0xC0], 10).is_ok());
    assert!(matches!(
        Bitfield::from_payload(&[0x00, 0x01], 10),
        Err(PeerError::ProtocolViolation(_))
    ));
}

#[test]
fn test_bitfield_has_any_missing_from() {
    let mut theirs = Bitfield::new(12);
    let mut ours = Bitfield::new(12);
    assert!(!theirs.has_any_missing_from(&ours));

    theirs.set(11);
    assert!(theirs.has_any_missing_from(&ours));

    ours.set(11);
    assert!(!theirs.has_any_missing_from(&ours));
}

#[test]
fn test_handshake_layout() {
    let handshake = Handshake::new(INFO_HASH, [2u8; 20]);
    let encoded = handshake.encode();

    assert_eq!(encoded.len(), 68);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], b"BitTorrent protocol");
    assert_eq!(&encoded[20..28], &[0u8; 8]);
    assert_eq!(&encoded[28..48], &INFO_HASH);

    assert_eq!(Handshake::decode(&encoded).unwrap(), handshake);
}

#[test]
fn test_handshake_rejects_bad_protocol() {
    let mut encoded = Handshake::new(INFO_HASH, [2u8; 20]).encode().to_vec();
    encoded[0] = 18;
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(PeerError::ProtocolViolation(_))
    ));
    assert!(Handshake::decode(&encoded[..40]).is_err());
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xF0])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 0,
            data: Bytes::from_static(b"hello world"),
        },
        Message::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        },
    ];

    for msg in messages {
        let decoded = Message::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }
}

#[test]
fn test_message_wire_bytes() {
    assert_eq!(&Message::KeepAlive.encode()[..], &[0, 0, 0, 0]);
    assert_eq!(
        &Message::Have { piece: 7 }.encode()[..],
        &[0, 0, 0, 5, 4, 0, 0, 0, 7]
    );
    assert_eq!(
        &Message::Request {
            index: 1,
            begin: 2,
            length: 3
        }
        .encode()[..],
        &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
    );
}

#[test]
fn test_unknown_message_is_not_fatal() {
    // id 20 is the extension protocol; unsupported here
    let frame = Bytes::from_static(&[0, 0, 0, 3, 20, 0xAA, 0xBB]);
    assert_eq!(Message::decode(frame).unwrap(), Message::Unknown { id: 20 });
}

#[test]
fn test_malformed_payloads_are_violations() {
    let cases: Vec<&'static [u8]> = vec![
        &[0, 0, 0, 2, 0, 0],          // choke with payload
        &[0, 0, 0, 3, 4, 0, 0],       // short have
        &[0, 0, 0, 5, 6, 0, 0, 0, 0], // short request
        &[0, 0, 0, 5, 7, 0, 0, 0, 0], // piece without begin
        &[0, 0, 0, 9, 1],             // prefix longer than frame
    ];

    for frame in cases {
        assert!(
            matches!(
                Message::decode(Bytes::from_static(frame)),
                Err(PeerError::ProtocolViolation(_))
            ),
            "{:?}",
            frame
        );
    }
}

#[tokio::test]
async fn test_transport_reassembles_split_frames() {
    let (local, mut remote) = duplex(1024);
    let mut transport = PeerTransport::new(local);

    let frame = Message::Piece {
        index: 0,
        begin: 0,
        data: Bytes::from_static(b"abcdef"),
    }
    .encode();

    let writer = tokio::spawn(async move {
        remote.write_all(&frame[..3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        remote.write_all(&frame[3..]).await.unwrap();
        remote.write_all(&Message::KeepAlive.encode()).await.unwrap();
        remote
    });

    let first = transport.receive_message().await.unwrap();
    assert!(matches!(first, Message::Piece { ref data, .. } if &data[..] == b"abcdef"));
    assert_eq!(transport.receive_message().await.unwrap(), Message::KeepAlive);
    writer.await.unwrap();
}

#[tokio::test]
async fn test_transport_rejects_oversized_prefix() {
    let (local, mut remote) = duplex(1024);
    let mut transport = PeerTransport::new(local);

    let mut buf = BytesMut::new();
    buf.put_u32(u32::MAX);
    buf.put_u8(7);
    remote.write_all(&buf).await.unwrap();

    assert!(matches!(
        transport.receive_message().await,
        Err(PeerError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_transport_reports_remote_close() {
    let (local, remote) = duplex(1024);
    let mut transport = PeerTransport::new(local);
    drop(remote);

    assert!(matches!(
        transport.receive_message().await,
        Err(PeerError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_handshake_success_reaches_exchanging() {
    let (local, remote) = duplex(4096);
    let reply = Handshake::new(INFO_HASH, *b"-XX0001-abcdefghijkl").encode().to_vec();
    let remote_task = remote_replies(remote, reply);

    let conn = PeerConnection::handshake(local, addr(), INFO_HASH, PeerId::generate(), timeouts())
        .await
        .unwrap();

    assert_eq!(conn.state(), &ConnectionState::Exchanging);
    assert_eq!(conn.remote_id.client_id(), Some("XX0001"));
    remote_task.await.unwrap();
}

#[tokio::test]
async fn test_handshake_info_hash_mismatch() {
    let (local, remote) = duplex(4096);
    let reply = Handshake::new([9u8; 20], [3u8; 20]).encode().to_vec();
    let _remote_task = remote_replies(remote, reply);

    let result =
        PeerConnection::handshake(local, addr(), INFO_HASH, PeerId::generate(), timeouts()).await;
    assert!(matches!(result, Err(PeerError::HandshakeMismatch)));
}

#[tokio::test]
async fn test_handshake_garbage_is_violation() {
    let (local, remote) = duplex(4096);
    let _remote_task = remote_replies(remote, vec![0xAB; 68]);

    let result =
        PeerConnection::handshake(local, addr(), INFO_HASH, PeerId::generate(), timeouts()).await;
    assert!(matches!(result, Err(PeerError::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_handshake_times_out_on_silent_peer() {
    let (local, _remote) = duplex(4096);

    let result =
        PeerConnection::handshake(local, addr(), INFO_HASH, PeerId::generate(), timeouts()).await;
    assert!(matches!(result, Err(PeerError::Timeout)));
}

#[tokio::test]
async fn test_accept_answers_matching_handshake() {
    let (local, mut remote) = duplex(4096);
    let remote_task = tokio::spawn(async move {
        remote
            .write_all(&Handshake::new(INFO_HASH, [5u8; 20]).encode())
            .await
            .unwrap();
        let mut ours = [0u8; 68];
        remote.read_exact(&mut ours).await.unwrap();
        Handshake::decode(&ours).unwrap()
    });

    let conn = PeerConnection::accept(local, addr(), INFO_HASH, PeerId::generate(), timeouts())
        .await
        .unwrap();
    assert!(conn.is_open());

    let ours = remote_task.await.unwrap();
    assert_eq!(ours.info_hash, INFO_HASH);
}

#[tokio::test]
async fn test_closed_connection_refuses_io() {
    let (local, remote) = duplex(4096);
    let reply = Handshake::new(INFO_HASH, [3u8; 20]).encode().to_vec();
    let _remote_task = remote_replies(remote, reply);

    let mut conn =
        PeerConnection::handshake(local, addr(), INFO_HASH, PeerId::generate(), timeouts())
            .await
            .unwrap();
    conn.close(CloseReason::Shutdown);

    assert_eq!(conn.state(), &ConnectionState::Closed(CloseReason::Shutdown));
    assert!(matches!(
        conn.send(&Message::Interested).await,
        Err(PeerError::ConnectionClosed)
    ));
}

#[test]
fn test_block_request_from_block() {
    let block = Block::new(2, 16384, Bytes::from(vec![0u8; 100]));
    assert_eq!(block.request(), BlockRequest::new(2, 16384, 100));
}

#[test]
fn test_peer_state_defaults() {
    let state = PeerState::new(8);
    assert!(state.choking.am_choking);
    assert!(state.choking.peer_choking);
    assert!(!state.can_request());
    assert_eq!(state.spare_capacity(4), 4);
}

#[test]
fn test_close_reason_from_error() {
    assert_eq!(CloseReason::from(PeerError::Timeout), CloseReason::Timeout);
    assert_eq!(
        CloseReason::from(PeerError::ConnectionClosed),
        CloseReason::RemoteClosed
    );
}
