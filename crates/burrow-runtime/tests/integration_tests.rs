//! Integration tests for the Burrow tunnel runtime
//!
//! These tests exercise the registry, virtual sockets, and tunnel streams
//! against real loopback TCP connections, asserting the lifecycle and wire
//! emission properties of the protocol end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use burrow_runtime::{
    frame_channel, BurrowError, BurrowResult, ConnectParams, MessageHandle, MessageKind,
    MpscChannel, PeerChannel, PeerKey, PeerRegistry, PeerUpdate, SocketId, SocketRequest,
    SocketState, TunnelConfig, TunnelErrorKind, VirtualSocket, WireError, WireMessage,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

/// Channel stub that decodes every outbound frame back into a message and
/// hands it to the test
struct RecordingChannel {
    sent: mpsc::UnboundedSender<WireMessage>,
}

#[async_trait]
impl PeerChannel for RecordingChannel {
    async fn send(&self, frame: Vec<u8>) -> BurrowResult<()> {
        let message = WireMessage::decode(&frame).map_err(BurrowError::from)?;
        self.sent
            .send(message)
            .map_err(|_| BurrowError::channel_closed())
    }
}

fn recording_channel() -> (Arc<dyn PeerChannel>, mpsc::UnboundedReceiver<WireMessage>) {
    let (sent, outbox) = mpsc::unbounded_channel();
    (Arc::new(RecordingChannel { sent }), outbox)
}

fn peer_key(seed: u8) -> PeerKey {
    PeerKey::new([seed; 32])
}

fn config_allowing(port: u16) -> TunnelConfig {
    TunnelConfig {
        allowed_ports: [port, 4002],
        ..TunnelConfig::default()
    }
}

async fn recv_message(outbox: &mut mpsc::UnboundedReceiver<WireMessage>) -> WireMessage {
    tokio::time::timeout(Duration::from_secs(5), outbox.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound channel closed")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_open_write_close_lifecycle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let registry = PeerRegistry::new(config_allowing(port)).unwrap();
    let peer = peer_key(1);
    let (channel, mut outbox) = recording_channel();
    registry.handle_new_peer_channel(&peer, channel);

    // Remote opens a tunnel to the listener.
    registry
        .handle_message(
            &peer,
            WireMessage::Open {
                request: SocketRequest::unpaired(SocketId::new(9)),
                params: Some(ConnectParams::loopback(port)),
            },
        )
        .await;

    let (mut accepted, _) = listener.accept().await.unwrap();

    // Exactly one Open acknowledgment, echoing the remote id.
    let ack_pair = match recv_message(&mut outbox).await {
        WireMessage::Open {
            request,
            params: None,
        } => {
            assert_eq!(request.remote_id, SocketId::new(9));
            request
        }
        other => panic!("expected open ack, got {other:?}"),
    };
    let local_id = ack_pair.id;
    // Subsequent remote messages carry the pair as the remote sees it.
    let remote_pair = ack_pair.flipped();

    // Both table entries present after open.
    assert!(registry.contains_socket(local_id));
    assert_eq!(registry.remote_id_of(local_id), Some(SocketId::new(9)));
    assert_eq!(registry.peer_socket_count(&peer), 1);

    // Inbound data is forwarded to the OS socket in order.
    registry
        .handle_message(
            &peer,
            WireMessage::Write {
                request: remote_pair,
                data: vec![0x41, 0x42],
            },
        )
        .await;
    let mut buf = [0u8; 2];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"AB");

    // Locally received bytes come back as exactly one Write message tagged
    // with the socket's id-pair.
    accepted.write_all(b"xyz").await.unwrap();
    match recv_message(&mut outbox).await {
        WireMessage::Write { request, data } => {
            assert_eq!(request, SocketRequest::new(local_id, SocketId::new(9)));
            assert_eq!(data, b"xyz");
        }
        other => panic!("expected relayed write, got {other:?}"),
    }

    // Remote close: one Close emission, both table entries gone.
    registry
        .handle_message(&peer, WireMessage::Close { request: remote_pair })
        .await;
    match recv_message(&mut outbox).await {
        WireMessage::Close { request } => {
            assert_eq!(request, SocketRequest::new(local_id, SocketId::new(9)));
        }
        other => panic!("expected close, got {other:?}"),
    }
    assert!(!registry.contains_socket(local_id));
    assert_eq!(registry.remote_id_of(local_id), None);
}

// ----------------------------------------------------------------------------
// Port Policy
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_disallowed_port_rejected_before_dialing() {
    // The listener's ephemeral port is deliberately absent from the
    // allow-list: if policy enforcement leaked, the dial would land here.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let registry = PeerRegistry::new(TunnelConfig::default()).unwrap();
    let peer = peer_key(2);
    let (channel, mut outbox) = recording_channel();
    registry.handle_new_peer_channel(&peer, channel);

    registry
        .handle_message(
            &peer,
            WireMessage::Open {
                request: SocketRequest::unpaired(SocketId::new(5)),
                params: Some(ConnectParams::loopback(port)),
            },
        )
        .await;

    let local_id = match recv_message(&mut outbox).await {
        WireMessage::Error { request, error } => {
            assert_eq!(error.kind, TunnelErrorKind::PortNotAllowed);
            assert_eq!(request.remote_id, SocketId::new(5));
            request.id
        }
        other => panic!("expected port policy error, got {other:?}"),
    };

    // No OS connection was ever attempted.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err()
    );

    // The error did not destroy the socket; an explicit close does.
    assert!(registry.contains_socket(local_id));
    registry
        .handle_message(
            &peer,
            WireMessage::Close {
                request: SocketRequest::new(SocketId::new(5), local_id),
            },
        )
        .await;
    assert!(matches!(
        recv_message(&mut outbox).await,
        WireMessage::Close { .. }
    ));
    assert!(!registry.contains_socket(local_id));
}

// ----------------------------------------------------------------------------
// Destroy Semantics
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let registry = PeerRegistry::new(TunnelConfig::default()).unwrap();
    let peer = peer_key(3);
    let (channel, mut outbox) = recording_channel();
    registry.handle_new_peer_channel(&peer, channel);

    let entity = registry.get(&peer).unwrap();
    let socket = VirtualSocket::create(
        SocketId::new(42),
        SocketId::new(7),
        peer,
        entity.messages,
        &registry,
        ConnectParams::loopback(4001),
    );
    assert!(registry.contains_socket(SocketId::new(42)));
    assert_eq!(socket.state(), SocketState::Created);

    // Two concurrent destroys resolve to one effective teardown.
    futures::future::join(socket.destroy(), socket.destroy()).await;
    socket.destroy().await;

    match recv_message(&mut outbox).await {
        WireMessage::Close { request } => {
            assert_eq!(request, SocketRequest::new(SocketId::new(42), SocketId::new(7)));
        }
        other => panic!("expected close, got {other:?}"),
    }
    assert!(outbox.try_recv().is_err());

    assert!(!registry.contains_socket(SocketId::new(42)));
    assert_eq!(registry.remote_id_of(SocketId::new(42)), None);
    assert_eq!(socket.state(), SocketState::Closed);
}

#[tokio::test]
async fn test_cascading_teardown_on_peer_close() {
    let registry = PeerRegistry::new(TunnelConfig::default()).unwrap();
    let peer_x = peer_key(0xAA);
    let peer_y = peer_key(0xBB);
    let (channel_x, mut outbox_x) = recording_channel();
    let (channel_y, _outbox_y) = recording_channel();
    registry.handle_new_peer_channel(&peer_x, channel_x);
    registry.handle_new_peer_channel(&peer_y, channel_y);

    let messages_x = registry.get(&peer_x).unwrap().messages;
    let messages_y = registry.get(&peer_y).unwrap().messages;

    let ids_x = [SocketId::new(101), SocketId::new(102), SocketId::new(103)];
    for (n, id) in ids_x.iter().enumerate() {
        VirtualSocket::create(
            *id,
            SocketId::new(n as u32 + 1),
            peer_x,
            messages_x.clone(),
            &registry,
            ConnectParams::loopback(4001),
        );
    }
    let id_y = SocketId::new(201);
    VirtualSocket::create(
        id_y,
        SocketId::new(9),
        peer_y,
        messages_y,
        &registry,
        ConnectParams::loopback(4001),
    );
    assert_eq!(registry.peer_socket_count(&peer_x), 3);

    registry.handle_close_peer(&peer_x).await;

    assert_eq!(registry.peer_socket_count(&peer_x), 0);
    for id in ids_x {
        assert!(!registry.contains_socket(id));
        assert_eq!(registry.remote_id_of(id), None);
    }
    assert!(registry.get(&peer_x).is_none());

    // One Close per destroyed socket.
    for _ in 0..3 {
        assert!(matches!(
            recv_message(&mut outbox_x).await,
            WireMessage::Close { .. }
        ));
    }

    // The other peer is untouched.
    assert!(registry.contains_socket(id_y));
    assert!(registry.get(&peer_y).is_some());
}

// ----------------------------------------------------------------------------
// Protocol Tolerance
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_messages_for_unknown_ids_are_ignored() {
    let registry = PeerRegistry::new(TunnelConfig::default()).unwrap();
    let peer = peer_key(4);
    let (channel, mut outbox) = recording_channel();
    registry.handle_new_peer_channel(&peer, channel);

    let request = SocketRequest::new(SocketId::new(77), SocketId::new(99));
    for message in [
        WireMessage::Write {
            request,
            data: vec![1, 2, 3],
        },
        WireMessage::Close { request },
        WireMessage::Timeout { request },
        WireMessage::Open {
            request,
            params: None,
        },
        WireMessage::Error {
            request,
            error: WireError::new(TunnelErrorKind::Io, "remote hiccup"),
        },
    ] {
        registry.handle_message(&peer, message).await;
    }

    assert_eq!(registry.socket_count(), 0);
    assert!(outbox.try_recv().is_err());
}

#[tokio::test]
async fn test_update_merges_message_handles() {
    let registry = PeerRegistry::new(TunnelConfig::default()).unwrap();
    let peer = peer_key(5);
    let (channel, _outbox) = recording_channel();

    registry.update(
        &peer,
        PeerUpdate::message(MessageHandle::new(MessageKind::Open, channel.clone())),
    );
    registry.update(
        &peer,
        PeerUpdate::message(MessageHandle::new(MessageKind::Write, channel)),
    );

    let entity = registry.get(&peer).unwrap();
    assert!(entity.messages.open.is_some());
    assert!(entity.messages.write.is_some());
    assert!(entity.messages.close.is_none());
}

#[tokio::test]
async fn test_open_socket_requires_registered_peer() {
    let registry = PeerRegistry::new(TunnelConfig::default()).unwrap();
    let result = registry
        .open_socket(&peer_key(6), ConnectParams::loopback(4001))
        .await;
    assert!(result.is_err());
}

// ----------------------------------------------------------------------------
// Tunnel Stream End to End
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_tunnel_stream_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = config_allowing(port);

    let registry_a = PeerRegistry::new(config.clone()).unwrap();
    let registry_b = PeerRegistry::new(config).unwrap();
    let key_a = peer_key(0xA1);
    let key_b = peer_key(0xB2);

    // Two frame pipes stand in for the negotiated peer channel.
    let (a_to_b_tx, a_to_b_rx) = frame_channel(32);
    let (b_to_a_tx, b_to_a_rx) = frame_channel(32);
    registry_a.handle_new_peer_channel(&key_b, Arc::new(MpscChannel::new(a_to_b_tx)));
    registry_b.handle_new_peer_channel(&key_a, Arc::new(MpscChannel::new(b_to_a_tx)));
    tokio::spawn(registry_a.clone().drive_channel(key_b, b_to_a_rx));
    tokio::spawn(registry_b.clone().drive_channel(key_a, a_to_b_rx));

    let mut stream = registry_a
        .open_socket(&key_b, ConnectParams::loopback(port))
        .await
        .unwrap();
    let (mut accepted, _) = listener.accept().await.unwrap();

    assert_ok!(stream.write_all(b"hello").await);
    let mut buf = [0u8; 5];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    accepted.write_all(b"world").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    // Once established, both registries map the id-pair symmetrically.
    let local_id = stream.id();
    wait_until(|| registry_a.remote_id_of(local_id).is_some_and(|id| id.is_assigned())).await;

    // Shutting the caller side down tears both ends out of their tables and
    // closes the OS connection.
    assert_ok!(stream.shutdown().await);
    let n = accepted.read(&mut [0u8; 1]).await.unwrap();
    assert_eq!(n, 0);

    wait_until(|| registry_a.socket_count() == 0).await;
    wait_until(|| registry_b.socket_count() == 0).await;
}

#[tokio::test]
async fn test_tunnel_stream_reads_eof_after_destroy() {
    let registry = PeerRegistry::new(TunnelConfig::default()).unwrap();
    let peer = peer_key(7);
    let (channel, _outbox) = recording_channel();
    registry.handle_new_peer_channel(&peer, channel);

    let mut stream = registry
        .open_socket(&peer, ConnectParams::loopback(4001))
        .await
        .unwrap();
    let local_id = stream.id();
    assert!(registry.contains_socket(local_id));

    // Peer loss destroys the socket; the pending read resolves to EOF.
    registry.handle_close_peer(&peer).await;
    assert!(!registry.contains_socket(local_id));

    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}
