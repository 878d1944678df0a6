use std::net::SocketAddr;
use std::time::Duration;

use call_relay::{RelayConfig, RelayState, router};
use call_signaling::{
    CallType, RelayContext, RelayRequest, RoomId, Signal, SignalingTransport, TransportError,
    TransportEvent, UNAVAILABLE_REASON, UserId, WebSocketConfig, WebSocketTransport, mint_token,
};
use futures_util::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

async fn start_relay(config: RelayConfig) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = router(RelayState::new(&config));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn client(addr: SocketAddr, context: RelayContext) -> (WebSocketTransport, UnboundedReceiver<TransportEvent>) {
    let transport = WebSocketTransport::new(WebSocketConfig::new(format!("http://{addr}")));
    let events = transport.subscribe().expect("subscribe");
    transport.connect(&context).await.expect("connect");
    (transport, events)
}

async fn next_envelope(events: &mut UnboundedReceiver<TransportEvent>) -> call_signaling::Envelope {
    match events.recv().await.expect("event") {
        TransportEvent::Envelope(envelope) => envelope,
        other => panic!("unexpected {other:?}"),
    }
}

fn invite(room: u64, target: u64) -> RelayRequest {
    RelayRequest::new(
        RoomId(room),
        Signal::Invite {
            call_type: CallType::Audio,
            target_user_id: UserId(target),
        },
    )
}

#[test_timeout::tokio_timeout_test]
async fn relays_envelopes_in_order_with_stamped_sender() {
    let addr = start_relay(RelayConfig::default()).await;
    let (alice, _alice_events) = client(addr, RelayContext::new(UserId(1))).await;
    let (_bob, mut bob_events) = client(addr, RelayContext::new(UserId(2))).await;

    alice.send(invite(7, 2)).await.expect("invite");
    alice
        .send(RelayRequest::new(RoomId(7), Signal::Offer { sdp: "v=0".into() }))
        .await
        .expect("offer");
    alice
        .send(RelayRequest::new(RoomId(7), Signal::Hangup))
        .await
        .expect("hangup");

    let first = next_envelope(&mut bob_events).await;
    assert_eq!(first.sender_id, UserId(1));
    assert_eq!(first.room_id, RoomId(7));
    assert!(matches!(first.signal, Signal::Invite { .. }));
    assert!(matches!(
        next_envelope(&mut bob_events).await.signal,
        Signal::Offer { .. }
    ));
    assert_eq!(next_envelope(&mut bob_events).await.signal, Signal::Hangup);
}

#[test_timeout::tokio_timeout_test]
async fn forged_sender_is_overwritten() {
    let addr = start_relay(RelayConfig::default()).await;
    let (_bob, mut bob_events) = client(addr, RelayContext::new(UserId(2))).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("raw connect");
    socket
        .send(Message::Text(r#"{"type":"join","user_id":1}"#.to_string()))
        .await
        .expect("join");
    let forged = r#"{"type":"signal","envelope":{"type":"INVITE","senderId":99,"roomId":7,"payload":{"callType":"VIDEO","targetUserId":2}}}"#;
    socket
        .send(Message::Text(forged.to_string()))
        .await
        .expect("send");

    let envelope = next_envelope(&mut bob_events).await;
    assert_eq!(envelope.sender_id, UserId(1));
    let _ = socket.close(None).await;
}

#[test_timeout::tokio_timeout_test]
async fn offline_invite_target_is_reported_unavailable() {
    let addr = start_relay(RelayConfig::default()).await;
    let (alice, mut alice_events) = client(addr, RelayContext::new(UserId(1))).await;

    alice.send(invite(3, 5)).await.expect("invite");
    let reply = next_envelope(&mut alice_events).await;
    assert_eq!(reply.sender_id, UserId(5));
    assert_eq!(reply.room_id, RoomId(3));
    assert_eq!(reply.signal, Signal::reject(UNAVAILABLE_REASON));
}

#[test_timeout::tokio_timeout_test]
async fn joins_need_a_valid_token_when_secured() {
    let config = RelayConfig {
        secret: Some("relay-secret".into()),
        ..RelayConfig::default()
    };
    let addr = start_relay(config).await;

    let transport = WebSocketTransport::new(WebSocketConfig::new(format!("http://{addr}")));
    let refused = transport.connect(&RelayContext::new(UserId(1))).await;
    assert!(matches!(refused, Err(TransportError::JoinRejected(_))));

    let token = mint_token(b"relay-secret", UserId(1)).expect("mint");
    transport
        .connect(&RelayContext::new(UserId(1)).with_token(token))
        .await
        .expect("authorised join");
    assert!(transport.is_connected());
}

#[test_timeout::tokio_timeout_test]
async fn stale_connections_are_dropped() {
    let config = RelayConfig {
        heartbeat_timeout_secs: 1,
        ..RelayConfig::default()
    };
    let addr = start_relay(config).await;

    let transport = WebSocketTransport::new(WebSocketConfig {
        heartbeat: Duration::from_secs(60),
        ..WebSocketConfig::new(format!("http://{addr}"))
    });
    let mut events = transport.subscribe().expect("subscribe");
    transport
        .connect(&RelayContext::new(UserId(4)))
        .await
        .expect("connect");

    match events.recv().await.expect("event") {
        TransportEvent::Lost { .. } => {}
        other => panic!("unexpected {other:?}"),
    }
    assert!(!transport.is_connected());
}

#[test_timeout::tokio_timeout_test]
async fn health_reports_connected_users() {
    let addr = start_relay(RelayConfig::default()).await;
    let (_alice, _events) = client(addr, RelayContext::new(UserId(1))).await;

    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""connected_users":1"#), "{response}");
}

#[test_timeout::tokio_timeout_test]
async fn refused_envelopes_come_back_with_their_room() {
    let addr = start_relay(RelayConfig::default()).await;
    let (alice, _alice_events) = client(addr, RelayContext::new(UserId(1))).await;
    let (bob, mut bob_events) = client(addr, RelayContext::new(UserId(2))).await;
    let (carol, mut carol_events) = client(addr, RelayContext::new(UserId(3))).await;

    alice.send(invite(7, 2)).await.expect("invite");
    assert_eq!(next_envelope(&mut bob_events).await.sender_id, UserId(1));

    carol.send(invite(7, 2)).await.expect("send");
    match carol_events.recv().await.expect("event") {
        TransportEvent::Refused { room_id, .. } => assert_eq!(room_id, RoomId(7)),
        other => panic!("unexpected {other:?}"),
    }

    bob.send(RelayRequest::new(RoomId(7), Signal::Hangup))
        .await
        .expect("hangup");
    carol.send(invite(7, 2)).await.expect("reinvite");
    let next = next_envelope(&mut bob_events).await;
    assert_eq!(next.sender_id, UserId(3));
    assert_eq!(next.room_id, RoomId(7));
}
