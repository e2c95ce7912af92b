use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use banter_proto::{
    CandidatePayload, ClientMessage, ConnectionPhase, EnvelopeKind, RelayRejection, SdpPayload,
    ServerMessage, SignalPayload, UserId,
};
use banter_relay::{app, Config, RelayState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    Config {
        offer_limit: 20,
        candidate_limit: 120,
        rate_window: Duration::from_secs(90),
        dedup_window: Duration::from_millis(300),
        ..Config::default()
    }
}

async fn spawn_relay(config: Config) -> (SocketAddr, RelayState) {
    let state = RelayState::new(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve relay");
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, user: &str) -> Socket {
    let url = format!("ws://{addr}/ws/{user}");
    let (socket, _) = connect_async(&url).await.expect("websocket connect");
    socket
}

async fn wait_for_users(state: &RelayState, count: usize) {
    timeout(RECV_TIMEOUT, async {
        while state.connected_users() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peers registered in time");
}

async fn send(socket: &mut Socket, message: &ClientMessage) {
    let json = serde_json::to_string(message).expect("encode client message");
    socket
        .send(Message::Text(json))
        .await
        .expect("send websocket frame");
}

async fn recv(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("server message in time")
            .expect("socket open")
            .expect("websocket frame");
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("decode server message")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn recv_ack(socket: &mut Socket) -> (u64, bool, Option<RelayRejection>) {
    loop {
        match recv(socket).await {
            ServerMessage::Ack {
                seq,
                accepted,
                reason,
            } => return (seq, accepted, reason),
            ServerMessage::Pong => continue,
            other => panic!("expected ack, got {other:?}"),
        }
    }
}

async fn recv_envelope(socket: &mut Socket) -> (UserId, SignalPayload) {
    loop {
        match recv(socket).await {
            ServerMessage::Envelope { from, signal, .. } => return (from, signal),
            ServerMessage::Pong => continue,
            other => panic!("expected envelope, got {other:?}"),
        }
    }
}

fn offer(seq: u64, to: &str) -> ClientMessage {
    ClientMessage::Envelope {
        seq,
        to: UserId::from(to),
        signal: SignalPayload::Offer(SdpPayload {
            sdp: format!("v=0 o=- seq-{seq}"),
            typ: "offer".into(),
        }),
    }
}

#[tokio::test]
async fn routes_envelopes_and_stamps_sender() {
    let (addr, state) = spawn_relay(test_config()).await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_users(&state, 2).await;

    send(&mut alice, &offer(1, "bob")).await;
    let (seq, accepted, reason) = recv_ack(&mut alice).await;
    assert_eq!(seq, 1);
    assert!(accepted);
    assert!(reason.is_none());

    let (from, signal) = recv_envelope(&mut bob).await;
    assert_eq!(from.as_str(), "alice");
    assert_eq!(signal.kind(), EnvelopeKind::Offer);
}

#[tokio::test]
async fn unknown_target_is_rejected_immediately() {
    let (addr, state) = spawn_relay(test_config()).await;
    let mut alice = connect(addr, "alice").await;
    wait_for_users(&state, 1).await;

    send(&mut alice, &offer(1, "nobody")).await;
    let (_, accepted, reason) = recv_ack(&mut alice).await;
    assert!(!accepted);
    assert_eq!(reason, Some(RelayRejection::TargetNotFound));
}

#[tokio::test]
async fn offers_beyond_the_cap_are_rate_limited() {
    let config = Config {
        offer_limit: 2,
        dedup_window: Duration::ZERO,
        ..test_config()
    };
    let (addr, state) = spawn_relay(config).await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_users(&state, 2).await;

    for seq in 1..=2 {
        send(&mut alice, &offer(seq, "bob")).await;
        let (_, accepted, _) = recv_ack(&mut alice).await;
        assert!(accepted, "offer {seq} should pass");
        recv_envelope(&mut bob).await;
    }

    send(&mut alice, &offer(3, "bob")).await;
    let (_, accepted, reason) = recv_ack(&mut alice).await;
    assert!(!accepted);
    assert_eq!(reason, Some(RelayRejection::RateLimited));

    // Candidates ride a separate budget and still flow.
    send(
        &mut alice,
        &ClientMessage::Envelope {
            seq: 4,
            to: UserId::from("bob"),
            signal: SignalPayload::IceCandidate(CandidatePayload {
                candidate: "candidate:1 1 udp 2 10.0.0.2 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
        },
    )
    .await;
    let (_, accepted, _) = recv_ack(&mut alice).await;
    assert!(accepted);
}

#[tokio::test]
async fn duplicates_inside_the_window_are_acked_but_delivered_once() {
    let (addr, state) = spawn_relay(test_config()).await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_users(&state, 2).await;

    // Same payload twice in quick succession; only the client-side sequence
    // number differs.
    let identical = |seq| ClientMessage::Envelope {
        seq,
        to: UserId::from("bob"),
        signal: SignalPayload::Offer(SdpPayload {
            sdp: "v=0 o=- repeat".into(),
            typ: "offer".into(),
        }),
    };
    send(&mut alice, &identical(1)).await;
    let (_, accepted, _) = recv_ack(&mut alice).await;
    assert!(accepted);
    send(&mut alice, &identical(2)).await;
    let (_, accepted, reason) = recv_ack(&mut alice).await;
    assert!(accepted, "duplicates are acked as success");
    assert!(reason.is_none());

    recv_envelope(&mut bob).await;
    // The duplicate must not arrive; only the pending record proves the first
    // delivery happened exactly once.
    let extra = timeout(Duration::from_millis(400), bob.next()).await;
    assert!(extra.is_err(), "second identical offer was re-delivered");
    assert_eq!(state.pending().len(), 1);
}

#[tokio::test]
async fn answer_settles_the_pending_record() {
    let (addr, state) = spawn_relay(test_config()).await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_users(&state, 2).await;

    send(&mut alice, &offer(1, "bob")).await;
    recv_ack(&mut alice).await;
    recv_envelope(&mut bob).await;
    assert_eq!(state.pending().len(), 1);

    send(
        &mut bob,
        &ClientMessage::Envelope {
            seq: 1,
            to: UserId::from("alice"),
            signal: SignalPayload::Answer(SdpPayload {
                sdp: "v=0".into(),
                typ: "answer".into(),
            }),
        },
    )
    .await;
    recv_ack(&mut bob).await;
    recv_envelope(&mut alice).await;
    assert!(state.pending().is_empty());
}

#[tokio::test]
async fn disconnect_synthesizes_state_to_pending_peers() {
    let (addr, state) = spawn_relay(test_config()).await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_users(&state, 2).await;

    send(&mut alice, &offer(1, "bob")).await;
    recv_ack(&mut alice).await;
    recv_envelope(&mut bob).await;

    alice.close(None).await.expect("close alice");

    let (from, signal) = recv_envelope(&mut bob).await;
    assert_eq!(from.as_str(), "alice");
    match signal {
        SignalPayload::ConnectionState(payload) => {
            assert_eq!(payload.phase, ConnectionPhase::Disconnected)
        }
        other => panic!("expected connection_state, got {other:?}"),
    }
    assert!(state.pending().is_empty());
}

#[tokio::test]
async fn legacy_frames_are_translated_at_the_edge() {
    let (addr, state) = spawn_relay(test_config()).await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_users(&state, 2).await;

    let legacy = serde_json::json!({
        "action": "offer",
        "target": "bob",
        "seq": 9,
        "data": {"sdp": "v=0 legacy"},
    })
    .to_string();
    alice
        .send(Message::Text(legacy))
        .await
        .expect("send legacy frame");

    let (_, accepted, _) = recv_ack(&mut alice).await;
    assert!(accepted);
    let (from, signal) = recv_envelope(&mut bob).await;
    assert_eq!(from.as_str(), "alice");
    assert_eq!(signal.kind(), EnvelopeKind::Offer);
}

#[tokio::test]
async fn health_and_pending_endpoints_report_state() {
    let (addr, state) = spawn_relay(test_config()).await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_users(&state, 2).await;

    send(&mut alice, &offer(1, "bob")).await;
    recv_ack(&mut alice).await;
    recv_envelope(&mut bob).await;

    let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health body");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connected_users"], 2);
    assert_eq!(health["pending_offers"], 1);

    let pending: serde_json::Value = reqwest::get(format!("http://{addr}/pending"))
        .await
        .expect("pending request")
        .json()
        .await
        .expect("pending body");
    assert_eq!(pending[0]["from"], "alice");
    assert_eq!(pending[0]["to"], "bob");
}

#[tokio::test]
async fn reconnect_replaces_the_live_channel() {
    let (addr, state) = spawn_relay(test_config()).await;
    let mut alice = connect(addr, "alice").await;
    let bob_first = connect(addr, "bob").await;
    wait_for_users(&state, 2).await;

    // Bob reconnects; the same logical id must point at the new socket.
    drop(bob_first);
    let mut bob_second = connect(addr, "bob").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&mut alice, &offer(1, "bob")).await;
    let (_, accepted, _) = recv_ack(&mut alice).await;
    assert!(accepted);
    let (from, _) = recv_envelope(&mut bob_second).await;
    assert_eq!(from.as_str(), "alice");
}
