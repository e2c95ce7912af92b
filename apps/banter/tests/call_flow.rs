//! End-to-end call establishment: two engines with mock links negotiating
//! through a real in-process relay over real WebSockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use banter::config::EngineConfig;
use banter::ice::StaticIceConfig;
use banter::link::mock::{MockLinkFactory, MockLinkHandle};
use banter::media::FakeMediaSource;
use banter::session::{CallEvent, SessionManager, SessionState};
use banter::signaling::ws::WsSignaling;
use banter_proto::UserId;
use banter_relay::{app, Config as RelayConfig, RelayState};

const WAIT: Duration = Duration::from_secs(10);

async fn spawn_relay() -> (SocketAddr, RelayState) {
    let state = RelayState::new(RelayConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve relay");
    });
    (addr, state)
}

struct Peer {
    manager: SessionManager,
    factory: Arc<MockLinkFactory>,
    media: Arc<FakeMediaSource>,
    events: broadcast::Receiver<CallEvent>,
}

async fn spawn_peer(addr: SocketAddr, user: &str, factory: Arc<MockLinkFactory>) -> Peer {
    let user = UserId::from(user);
    let signaling = Arc::new(
        WsSignaling::connect(&format!("http://{addr}"), &user)
            .await
            .expect("connect signaling"),
    );
    let media = Arc::new(FakeMediaSource::new());
    let manager = SessionManager::new(
        user,
        signaling,
        factory.clone(),
        media.clone(),
        Arc::new(StaticIceConfig),
        EngineConfig::default(),
    );
    let router = manager.clone();
    tokio::spawn(async move { router.run().await });
    let events = manager.subscribe();
    Peer {
        manager,
        factory,
        media,
        events,
    }
}

async fn wait_for_state(
    events: &mut broadcast::Receiver<CallEvent>,
    expected: SessionState,
) -> UserId {
    timeout(WAIT, async {
        loop {
            match events.recv().await.expect("event stream open") {
                CallEvent::StateChanged { remote, state } if state == expected => return remote,
                _ => {}
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"))
}

async fn wait_for_users(state: &RelayState, count: usize) {
    timeout(WAIT, async {
        while state.connected_users() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay registrations");
}

async fn first_handle(factory: &MockLinkFactory) -> MockLinkHandle {
    timeout(WAIT, async {
        loop {
            if let Some(handle) = factory.handles().into_iter().next() {
                return handle;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("link created")
}

/// Scenario A: X and Y are matched, X offers, Y answers unsolicited, both
/// sides trickle candidates and end connected.
#[tokio::test]
async fn matched_users_reach_connected_on_both_sides() {
    let (addr, relay) = spawn_relay().await;
    let mut x = spawn_peer(addr, "x", Arc::new(MockLinkFactory::connectable())).await;
    let mut y = spawn_peer(addr, "y", Arc::new(MockLinkFactory::connectable())).await;
    wait_for_users(&relay, 2).await;

    x.manager.place_call(UserId::from("y")).expect("place call");

    let remote = wait_for_state(&mut x.events, SessionState::Connected).await;
    assert_eq!(remote.as_str(), "y");
    let remote = wait_for_state(&mut y.events, SessionState::Connected).await;
    assert_eq!(remote.as_str(), "x");

    // Y never placed a call; the inbound offer created its session.
    assert_eq!(y.manager.active_sessions(), 1);

    let x_link = first_handle(&x.factory).await;
    let y_link = first_handle(&y.factory).await;
    // One offer, one answer, two candidates exchanged in each direction.
    assert_eq!(x_link.offers_created(), 1);
    assert_eq!(y_link.answers_created(), 1);
    assert_eq!(x_link.applied_remote_candidates().len(), 2);
    assert_eq!(y_link.applied_remote_candidates().len(), 2);
    // Both sides acquired a microphone.
    assert_eq!(x.media.acquired(), 1);
    assert_eq!(y.media.acquired(), 1);
}

/// Scenario B: a second local trigger during an in-flight negotiation is
/// deferred, and only one offer ever goes out.
#[tokio::test]
async fn concurrent_triggers_send_exactly_one_offer() {
    let (addr, relay) = spawn_relay().await;
    let mut x = spawn_peer(addr, "x", Arc::new(MockLinkFactory::connectable())).await;
    let mut y = spawn_peer(addr, "y", Arc::new(MockLinkFactory::connectable())).await;
    wait_for_users(&relay, 2).await;

    let target = UserId::from("y");
    x.manager.place_call(target.clone()).expect("first trigger");
    // Second trigger lands while the first negotiation is in flight.
    x.manager.place_call(target).expect("second trigger");

    wait_for_state(&mut x.events, SessionState::Connected).await;
    wait_for_state(&mut y.events, SessionState::Connected).await;

    // Give any wrongly-armed deferred offer a chance to misfire.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let x_link = first_handle(&x.factory).await;
    let y_link = first_handle(&y.factory).await;
    assert_eq!(x_link.offers_created(), 1, "second trigger must not offer");
    assert_eq!(y_link.answers_created(), 1, "only one answer requested");
    assert_eq!(x.factory.links_created(), 1);
    assert_eq!(x.manager.active_sessions(), 1);
}

/// Muting and unmuting never leave `connected`, and unmuting over the
/// existing sender does not renegotiate.
#[tokio::test]
async fn mute_unmute_keeps_the_session_connected() {
    let (addr, relay) = spawn_relay().await;
    let mut x = spawn_peer(addr, "x", Arc::new(MockLinkFactory::connectable())).await;
    let mut y = spawn_peer(addr, "y", Arc::new(MockLinkFactory::connectable())).await;
    wait_for_users(&relay, 2).await;

    let target = UserId::from("y");
    x.manager.place_call(target.clone()).expect("place call");
    wait_for_state(&mut x.events, SessionState::Connected).await;
    wait_for_state(&mut y.events, SessionState::Connected).await;

    let x_link = first_handle(&x.factory).await;
    let offers_before = x_link.offers_created();

    x.manager.mute(&target).expect("mute");
    timeout(WAIT, async {
        while !x_link.sender_blanked() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sender blanked");
    assert_eq!(x.media.released(), 1, "mute releases the device");

    x.manager.unmute(&target).expect("unmute");
    timeout(WAIT, async {
        while x_link.outbound_track_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("track re-attached");

    // The sender survived the mute, so unmute replaced the track in place.
    assert_eq!(x_link.offers_created(), offers_before, "no renegotiation");
    assert_eq!(x.manager.active_sessions(), 1, "session stayed alive");

    // No state transitions away from connected were broadcast.
    while let Ok(event) = x.events.try_recv() {
        if let CallEvent::StateChanged { state, .. } = event {
            panic!("unexpected state change during mute/unmute: {state:?}");
        }
    }
}

/// Hangup notifies the peer, which closes without auto-retry.
#[tokio::test]
async fn hangup_closes_both_sides() {
    let (addr, relay) = spawn_relay().await;
    let mut x = spawn_peer(addr, "x", Arc::new(MockLinkFactory::connectable())).await;
    let mut y = spawn_peer(addr, "y", Arc::new(MockLinkFactory::connectable())).await;
    wait_for_users(&relay, 2).await;

    let target = UserId::from("y");
    x.manager.place_call(target.clone()).expect("place call");
    wait_for_state(&mut x.events, SessionState::Connected).await;
    wait_for_state(&mut y.events, SessionState::Connected).await;

    x.manager.hangup(&target).expect("hangup");

    wait_for_state(&mut x.events, SessionState::Closed).await;
    wait_for_state(&mut y.events, SessionState::Closed).await;

    timeout(WAIT, async {
        while x.manager.active_sessions() > 0 || y.manager.active_sessions() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sessions deregistered");

    // Terminal outcome is reported once; there is no reconnection attempt.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(x.factory.links_created(), 1);
    assert_eq!(y.factory.links_created(), 1);
}
