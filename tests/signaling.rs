//! Signaling flows against in-process brokers: dedup, filtering, mesh
//! initiation ordering, heartbeat supervision and the rejoin guard.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use confmesh::broker::client::{BrokerClient, BrokerEvent};
use confmesh::broker::pool::{BrokerPool, PoolEvent};
use confmesh::{
    BrokerEndpoint, Config, CoreContext, Credentials, RoomController, RoomEvent, SignalingState,
    StaticCredentialsProvider,
};
use support::MockBroker;

fn test_config() -> Config {
    Config {
        connect_timeout: Duration::from_secs(3),
        subscribe_timeout: Duration::from_secs(2),
        announce_initial_delay: Duration::from_millis(50),
        announce_interval: Duration::from_millis(200),
        announce_debounce: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(100),
        ping_idle: Duration::from_millis(150),
        heartbeat_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

fn context_for(broker_urls: &[String], config: Config) -> Arc<CoreContext> {
    let credentials = Credentials {
        ice_servers: Vec::new(),
        brokers: broker_urls
            .iter()
            .map(|url| BrokerEndpoint::anonymous(url.clone()))
            .collect(),
    };
    CoreContext::with_provider(config, Arc::new(StaticCredentialsProvider(credentials)))
}

fn fake_announce(from: &str, session_id: u64, msg_id: &str) -> Vec<u8> {
    serde_json::json!({
        "v": 1,
        "type": "announce",
        "from": from,
        "userName": "ghost",
        "platform": "linux",
        "ts": 1_700_000_000_000u64,
        "sessionId": session_id,
        "msgId": msg_id,
    })
    .to_string()
    .into_bytes()
}

async fn drain_events(
    rx: &mut mpsc::UnboundedReceiver<RoomEvent>,
    window: Duration,
) -> Vec<RoomEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            _ => break,
        }
    }
    events
}

#[tokio::test]
async fn broker_client_round_trip() {
    let broker = MockBroker::start().await;
    let (event_tx, mut event_rx) = mpsc::channel(16);
    let config = test_config();

    let client = BrokerClient::connect(
        &broker.url(),
        None,
        None,
        "abcdefghij123456",
        &config,
        event_tx,
    )
    .await
    .expect("connect");
    assert!(client.is_connected());

    assert!(client.subscribe("p2p-conf/rt-room").await);
    assert!(client.publish("p2p-conf/rt-room", br#"{"msgId":"a"}"#));

    // The broker echoes our publish back to us as a subscriber.
    let event = timeout(Duration::from_secs(2), event_rx.recv())
        .await
        .expect("delivery")
        .expect("open");
    match event {
        BrokerEvent::Message { topic, payload, .. } => {
            assert_eq!(topic, "p2p-conf/rt-room");
            assert_eq!(&payload[..], br#"{"msgId":"a"}"#);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(client.received_count(), 1);

    // Intentional close suppresses the disconnect hook.
    client.disconnect().await;
    assert!(timeout(Duration::from_millis(300), event_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn pool_deduplicates_across_brokers() {
    let brokers = [
        MockBroker::start().await,
        MockBroker::start().await,
        MockBroker::start().await,
    ];
    let endpoints: Vec<BrokerEndpoint> = brokers
        .iter()
        .map(|b| BrokerEndpoint::anonymous(b.url()))
        .collect();

    let (pool_tx, mut pool_rx) = mpsc::channel(64);
    let pool = BrokerPool::new(endpoints, "selfselfself0001", &test_config(), pool_tx);
    assert_eq!(pool.connect_all().await.len(), 3);
    assert_eq!(pool.subscribe_all("p2p-conf/dedup-room").await, 3);

    let payload = br#"{"v":1,"type":"announce","from":"peerpeerpeer0001","msgId":"x1"}"#;
    for broker in &brokers {
        broker.inject("p2p-conf/dedup-room", payload);
    }

    // Exactly one copy crosses the pool.
    let first = timeout(Duration::from_secs(2), pool_rx.recv())
        .await
        .expect("one delivery")
        .expect("open");
    assert!(matches!(first, PoolEvent::Message { .. }));
    assert!(timeout(Duration::from_millis(400), pool_rx.recv())
        .await
        .is_err());

    // A fresh ID passes again.
    brokers[0].inject(
        "p2p-conf/dedup-room",
        br#"{"v":1,"type":"announce","from":"peerpeerpeer0001","msgId":"x2"}"#,
    );
    assert!(timeout(Duration::from_secs(2), pool_rx.recv()).await.is_ok());

    pool.shutdown().await;
}

#[tokio::test]
async fn pool_publish_fans_out_to_every_broker() {
    let brokers = [MockBroker::start().await, MockBroker::start().await];
    let endpoints: Vec<BrokerEndpoint> = brokers
        .iter()
        .map(|b| BrokerEndpoint::anonymous(b.url()))
        .collect();

    let (pool_tx, _pool_rx) = mpsc::channel(64);
    let pool = BrokerPool::new(endpoints, "selfselfself0002", &test_config(), pool_tx);
    pool.connect_all().await;
    pool.subscribe_all("p2p-conf/fanout-1").await;

    assert_eq!(pool.publish(br#"{"msgId":"f1"}"#).await, 2);
    sleep(Duration::from_millis(200)).await;
    for broker in &brokers {
        assert_eq!(broker.published().len(), 1);
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn own_echo_creates_no_peer() {
    let broker = MockBroker::start().await;
    let ctx = context_for(&[broker.url()], test_config());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let room = RoomController::new(ctx, event_tx).unwrap();

    room.join_room("echo-room-1", None).await.unwrap();
    let events = drain_events(&mut event_rx, Duration::from_millis(600)).await;

    // The broker echoed our announces back; none may produce a peer.
    assert!(events
        .iter()
        .any(|e| matches!(e, RoomEvent::SignalingState(SignalingState::Connected))));
    assert!(!events.iter().any(|e| matches!(e, RoomEvent::PeerJoined(_))));
    assert!(!events.iter().any(|e| matches!(e, RoomEvent::Error { .. })));

    // And the announces really were published.
    let announces = broker.published_json("p2p-conf/echo-room-1");
    assert!(!announces.is_empty());
    assert!(announces.iter().all(|m| m["type"] == "announce"));

    room.shutdown().await;
}

#[tokio::test]
async fn announce_loop_repeats_until_a_peer_shows_up() {
    let broker = MockBroker::start().await;
    let ctx = context_for(&[broker.url()], test_config());
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let room = RoomController::new(ctx, event_tx).unwrap();

    room.join_room("lonely-room-1", None).await.unwrap();
    sleep(Duration::from_millis(900)).await;

    let announces = broker.published_json("p2p-conf/lonely-room-1");
    assert!(
        announces.len() >= 3,
        "expected repeated announces, got {}",
        announces.len()
    );

    room.shutdown().await;
}

#[tokio::test]
async fn greater_id_creates_the_offer() {
    let broker = MockBroker::start().await;
    let ctx_a = context_for(&[broker.url()], test_config());
    let ctx_b = context_for(&[broker.url()], test_config());
    let id_a = ctx_a.self_id().clone();
    let id_b = ctx_b.self_id().clone();
    let greater = id_a.clone().max(id_b.clone());
    let lesser = id_a.min(id_b);

    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    let room_a = RoomController::new(ctx_a, tx_a).unwrap();
    let room_b = RoomController::new(ctx_b, tx_b).unwrap();

    room_a.join_room("ordering-room", None).await.unwrap();
    room_b.join_room("ordering-room", None).await.unwrap();
    sleep(Duration::from_secs(2)).await;

    let messages = broker.published_json("p2p-conf/ordering-room");
    let offers: Vec<_> = messages.iter().filter(|m| m["type"] == "offer").collect();
    let answers: Vec<_> = messages.iter().filter(|m| m["type"] == "answer").collect();

    assert!(!offers.is_empty(), "no offer was published");
    for offer in &offers {
        assert_eq!(offer["from"], *greater, "offer from the lesser peer");
        assert_eq!(offer["to"], *lesser);
    }
    assert!(!answers.is_empty(), "no answer was published");
    for answer in &answers {
        assert_eq!(answer["from"], *lesser);
        assert_eq!(answer["to"], *greater);
    }

    room_a.shutdown().await;
    room_b.shutdown().await;
}

#[tokio::test]
async fn silent_peer_is_pinged_then_reaped() {
    let broker = MockBroker::start().await;
    let ctx = context_for(&[broker.url()], test_config());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let room = RoomController::new(ctx, event_tx).unwrap();

    room.join_room("heartbeat-room", None).await.unwrap();
    // A ghost with the minimum ID announces; we initiate and it never
    // answers anything again.
    broker.inject(
        "p2p-conf/heartbeat-room",
        &fake_announce("0000000000000000", 1, "ghost-announce-1"),
    );

    let mut saw_left = false;
    let events = drain_events(&mut event_rx, Duration::from_secs(3)).await;
    for event in &events {
        if let RoomEvent::PeerLeft { peer_id } = event {
            assert_eq!(peer_id, "0000000000000000");
            saw_left = true;
        }
    }
    assert!(saw_left, "silent peer was never reaped");

    let messages = broker.published_json("p2p-conf/heartbeat-room");
    let offers = messages.iter().filter(|m| m["type"] == "offer").count();
    assert!(offers >= 1, "no offer to the ghost peer");
    let pings = messages
        .iter()
        .filter(|m| m["type"] == "ping" && m["to"] == "0000000000000000")
        .count();
    assert!(pings >= 1, "silent peer was never pinged");

    room.shutdown().await;
}

#[tokio::test]
async fn rejoin_does_not_leak_into_the_new_session() {
    let broker = MockBroker::start().await;
    let ctx = context_for(&[broker.url()], test_config());
    let bus = ctx.local_bus().clone();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let room = RoomController::new(ctx, event_tx).unwrap();

    // Two joins back to back; the second must wait for the first leave.
    let (first, second) = tokio::join!(
        room.join_room("old-room-abc", None),
        room.join_room("new-room-xyz", None)
    );
    first.unwrap();
    second.unwrap();

    // Traffic for the old room arrives late, over the old local bus.
    let _ = bus
        .channel("old-room-abc")
        .send(bytes::Bytes::from(fake_announce(
            "0000000000000000",
            7,
            "stale-announce",
        )));
    // Fresh traffic for the new room arrives over the broker.
    broker.inject(
        "p2p-conf/new-room-xyz",
        &fake_announce("0000000000000000", 8, "fresh-announce"),
    );
    sleep(Duration::from_millis(800)).await;

    // No offer ever targets the old room.
    let old_offers = broker
        .published_json("p2p-conf/old-room-abc")
        .into_iter()
        .filter(|m| m["type"] == "offer")
        .count();
    assert_eq!(old_offers, 0, "stale session produced an offer");

    // The new room negotiates normally.
    let new_offers = broker
        .published_json("p2p-conf/new-room-xyz")
        .into_iter()
        .filter(|m| m["type"] == "offer" && m["to"] == "0000000000000000")
        .count();
    assert!(new_offers >= 1, "new session failed to negotiate");

    // Nothing from the stale session surfaced as an event either.
    let events = drain_events(&mut event_rx, Duration::from_millis(100)).await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, RoomEvent::PeerJoined(s) if s.id == "0000000000000000")));

    room.shutdown().await;
}
