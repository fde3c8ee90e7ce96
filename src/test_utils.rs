use crate::config::ClientConfig;
use crate::engine::SignalingOnlyEngine;
use crate::session::RoomClient;
use crate::signaling::mock::{MockPeer, MockSocketFactory};
use roomcore::{RoomId, Topic};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const TEST_ROOM: &str = "S1";

pub fn test_capabilities() -> Value {
    json!({
        "codec": "VP8",
        "codecs": [
            {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000},
            {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2}
        ]
    })
}

/// Timeouts short enough for tests that exercise fallbacks with real time.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        server_url: "ws://router.test/mediasoup".into(),
        reconnect_attempts: 2,
        reconnect_delay_ms: 20,
        transport_request_timeout_ms: 2000,
        connect_handshake_timeout_ms: 2000,
        produce_timeout_ms: 2000,
        consume_timeout_ms: 2000,
        consume_retry_delay_ms: 20,
        recovery_grace_ms: 50,
        ..Default::default()
    }
}

/// Behaviour switches for [`FakeRouter`].
#[derive(Default)]
pub struct RouterSettings {
    roster: Mutex<Vec<String>>,
    silent: Mutex<HashSet<Topic>>,
    room_full: AtomicBool,
    next_id: AtomicU32,
}

impl RouterSettings {
    pub fn set_roster(&self, ids: &[&str]) {
        if let Ok(mut roster) = self.roster.lock() {
            *roster = ids.iter().map(|s| s.to_string()).collect();
        }
    }

    /// Stops answering requests on `topic`.
    pub fn silence(&self, topic: Topic) {
        if let Ok(mut silent) = self.silent.lock() {
            silent.insert(topic);
        }
    }

    pub fn set_room_full(&self, full: bool) {
        self.room_full.store(full, Ordering::SeqCst);
    }

    fn is_silent(&self, topic: Topic) -> bool {
        self.silent.lock().map(|s| s.contains(&topic)).unwrap_or(false)
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// An in-memory session router that answers every client request the way a real one would.
pub struct FakeRouter {
    pub peer: MockPeer,
    pub settings: Arc<RouterSettings>,
    task: JoinHandle<()>,
}

impl FakeRouter {
    pub fn start(peer: MockPeer) -> Self {
        let settings = Arc::new(RouterSettings::default());
        let task = tokio::spawn(serve(peer.clone(), settings.clone()));
        Self {
            peer,
            settings,
            task,
        }
    }
}

impl Drop for FakeRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(peer: MockPeer, settings: Arc<RouterSettings>) {
    while let Some((topic, data)) = peer.next_message(Duration::from_secs(3600)).await {
        if settings.is_silent(topic) {
            continue;
        }
        match topic {
            Topic::JoinRoom => {
                if settings.room_full.load(Ordering::SeqCst) {
                    peer.try_push(Topic::Error, json!({"message": "Room is full"}));
                } else {
                    peer.try_push(
                        Topic::JoinedRoom,
                        json!({ "rtpCapabilities": test_capabilities() }),
                    );
                }
            }
            Topic::CreateWebRtcTransport => {
                let consumer = data["consumer"].as_bool().unwrap_or(false);
                let prefix = if consumer { "R" } else { "T" };
                peer.try_push(
                    Topic::CreateWebRtcTransportSuccess,
                    json!({
                        "id": format!("{prefix}{}", settings.next_id()),
                        "iceParameters": {"usernameFragment": "u", "password": "p"},
                        "iceCandidates": [],
                        "dtlsParameters": {"fingerprints": []}
                    }),
                );
            }
            Topic::TransportConnect => {
                peer.try_push(Topic::TransportConnected, Value::Null);
            }
            Topic::TransportProduce => {
                let kind = data["kind"].as_str().unwrap_or("video").to_string();
                peer.try_push(
                    Topic::Produced,
                    json!({ "id": format!("PROD-{kind}-{}", settings.next_id()) }),
                );
            }
            Topic::Consume => {
                let publisher = data["remoteProducerId"].as_str().unwrap_or_default().to_string();
                peer.try_push(
                    Topic::Consumed,
                    json!({
                        "id": format!("C-{publisher}-{}", settings.next_id()),
                        "kind": "video",
                        "rtpParameters": {},
                        "producerId": publisher
                    }),
                );
            }
            Topic::GetProducers => {
                let roster = settings.roster.lock().map(|r| r.clone()).unwrap_or_default();
                peer.try_push(Topic::ProducerList, json!(roster));
            }
            _ => {}
        }
    }
}

/// A client wired to a [`FakeRouter`] and a [`SignalingOnlyEngine`].
pub struct TestRoom {
    pub client: Arc<RoomClient>,
    pub engine: Arc<SignalingOnlyEngine>,
    pub factory: Arc<MockSocketFactory>,
    pub router: FakeRouter,
}

pub fn create_test_room(config: ClientConfig) -> TestRoom {
    let factory = Arc::new(MockSocketFactory::new());
    let engine = Arc::new(SignalingOnlyEngine::new());
    let router = FakeRouter::start(factory.peer());
    let client = RoomClient::new(config, factory.clone(), engine.clone());
    TestRoom {
        client,
        engine,
        factory,
        router,
    }
}

/// Creates a client and joins [`TEST_ROOM`].
pub async fn create_joined_room(config: ClientConfig) -> TestRoom {
    let room = create_test_room(config);
    room.client
        .connect(RoomId::new(TEST_ROOM))
        .await
        .expect("join should succeed");
    room
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
