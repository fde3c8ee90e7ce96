//! Creation and ownership of the send and receive transports.
//!
//! Each direction has at most one active transport. Creating a new one
//! supersedes any creation still in flight for that direction and closes
//! the previous transport before the replacement is installed. Deferred
//! effects re-check a per-direction generation counter, so a reply that
//! arrives for a superseded request can never replace the active transport.

use crate::config::ClientConfig;
use crate::engine::{
    EngineTransport, HandshakeOutcome, MediaEngine, ProduceOutcome, ProduceRequest,
    TransportOptions, TransportSignaler,
};
use crate::error::{NegotiationError, TransportError};
use crate::events::{EventBus, HandshakeFallback, TransportStateChanged};
use crate::negotiator::CapabilityNegotiator;
use crate::pending::{PendingResponses, Resolution};
use crate::signaling::SignalingChannel;
use async_trait::async_trait;
use log::{debug, info, warn};
use roomcore::messages::{
    CreateTransportRequest, Produced, ServerError, TransportConnect, TransportParams,
    TransportProduce,
};
use roomcore::protocol::decode_payload;
use roomcore::{ConnectionState, Direction, MediaKind, ProducerId, Topic, TransportId, TransportState};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

type CreateReply = Result<TransportParams, String>;

/// Latest known state of the active transport in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportSnapshot {
    pub id: Option<TransportId>,
    pub state: TransportState,
}

/// Reply queues shared by the listener task and every transport's signaler.
#[derive(Default)]
struct ReplyQueues {
    creates: PendingResponses<Direction, CreateReply>,
    connects: PendingResponses<TransportId, ()>,
    produces: PendingResponses<MediaKind, Produced>,
}

impl ReplyQueues {
    fn clear(&self) {
        let dropped =
            self.creates.clear() + self.connects.clear() + self.produces.clear();
        if dropped > 0 {
            debug!(target: "Room/Transport", "Dropped {dropped} pending replies after signaling loss");
        }
    }
}

struct DirectionSlot {
    direction: Direction,
    generation: AtomicU64,
    active: Mutex<Option<Arc<dyn EngineTransport>>>,
    cancel_inflight: Mutex<Option<oneshot::Sender<()>>>,
    snapshot: watch::Sender<TransportSnapshot>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    ensure_lock: tokio::sync::Mutex<()>,
}

impl DirectionSlot {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            cancel_inflight: Mutex::new(None),
            snapshot: watch::Sender::new(TransportSnapshot::default()),
            forwarder: Mutex::new(None),
            ensure_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn active(&self) -> Option<Arc<dyn EngineTransport>> {
        self.active.lock().ok().and_then(|a| a.clone())
    }

    fn take_active(&self) -> Option<Arc<dyn EngineTransport>> {
        self.active.lock().ok().and_then(|mut a| a.take())
    }

    /// Supersedes whatever creation is in flight and returns the new generation.
    fn begin(&self) -> (u64, oneshot::Receiver<()>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slot) = self.cancel_inflight.lock() {
            if let Some(previous) = slot.replace(tx) {
                let _ = previous.send(());
            }
        }
        (generation, rx)
    }

    fn abort_forwarder(&self) {
        if let Some(handle) = self.forwarder.lock().ok().and_then(|mut f| f.take()) {
            handle.abort();
        }
    }
}

pub struct TransportManager {
    config: Arc<ClientConfig>,
    signaling: Arc<SignalingChannel>,
    negotiator: Arc<CapabilityNegotiator>,
    engine: Arc<dyn MediaEngine>,
    events: Arc<EventBus>,
    replies: Arc<ReplyQueues>,
    send: Arc<DirectionSlot>,
    recv: Arc<DirectionSlot>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TransportManager {
    pub fn new(
        config: Arc<ClientConfig>,
        signaling: Arc<SignalingChannel>,
        negotiator: Arc<CapabilityNegotiator>,
        engine: Arc<dyn MediaEngine>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let replies = Arc::new(ReplyQueues::default());
        let subscription = signaling.on_many(&[
            Topic::CreateWebRtcTransportSuccess,
            Topic::CreateWebRtcTransportError,
            Topic::TransportConnected,
            Topic::Produced,
        ]);
        let listener = tokio::spawn(listen_for_replies(
            subscription,
            signaling.subscribe_state(),
            replies.clone(),
            events.clone(),
        ));

        Arc::new(Self {
            config,
            signaling,
            negotiator,
            engine,
            events,
            replies,
            send: Arc::new(DirectionSlot::new(Direction::Send)),
            recv: Arc::new(DirectionSlot::new(Direction::Recv)),
            listener: Mutex::new(Some(listener)),
        })
    }

    fn slot(&self, direction: Direction) -> &Arc<DirectionSlot> {
        match direction {
            Direction::Send => &self.send,
            Direction::Recv => &self.recv,
        }
    }

    /// Requests parameters for a new transport and installs it as the active one.
    ///
    /// Any creation still in flight for `direction` is superseded and its
    /// reply will be discarded. The previous transport is closed before the
    /// new one is built.
    pub async fn create(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn EngineTransport>, TransportError> {
        self.negotiator.local().map_err(|e| match e {
            NegotiationError::NotReady => TransportError::CapabilitiesNotReady,
            other => TransportError::Engine(other.to_string()),
        })?;
        if !self.signaling.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let slot = self.slot(direction);
        let (generation, mut superseded) = slot.begin();
        let (ticket, reply) = self
            .replies
            .creates
            .push(direction, self.config.transport_request_timeout());
        let request = CreateTransportRequest {
            consumer: direction.is_consumer(),
            force_tcp: self.config.force_tcp,
        };
        if let Err(e) = self
            .signaling
            .send(Topic::CreateWebRtcTransport, &request)
            .await
        {
            self.replies.creates.cancel(ticket);
            return Err(e.into());
        }
        debug!(target: "Room/Transport", "Requested {direction} transport (generation {generation})");

        let reply = tokio::select! {
            reply = reply => reply,
            _ = &mut superseded => return Err(TransportError::Superseded(direction)),
            _ = tokio::time::sleep(self.config.transport_request_timeout()) => {
                warn!(target: "Room/Transport", "No reply to {direction} transport request");
                return Err(TransportError::Timeout("createWebRtcTransportSuccess"));
            }
        };
        let params = reply
            .map_err(|_| TransportError::SignalingClosed("createWebRtcTransportSuccess"))?
            .map_err(TransportError::Rejected)?;

        if !slot.is_current(generation) {
            debug!(
                target: "Room/Transport",
                "Discarding {direction} transport {} from superseded request",
                params.id
            );
            return Err(TransportError::Superseded(direction));
        }

        self.close_active(slot).await;

        let options = TransportOptions {
            id: params.id.clone(),
            direction,
            ice_parameters: params.ice_parameters,
            ice_candidates: params.ice_candidates,
            dtls_parameters: params.dtls_parameters,
            ice_servers: self.config.ice_servers.clone(),
        };
        let signaler: Arc<dyn TransportSignaler> = Arc::new(HandshakeSignaler {
            direction,
            config: self.config.clone(),
            signaling: self.signaling.clone(),
            replies: self.replies.clone(),
            events: self.events.clone(),
        });
        let transport = match direction {
            Direction::Send => self.engine.create_send_transport(options, signaler).await?,
            Direction::Recv => self.engine.create_recv_transport(options, signaler).await?,
        };

        if !slot.is_current(generation) {
            transport.close().await;
            return Err(TransportError::Superseded(direction));
        }
        self.install(slot, transport.clone());
        info!(target: "Room/Transport", "Created {direction} transport {}", transport.id());
        Ok(transport)
    }

    /// Returns the active transport for `direction`, creating one if there is none.
    pub async fn ensure(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn EngineTransport>, TransportError> {
        let slot = self.slot(direction);
        let _guard = slot.ensure_lock.lock().await;
        if let Some(transport) = slot.active() {
            if !transport.state().is_closed() {
                return Ok(transport);
            }
        }
        self.create(direction).await
    }

    fn install(&self, slot: &Arc<DirectionSlot>, transport: Arc<dyn EngineTransport>) {
        let id = transport.id().clone();
        let mut states = transport.subscribe_state();
        let initial = *states.borrow_and_update();

        if let Ok(mut active) = slot.active.lock() {
            *active = Some(transport);
        }
        slot.snapshot.send_replace(TransportSnapshot {
            id: Some(id.clone()),
            state: initial,
        });
        let _ = self.events.transport_state.send(Arc::new(TransportStateChanged {
            direction: slot.direction,
            transport_id: id.clone(),
            state: initial,
        }));

        let watched = slot.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let still_active = watched
                    .active()
                    .is_some_and(|active| active.id() == &id);
                if !still_active {
                    debug!(target: "Room/Transport", "Ignoring {state} from stale transport {id}");
                    break;
                }
                info!(target: "Room/Transport", "{} transport {id} -> {state}", watched.direction);
                watched.snapshot.send_replace(TransportSnapshot {
                    id: Some(id.clone()),
                    state,
                });
                let _ = events.transport_state.send(Arc::new(TransportStateChanged {
                    direction: watched.direction,
                    transport_id: id.clone(),
                    state,
                }));
                if state.is_closed() {
                    break;
                }
            }
        });
        slot.abort_forwarder();
        if let Ok(mut forwarder) = slot.forwarder.lock() {
            *forwarder = Some(handle);
        }
    }

    async fn close_active(&self, slot: &DirectionSlot) {
        slot.abort_forwarder();
        if let Some(previous) = slot.take_active() {
            let id = previous.id().clone();
            previous.close().await;
            info!(target: "Room/Transport", "Closed {} transport {id}", slot.direction);
            slot.snapshot.send_replace(TransportSnapshot {
                id: None,
                state: TransportState::Closed,
            });
            let _ = self.events.transport_state.send(Arc::new(TransportStateChanged {
                direction: slot.direction,
                transport_id: id,
                state: TransportState::Closed,
            }));
        }
    }

    /// Closes the active transport and invalidates any creation in flight.
    pub async fn close(&self, direction: Direction) {
        let slot = self.slot(direction);
        slot.begin();
        self.close_active(slot).await;
    }

    pub async fn close_all(&self) {
        self.close(Direction::Send).await;
        self.close(Direction::Recv).await;
    }

    pub fn get(&self, direction: Direction) -> Option<Arc<dyn EngineTransport>> {
        self.slot(direction).active()
    }

    pub fn active_id(&self, direction: Direction) -> Option<TransportId> {
        self.get(direction).map(|t| t.id().clone())
    }

    /// Whether `id` is still the active transport for `direction`.
    pub fn is_active(&self, direction: Direction, id: &TransportId) -> bool {
        self.get(direction).is_some_and(|t| t.id() == id)
    }

    pub fn subscribe(&self, direction: Direction) -> watch::Receiver<TransportSnapshot> {
        self.slot(direction).snapshot.subscribe()
    }

    pub fn snapshot(&self, direction: Direction) -> TransportSnapshot {
        self.slot(direction).snapshot.borrow().clone()
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().ok().and_then(|mut l| l.take()) {
            listener.abort();
        }
        self.send.abort_forwarder();
        self.recv.abort_forwarder();
    }
}

/// Routes reply topics into the FIFO queues and drops every waiter when signaling goes down.
async fn listen_for_replies(
    mut subscription: crate::signaling::Subscription,
    mut connection: watch::Receiver<ConnectionState>,
    replies: Arc<ReplyQueues>,
    events: Arc<EventBus>,
) {
    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some((topic, data)) = message else { break };
                route_reply(topic, data, &replies, &events);
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                if !connection.borrow_and_update().is_connected() {
                    replies.clear();
                }
            }
        }
    }
}

fn route_reply(topic: Topic, data: Value, replies: &ReplyQueues, events: &EventBus) {
    match topic {
        Topic::CreateWebRtcTransportSuccess | Topic::CreateWebRtcTransportError => {
            let reply = if topic == Topic::CreateWebRtcTransportSuccess {
                decode_payload::<TransportParams>(topic.as_str(), &data).map_err(|e| e.to_string())
            } else {
                Err(ServerError::from_value(&data).message)
            };
            match replies.creates.resolve(reply) {
                Resolution::Delivered => {}
                Resolution::Abandoned(direction, reply) => {
                    let id = reply.map(|p| p.id.to_string()).unwrap_or_else(|e| e);
                    warn!(
                        target: "Room/Transport",
                        "Ignoring late {direction} transport reply ({id}) for a superseded request"
                    );
                }
                Resolution::Unmatched(_) => {
                    warn!(target: "Room/Transport", "Unsolicited {topic}");
                }
            }
        }
        Topic::TransportConnected => match replies.connects.resolve(()) {
            Resolution::Delivered => {}
            Resolution::Abandoned(id, ()) => {
                debug!(target: "Room/Transport", "Late transport-connected for {id} (already assumed)");
            }
            Resolution::Unmatched(()) => {
                debug!(target: "Room/Transport", "Unsolicited transport-connected");
            }
        },
        Topic::Produced => {
            let produced = decode_payload::<Produced>(topic.as_str(), &data).unwrap_or_else(|e| {
                warn!(target: "Room/Transport", "{e}");
                Produced::default()
            });
            match replies.produces.resolve(produced) {
                Resolution::Delivered => {}
                Resolution::Abandoned(kind, produced) => {
                    warn!(
                        target: "Room/Transport",
                        "Discarding late {kind} producer id {:?}; keeping placeholder",
                        produced.id
                    );
                    let _ = events.handshake_fallback.send(Arc::new(
                        HandshakeFallback::LateProducerIdDiscarded {
                            kind,
                            producer_id: produced.id,
                        },
                    ));
                }
                Resolution::Unmatched(_) => {
                    warn!(target: "Room/Transport", "Unsolicited produced reply");
                }
            }
        }
        other => debug!(target: "Room/Transport", "Unexpected topic {other} on reply listener"),
    }
}

/// The signaling side of a transport's connect and produce handshakes.
struct HandshakeSignaler {
    direction: Direction,
    config: Arc<ClientConfig>,
    signaling: Arc<SignalingChannel>,
    replies: Arc<ReplyQueues>,
    events: Arc<EventBus>,
}

#[async_trait]
impl TransportSignaler for HandshakeSignaler {
    async fn connect(
        &self,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<HandshakeOutcome, TransportError> {
        let (ticket, reply) = self
            .replies
            .connects
            .push(transport_id.clone(), self.config.connect_handshake_timeout());
        let request = TransportConnect {
            server_transport_id: transport_id.clone(),
            dtls_parameters,
        };
        if let Err(e) = self.signaling.send(Topic::TransportConnect, &request).await {
            self.replies.connects.cancel(ticket);
            return Err(e.into());
        }

        match timeout(self.config.connect_handshake_timeout(), reply).await {
            Ok(Ok(())) => Ok(HandshakeOutcome::Confirmed),
            Ok(Err(_)) => Err(TransportError::SignalingClosed("transport-connected")),
            Err(_) => {
                warn!(
                    target: "Room/Transport",
                    "No transport-connected for {transport_id} within {:?}; assuming connected",
                    self.config.connect_handshake_timeout()
                );
                let _ = self.events.handshake_fallback.send(Arc::new(
                    HandshakeFallback::OptimisticConnect {
                        direction: self.direction,
                        transport_id: transport_id.clone(),
                    },
                ));
                Ok(HandshakeOutcome::Optimistic)
            }
        }
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceOutcome, TransportError> {
        let kind = request.kind;
        let (ticket, reply) = self.replies.produces.push(kind, self.config.produce_timeout());
        let message = TransportProduce {
            kind,
            rtp_parameters: request.rtp_parameters,
            app_data: request.app_data,
            server_transport_id: request.transport_id,
        };
        if let Err(e) = self.signaling.send(Topic::TransportProduce, &message).await {
            self.replies.produces.cancel(ticket);
            return Err(e.into());
        }

        let assigned = match timeout(self.config.produce_timeout(), reply).await {
            Ok(Ok(produced)) => produced.id.filter(|id| !id.is_empty()),
            Ok(Err(_)) => return Err(TransportError::SignalingClosed("produced")),
            Err(_) => None,
        };
        if let Some(id) = assigned {
            return Ok(ProduceOutcome::Confirmed(id));
        }

        let placeholder = ProducerId::placeholder(kind, rand::random::<u32>());
        warn!(
            target: "Room/Transport",
            "No producer id for {kind}; continuing as {placeholder}"
        );
        let _ = self.events.handshake_fallback.send(Arc::new(
            HandshakeFallback::PlaceholderProducer {
                kind,
                producer_id: placeholder.clone(),
            },
        ));
        Ok(ProduceOutcome::Placeholder(placeholder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LocalTrack, SignalingOnlyEngine};
    use crate::signaling::mock::{MockPeer, MockSocketFactory};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        manager: Arc<TransportManager>,
        peer: MockPeer,
        events: Arc<EventBus>,
        engine: Arc<SignalingOnlyEngine>,
    }

    async fn fixture(config: ClientConfig, load_capabilities: bool) -> Fixture {
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());
        let factory = Arc::new(MockSocketFactory::new());
        let peer = factory.peer();
        let signaling = SignalingChannel::new(config.clone(), factory, events.clone());
        signaling.connect().await.expect("connect");

        let engine = Arc::new(SignalingOnlyEngine::new());
        let negotiator = Arc::new(CapabilityNegotiator::new(engine.clone()));
        if load_capabilities {
            negotiator
                .load(Some(&json!({"codec": "VP8"})))
                .await
                .expect("load");
        }
        let manager = TransportManager::new(
            config,
            signaling,
            negotiator,
            engine.clone(),
            events.clone(),
        );
        Fixture {
            manager,
            peer,
            events,
            engine,
        }
    }

    fn params(id: &str) -> Value {
        json!({
            "id": id,
            "iceParameters": {},
            "iceCandidates": [],
            "dtlsParameters": {"fingerprints": []}
        })
    }

    #[tokio::test]
    async fn test_create_rejected_before_capabilities() {
        let f = fixture(ClientConfig::default(), false).await;
        assert!(matches!(
            f.manager.create(Direction::Send).await,
            Err(TransportError::CapabilitiesNotReady)
        ));
        assert_eq!(f.peer.sent_count(Topic::CreateWebRtcTransport), 0);
    }

    #[tokio::test]
    async fn test_create_sends_direction_and_installs() {
        let f = fixture(ClientConfig::default(), true).await;
        let manager = f.manager.clone();
        let task = tokio::spawn(async move { manager.create(Direction::Recv).await });

        let request = f.peer.expect(Topic::CreateWebRtcTransport).await;
        assert_eq!(request, json!({"consumer": true, "forceTcp": false}));
        f.peer.push(Topic::CreateWebRtcTransportSuccess, params("R1"));

        let transport = task.await.unwrap().expect("transport");
        assert_eq!(transport.id().as_str(), "R1");
        assert_eq!(f.manager.active_id(Direction::Recv), Some(TransportId::new("R1")));
        assert_eq!(
            f.manager.snapshot(Direction::Recv),
            TransportSnapshot {
                id: Some(TransportId::new("R1")),
                state: TransportState::New
            }
        );
    }

    #[tokio::test]
    async fn test_superseded_reply_is_ignored() {
        let f = fixture(ClientConfig::default(), true).await;

        let first = {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.create(Direction::Send).await })
        };
        f.peer.expect(Topic::CreateWebRtcTransport).await;

        let second = {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.create(Direction::Send).await })
        };
        f.peer.expect(Topic::CreateWebRtcTransport).await;

        assert!(matches!(
            first.await.unwrap(),
            Err(TransportError::Superseded(Direction::Send))
        ));

        // Replies arrive in request order; the first belongs to the superseded request.
        f.peer.push(Topic::CreateWebRtcTransportSuccess, params("T-old"));
        f.peer.push(Topic::CreateWebRtcTransportSuccess, params("T-new"));

        let transport = second.await.unwrap().expect("second transport");
        assert_eq!(transport.id().as_str(), "T-new");
        assert_eq!(f.manager.active_id(Direction::Send), Some(TransportId::new("T-new")));
    }

    #[tokio::test]
    async fn test_error_reply_rejects_creation() {
        let f = fixture(ClientConfig::default(), true).await;
        let manager = f.manager.clone();
        let task = tokio::spawn(async move { manager.create(Direction::Send).await });
        f.peer.expect(Topic::CreateWebRtcTransport).await;
        f.peer
            .push(Topic::CreateWebRtcTransportError, json!({"message": "router gone"}));
        match task.await.unwrap() {
            Err(TransportError::Rejected(message)) => assert_eq!(message, "router gone"),
            other => panic!("unexpected {other:?}", other = other.map(|t| t.id().clone())),
        }
        assert!(f.manager.get(Direction::Send).is_none());
    }

    #[tokio::test]
    async fn test_recreate_closes_previous_transport() {
        let f = fixture(ClientConfig::default(), true).await;
        let mut snapshots = f.manager.subscribe(Direction::Send);

        for id in ["T1", "T2"] {
            let manager = f.manager.clone();
            let task = tokio::spawn(async move { manager.create(Direction::Send).await });
            f.peer.expect(Topic::CreateWebRtcTransport).await;
            f.peer.push(Topic::CreateWebRtcTransportSuccess, params(id));
            task.await.unwrap().expect("transport");
        }

        assert_eq!(f.manager.active_id(Direction::Send), Some(TransportId::new("T2")));
        // The first transport is closed, so injecting into it fails.
        assert!(!f
            .engine
            .inject_state(&TransportId::new("T1"), TransportState::Connecting));
        assert_eq!(snapshots.borrow_and_update().id, Some(TransportId::new("T2")));
    }

    #[tokio::test]
    async fn test_connect_and_produce_fall_back_on_silence() {
        let config = ClientConfig {
            connect_handshake_timeout_ms: 50,
            produce_timeout_ms: 50,
            ..Default::default()
        };
        let f = fixture(config, true).await;
        let mut fallbacks = f.events.handshake_fallback.subscribe();

        let manager = f.manager.clone();
        let task = tokio::spawn(async move { manager.create(Direction::Send).await });
        f.peer.expect(Topic::CreateWebRtcTransport).await;
        f.peer.push(Topic::CreateWebRtcTransportSuccess, params("T1"));
        let transport = task.await.unwrap().expect("transport");

        let track = LocalTrack::new("cam", MediaKind::Video, "cam");
        let producer = transport
            .produce(&track, json!({"mediaTag": "video"}))
            .await
            .expect("produce");

        assert!(producer.id().is_placeholder());
        assert!(producer.id().as_str().starts_with("local-video-"));
        assert_eq!(transport.state(), TransportState::Connected);

        let connect = f.peer.expect(Topic::TransportConnect).await;
        assert_eq!(connect["serverTransportId"], "T1");
        let produce = f.peer.expect(Topic::TransportProduce).await;
        assert_eq!(produce["kind"], "video");
        assert_eq!(produce["appData"]["mediaTag"], "video");

        assert!(matches!(
            fallbacks.recv().await.unwrap().as_ref(),
            HandshakeFallback::OptimisticConnect { .. }
        ));
        assert!(matches!(
            fallbacks.recv().await.unwrap().as_ref(),
            HandshakeFallback::PlaceholderProducer { kind: MediaKind::Video, .. }
        ));

        // A late real id is discarded, not adopted.
        f.peer.push(Topic::Produced, json!({"id": "server-video"}));
        let late = tokio::time::timeout(Duration::from_secs(2), fallbacks.recv())
            .await
            .expect("late id event")
            .unwrap();
        assert_eq!(
            late.as_ref(),
            &HandshakeFallback::LateProducerIdDiscarded {
                kind: MediaKind::Video,
                producer_id: Some(ProducerId::new("server-video")),
            }
        );
        assert!(producer.id().is_placeholder());
    }

    #[tokio::test]
    async fn test_unanswered_produce_does_not_shift_next_reply() {
        let config = ClientConfig {
            produce_timeout_ms: 100,
            ..Default::default()
        };
        let f = fixture(config, true).await;
        let manager = f.manager.clone();
        let task = tokio::spawn(async move { manager.create(Direction::Send).await });
        f.peer.expect(Topic::CreateWebRtcTransport).await;
        f.peer.push(Topic::CreateWebRtcTransportSuccess, params("T1"));
        let transport = task.await.unwrap().expect("transport");

        let peer = f.peer.clone();
        let server = tokio::spawn(async move {
            peer.expect(Topic::TransportConnect).await;
            peer.push(Topic::TransportConnected, Value::Null);
            // The video request is never answered.
            let video = peer.expect(Topic::TransportProduce).await;
            assert_eq!(video["kind"], "video");
            let audio = peer.expect(Topic::TransportProduce).await;
            assert_eq!(audio["kind"], "audio");
            peer.push(Topic::Produced, json!({"id": "PROD-audio"}));
        });

        let camera = LocalTrack::new("cam", MediaKind::Video, "cam");
        let video = transport.produce(&camera, json!({})).await.expect("video");
        assert!(video.id().is_placeholder());

        let mic = LocalTrack::new("mic", MediaKind::Audio, "mic");
        let audio = transport.produce(&mic, json!({})).await.expect("audio");
        server.await.unwrap();
        assert_eq!(audio.id().as_str(), "PROD-audio");
    }

    #[tokio::test]
    async fn test_unanswered_create_does_not_block_next_create() {
        let config = ClientConfig {
            transport_request_timeout_ms: 100,
            ..Default::default()
        };
        let f = fixture(config, true).await;

        let manager = f.manager.clone();
        let lost = tokio::spawn(async move { manager.create(Direction::Send).await });
        f.peer.expect(Topic::CreateWebRtcTransport).await;
        assert!(matches!(
            lost.await.unwrap(),
            Err(TransportError::Timeout(_))
        ));

        let manager = f.manager.clone();
        let task = tokio::spawn(async move { manager.create(Direction::Send).await });
        f.peer.expect(Topic::CreateWebRtcTransport).await;
        f.peer.push(Topic::CreateWebRtcTransportSuccess, params("T2"));
        let transport = task.await.unwrap().expect("transport after a lost reply");
        assert_eq!(transport.id().as_str(), "T2");
        assert_eq!(f.manager.active_id(Direction::Send), Some(TransportId::new("T2")));
    }

    #[tokio::test]
    async fn test_confirmed_handshakes_use_server_ids() {
        let f = fixture(ClientConfig::default(), true).await;
        let manager = f.manager.clone();
        let task = tokio::spawn(async move { manager.create(Direction::Send).await });
        f.peer.expect(Topic::CreateWebRtcTransport).await;
        f.peer.push(Topic::CreateWebRtcTransportSuccess, params("T1"));
        let transport = task.await.unwrap().expect("transport");

        let peer = f.peer.clone();
        let server = tokio::spawn(async move {
            peer.expect(Topic::TransportConnect).await;
            peer.push(Topic::TransportConnected, Value::Null);
            peer.expect(Topic::TransportProduce).await;
            peer.push(Topic::Produced, json!({"id": "PROD-1"}));
        });

        let track = LocalTrack::new("mic", MediaKind::Audio, "mic");
        let producer = transport.produce(&track, json!({})).await.expect("produce");
        server.await.unwrap();
        assert_eq!(producer.id().as_str(), "PROD-1");
    }
}
