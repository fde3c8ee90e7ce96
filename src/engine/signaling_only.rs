//! A media engine without a media plane.
//!
//! Transports, producers and consumers are handles carrying ids, and every
//! handshake is still driven through signaling, so the whole control flow
//! can run against a real session router (or the in-memory peer in tests)
//! without any RTP. Transport states can be injected to exercise recovery.

use super::{
    ConsumerOptions, EngineConsumer, EngineProducer, EngineTransport, LocalCapabilities,
    LocalStream, LocalTrack, MediaEngine, MediaSource, ProduceRequest, TransportOptions,
    TransportSignaler,
};
use crate::error::{DeviceError, NegotiationError, TransportError};
use async_trait::async_trait;
use log::{debug, warn};
use roomcore::{
    CapabilityDescriptor, ConsumerId, Direction, MediaKind, ProducerId, PublisherId, TransportId,
    TransportState,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

#[derive(Default)]
pub struct SignalingOnlyEngine {
    capabilities: Mutex<Option<LocalCapabilities>>,
    transports: Mutex<Vec<Weak<SignalingOnlyTransport>>>,
}

impl SignalingOnlyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(
        &self,
        options: TransportOptions,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn EngineTransport>, TransportError> {
        let capabilities = self
            .capabilities
            .lock()
            .map_err(|_| TransportError::Engine("engine state poisoned".into()))?
            .clone()
            .ok_or(TransportError::CapabilitiesNotReady)?;

        debug!(
            target: "Room/Transport",
            "Building {} transport {} with {} relay servers",
            options.direction,
            options.id,
            options.ice_servers.len()
        );
        let transport = Arc::new(SignalingOnlyTransport {
            id: options.id,
            direction: options.direction,
            capabilities,
            signaler,
            state: watch::Sender::new(TransportState::New),
            handshake: tokio::sync::Mutex::new(()),
            next_mid: AtomicU32::new(0),
        });

        if let Ok(mut transports) = self.transports.lock() {
            transports.retain(|t| t.strong_count() > 0);
            transports.push(Arc::downgrade(&transport));
        }
        Ok(transport)
    }

    fn live_transport(&self, id: &TransportId) -> Option<Arc<SignalingOnlyTransport>> {
        self.transports
            .lock()
            .ok()?
            .iter()
            .filter_map(Weak::upgrade)
            .find(|t| &t.id == id)
    }

    /// Forces a state change on a live transport, as the media plane would report it.
    /// Returns false if the transport is gone or the transition is not allowed.
    pub fn inject_state(&self, id: &TransportId, state: TransportState) -> bool {
        match self.live_transport(id) {
            Some(transport) => transport.set_state(state),
            None => false,
        }
    }
}

#[async_trait]
impl MediaEngine for SignalingOnlyEngine {
    async fn create_capability_set(
        &self,
        descriptor: &CapabilityDescriptor,
    ) -> Result<LocalCapabilities, NegotiationError> {
        let capabilities = LocalCapabilities(descriptor.as_value().clone());
        *self
            .capabilities
            .lock()
            .map_err(|_| NegotiationError::Engine("engine state poisoned".into()))? =
            Some(capabilities.clone());
        Ok(capabilities)
    }

    async fn create_send_transport(
        &self,
        options: TransportOptions,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn EngineTransport>, TransportError> {
        if options.direction != Direction::Send {
            return Err(TransportError::WrongDirection(options.direction));
        }
        self.build(options, signaler)
    }

    async fn create_recv_transport(
        &self,
        options: TransportOptions,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn EngineTransport>, TransportError> {
        if options.direction != Direction::Recv {
            return Err(TransportError::WrongDirection(options.direction));
        }
        self.build(options, signaler)
    }
}

pub struct SignalingOnlyTransport {
    id: TransportId,
    direction: Direction,
    capabilities: LocalCapabilities,
    signaler: Arc<dyn TransportSignaler>,
    state: watch::Sender<TransportState>,
    handshake: tokio::sync::Mutex<()>,
    next_mid: AtomicU32,
}

impl SignalingOnlyTransport {
    fn set_state(&self, next: TransportState) -> bool {
        let mut accepted = false;
        self.state.send_if_modified(|current| match current.transition(next) {
            Ok(state) if state != *current => {
                *current = state;
                accepted = true;
                true
            }
            Ok(_) => {
                accepted = true;
                false
            }
            Err(e) => {
                warn!(target: "Room/Transport", "Transport {}: {e}", self.id);
                false
            }
        });
        accepted
    }

    /// Runs the connect handshake once, on first use.
    async fn ensure_connected(&self) -> Result<(), TransportError> {
        let _guard = self.handshake.lock().await;
        match self.state() {
            TransportState::Closed => Err(TransportError::Closed),
            TransportState::Failed => Err(TransportError::Engine(format!(
                "transport {} has failed",
                self.id
            ))),
            TransportState::New => {
                self.set_state(TransportState::Connecting);
                let dtls_parameters = json!({
                    "role": match self.direction {
                        Direction::Send => "server",
                        Direction::Recv => "client",
                    },
                    "fingerprints": [{
                        "algorithm": "sha-256",
                        "value": format!("{:08X}", rand::random::<u32>()),
                    }],
                });
                match self.signaler.connect(&self.id, dtls_parameters).await {
                    Ok(outcome) => {
                        debug!(target: "Room/Transport", "Transport {} connected ({outcome:?})", self.id);
                        self.set_state(TransportState::Connected);
                        Ok(())
                    }
                    Err(e) => {
                        self.set_state(TransportState::Failed);
                        Err(e)
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn codecs_for(&self, kind: MediaKind) -> Value {
        let codecs = self
            .capabilities
            .as_value()
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| {
                codecs
                    .iter()
                    .filter(|c| c.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Value::Array(codecs)
    }
}

#[async_trait]
impl EngineTransport for SignalingOnlyTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    async fn produce(
        &self,
        track: &LocalTrack,
        app_data: Value,
    ) -> Result<Arc<dyn EngineProducer>, TransportError> {
        if self.direction != Direction::Send {
            return Err(TransportError::WrongDirection(self.direction));
        }
        if track.is_stopped() {
            return Err(TransportError::Engine(format!("track {} has ended", track.id())));
        }
        self.ensure_connected().await?;

        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let rtp_parameters = json!({
            "mid": mid.to_string(),
            "codecs": self.codecs_for(track.kind()),
            "encodings": [{ "ssrc": rand::random::<u32>() }],
        });
        let outcome = self
            .signaler
            .produce(ProduceRequest {
                transport_id: self.id.clone(),
                kind: track.kind(),
                rtp_parameters,
                app_data,
            })
            .await?;

        if self.state().is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(Arc::new(SignalingOnlyProducer {
            id: outcome.id().clone(),
            track: track.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn EngineConsumer>, TransportError> {
        if self.direction != Direction::Recv {
            return Err(TransportError::WrongDirection(self.direction));
        }
        self.ensure_connected().await?;
        if self.state().is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(Arc::new(SignalingOnlyConsumer {
            id: options.id,
            publisher_id: options.publisher_id,
            kind: options.kind,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        self.set_state(TransportState::Closed);
    }
}

#[derive(Debug)]
struct SignalingOnlyProducer {
    id: ProducerId,
    track: LocalTrack,
    closed: AtomicBool,
}

impl EngineProducer for SignalingOnlyProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    fn track(&self) -> &LocalTrack {
        &self.track
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct SignalingOnlyConsumer {
    id: ConsumerId,
    publisher_id: PublisherId,
    kind: MediaKind,
    closed: AtomicBool,
}

impl EngineConsumer for SignalingOnlyConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn publisher_id(&self) -> &PublisherId {
        &self.publisher_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// A capture source that hands out labelled tracks, or a configured device error.
#[derive(Default)]
pub struct SyntheticSource {
    failure: Option<DeviceError>,
    counter: AtomicU32,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: DeviceError) -> Self {
        Self {
            failure: Some(error),
            counter: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn acquire(&self, audio: bool, video: bool) -> Result<LocalStream, DeviceError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut tracks = Vec::new();
        if video {
            tracks.push(LocalTrack::new(
                format!("synthetic-video-{n}"),
                MediaKind::Video,
                "Synthetic camera",
            ));
        }
        if audio {
            tracks.push(LocalTrack::new(
                format!("synthetic-audio-{n}"),
                MediaKind::Audio,
                "Synthetic microphone",
            ));
        }
        Ok(LocalStream { tracks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{HandshakeOutcome, ProduceOutcome};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSignaler {
        connects: AtomicUsize,
        fail_connect: bool,
    }

    #[async_trait]
    impl TransportSignaler for CountingSignaler {
        async fn connect(
            &self,
            _transport_id: &TransportId,
            _dtls_parameters: Value,
        ) -> Result<HandshakeOutcome, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(TransportError::SignalingClosed("transport-connected"));
            }
            Ok(HandshakeOutcome::Confirmed)
        }

        async fn produce(&self, request: ProduceRequest) -> Result<ProduceOutcome, TransportError> {
            Ok(ProduceOutcome::Confirmed(ProducerId::new(format!(
                "server-{}",
                request.kind
            ))))
        }
    }

    async fn engine_with_caps() -> SignalingOnlyEngine {
        let engine = SignalingOnlyEngine::new();
        let descriptor = CapabilityDescriptor::parse(Some(&json!({
            "codecs": [{"kind": "video", "mimeType": "video/VP8"}]
        })))
        .unwrap();
        engine.create_capability_set(&descriptor).await.unwrap();
        engine
    }

    fn options(id: &str, direction: Direction) -> TransportOptions {
        TransportOptions {
            id: TransportId::new(id),
            direction,
            ice_parameters: Value::Null,
            ice_candidates: Value::Null,
            dtls_parameters: Value::Null,
            ice_servers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_first_produce_drives_single_handshake() {
        let engine = engine_with_caps().await;
        let signaler = Arc::new(CountingSignaler::default());
        let transport = engine
            .create_send_transport(options("T1", Direction::Send), signaler.clone())
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::New);

        let track = LocalTrack::new("cam", MediaKind::Video, "cam");
        let producer = transport.produce(&track, json!({})).await.unwrap();
        transport.produce(&track, json!({})).await.unwrap();

        assert_eq!(producer.id().as_str(), "server-video");
        assert_eq!(transport.state(), TransportState::Connected);
        assert_eq!(signaler.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_handshake_marks_transport_failed() {
        let engine = engine_with_caps().await;
        let signaler = Arc::new(CountingSignaler {
            fail_connect: true,
            ..Default::default()
        });
        let transport = engine
            .create_recv_transport(options("R1", Direction::Recv), signaler)
            .await
            .unwrap();
        let result = transport
            .consume(ConsumerOptions {
                id: ConsumerId::new("C1"),
                publisher_id: PublisherId::new("P1"),
                kind: MediaKind::Audio,
                rtp_parameters: Value::Null,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_injected_states_follow_transition_rules() {
        let engine = engine_with_caps().await;
        let transport = engine
            .create_send_transport(
                options("T1", Direction::Send),
                Arc::new(CountingSignaler::default()),
            )
            .await
            .unwrap();
        let id = TransportId::new("T1");
        // new -> disconnected is not a legal jump.
        assert!(!engine.inject_state(&id, TransportState::Disconnected));
        assert!(engine.inject_state(&id, TransportState::Connecting));
        assert!(engine.inject_state(&id, TransportState::Connected));
        assert!(engine.inject_state(&id, TransportState::Disconnected));
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert!(!engine.inject_state(&TransportId::new("gone"), TransportState::Failed));
    }

    #[tokio::test]
    async fn test_wrong_direction_is_rejected() {
        let engine = engine_with_caps().await;
        assert!(matches!(
            engine
                .create_send_transport(
                    options("R", Direction::Recv),
                    Arc::new(CountingSignaler::default())
                )
                .await,
            Err(TransportError::WrongDirection(Direction::Recv))
        ));
    }

    #[tokio::test]
    async fn test_synthetic_source_errors() {
        let source = SyntheticSource::failing(DeviceError::PermissionDenied);
        assert_eq!(
            source.acquire(true, true).await.unwrap_err(),
            DeviceError::PermissionDenied
        );
        let stream = SyntheticSource::new().acquire(true, true).await.unwrap();
        assert_eq!(stream.tracks.len(), 2);
        assert_eq!(stream.tracks[0].kind(), MediaKind::Video);
    }
}
