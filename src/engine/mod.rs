//! Seams to the media engine and the capture devices.
//!
//! The engine turns capability descriptors and server-issued transport
//! parameters into live transports. It never talks to the signaling
//! server itself: every handshake it needs goes back through the
//! [`TransportSignaler`] it was handed at creation time.

pub mod signaling_only;

use crate::config::IceServer;
use crate::error::{DeviceError, NegotiationError, TransportError};
use async_trait::async_trait;
use roomcore::{
    CapabilityDescriptor, ConsumerId, Direction, MediaKind, ProducerId, PublisherId, TransportId,
    TransportState,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

pub use signaling_only::{SignalingOnlyEngine, SyntheticSource};

/// A captured local track. Clones share the same enabled/stopped flags.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Tracks that have not been stopped, video first.
    pub fn live_tracks(&self) -> Vec<LocalTrack> {
        MediaKind::ALL
            .into_iter()
            .filter_map(|kind| self.track(kind))
            .filter(|t| !t.is_stopped())
            .cloned()
            .collect()
    }
}

/// The session's current local stream. Recovery republishes from it.
pub type SharedLocalStream = Arc<tokio::sync::Mutex<Option<LocalStream>>>;

/// Capture device access.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, audio: bool, video: bool) -> Result<LocalStream, DeviceError>;
}

/// The engine-side capability set derived from the room's descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCapabilities(pub Value);

impl LocalCapabilities {
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Everything the engine needs to build a transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub id: TransportId,
    pub direction: Direction,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub ice_servers: Vec<IceServer>,
}

/// How a connect handshake resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Confirmed,
    /// No confirmation within the handshake window; success was assumed.
    Optimistic,
}

/// How a produce handshake resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProduceOutcome {
    Confirmed(ProducerId),
    /// No id assigned within the produce window; running under a local id.
    Placeholder(ProducerId),
}

impl ProduceOutcome {
    pub fn id(&self) -> &ProducerId {
        match self {
            Self::Confirmed(id) | Self::Placeholder(id) => id,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub publisher_id: PublisherId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// The signaling round trips a transport needs from the client.
#[async_trait]
pub trait TransportSignaler: Send + Sync {
    async fn connect(
        &self,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<HandshakeOutcome, TransportError>;

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceOutcome, TransportError>;
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_capability_set(
        &self,
        descriptor: &CapabilityDescriptor,
    ) -> Result<LocalCapabilities, NegotiationError>;

    async fn create_send_transport(
        &self,
        options: TransportOptions,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn EngineTransport>, TransportError>;

    async fn create_recv_transport(
        &self,
        options: TransportOptions,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn EngineTransport>, TransportError>;
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &TransportId;
    fn direction(&self) -> Direction;
    fn state(&self) -> TransportState;
    fn subscribe_state(&self) -> watch::Receiver<TransportState>;

    /// Publishes `track`. The first call drives the connect handshake.
    async fn produce(
        &self,
        track: &LocalTrack,
        app_data: Value,
    ) -> Result<Arc<dyn EngineProducer>, TransportError>;

    /// Binds a server-side consumer. The first call drives the connect handshake.
    async fn consume(
        &self,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn EngineConsumer>, TransportError>;

    async fn close(&self);
}

pub trait EngineProducer: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> &LocalTrack;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait EngineConsumer: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &ConsumerId;
    fn publisher_id(&self) -> &PublisherId;
    fn kind(&self) -> MediaKind;
    fn close(&self);
    fn is_closed(&self) -> bool;
}
