use crate::recovery::{RecoveryKind, RecoveryReport};
use crate::subscriber::RemoteStream;
use roomcore::chat::ChatMessage;
use roomcore::{
    ConnectionState, Direction, MediaKind, ProducerId, PublisherId, RoomId, TransportId,
    TransportState,
};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct RoomJoined {
    pub room_id: RoomId,
    pub codecs: Vec<String>,
}

/// A server `error` message. `room_full` marks a capacity rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNotice {
    pub message: String,
    pub room_full: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStateChanged {
    pub direction: Direction,
    pub transport_id: TransportId,
    pub state: TransportState,
}

/// A round trip that completed without the peer's confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFallback {
    /// `transport-connected` never arrived; the handshake was assumed to succeed.
    OptimisticConnect {
        direction: Direction,
        transport_id: TransportId,
    },
    /// `produced` never arrived; the producer runs under a local id.
    PlaceholderProducer {
        kind: MediaKind,
        producer_id: ProducerId,
    },
    /// A `produced` reply arrived after its request had fallen back. The id is not adopted.
    LateProducerIdDiscarded {
        kind: MediaKind,
        producer_id: Option<ProducerId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerPublished {
    pub kind: MediaKind,
    pub producer_id: ProducerId,
    pub track_id: String,
    pub transport_id: TransportId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterChanged {
    pub added: Vec<PublisherId>,
    pub removed: Vec<PublisherId>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStreamRemoved {
    pub publisher_id: PublisherId,
}

#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    Started(RecoveryKind),
    Completed(RecoveryReport),
    Failed { kind: RecoveryKind, error: String },
}

/// The send transport failed; a full restart is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequired {
    pub transport_id: TransportId,
    pub auto_restart: bool,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Signaling and room
    (connection, ConnectionState),
    (room_joined, Arc<RoomJoined>),
    (server_error, Arc<ServerNotice>),

    // Transports and handshakes
    (transport_state, Arc<TransportStateChanged>),
    (handshake_fallback, Arc<HandshakeFallback>),
    (producer_published, Arc<ProducerPublished>),

    // Remote publishers
    (roster, Arc<RosterChanged>),
    (remote_stream_added, Arc<RemoteStream>),
    (remote_stream_removed, Arc<RemoteStreamRemoved>),

    (chat, Arc<ChatMessage>),

    // Recovery
    (recovery, Arc<RecoveryEvent>),
    (restart_required, Arc<RestartRequired>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
