//! Passive observer that folds bus events into a connection-health snapshot.
//!
//! Nothing in the session depends on it; it only listens.

use crate::events::{
    EventBus, HandshakeFallback, ProducerPublished, RecoveryEvent, RemoteStreamRemoved,
    RosterChanged, ServerNotice, TransportStateChanged,
};
use crate::subscriber::RemoteStream;
use chrono::{DateTime, Utc};
use log::warn;
use roomcore::{
    ConnectionState, Direction, MediaKind, ProducerId, PublisherId, TransportId, TransportState,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub signaling: ConnectionState,
    pub send_transport: Option<TransportId>,
    pub send_state: TransportState,
    pub recv_transport: Option<TransportId>,
    pub recv_state: TransportState,
    /// The send transport's state in ICE terms.
    pub ice_state: String,
    pub producers: BTreeMap<MediaKind, ProducerId>,
    /// Publishers with a live consumer.
    pub consumers: usize,
    #[serde(skip)]
    consumed: BTreeSet<PublisherId>,
    pub known_publishers: usize,
    pub optimistic_connects: u32,
    pub placeholder_producers: u32,
    pub late_producer_ids: u32,
    pub recoveries: u32,
    pub recovery_failures: u32,
    pub restarts_required: u32,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

pub fn ice_state(state: TransportState) -> &'static str {
    match state {
        TransportState::New => "new",
        TransportState::Connecting => "checking",
        TransportState::Connected => "connected",
        TransportState::Disconnected => "disconnected",
        TransportState::Failed => "failed",
        TransportState::Closed => "closed",
    }
}

impl DiagnosticsSnapshot {
    fn touch(&mut self) {
        self.last_update = Some(Utc::now());
    }

    fn on_connection(&mut self, state: ConnectionState) {
        self.signaling = state;
        if state == ConnectionState::Error {
            self.last_error = Some("signaling reconnection exhausted".to_string());
        }
    }

    fn on_transport(&mut self, change: &TransportStateChanged) {
        match change.direction {
            Direction::Send => {
                self.send_transport = Some(change.transport_id.clone());
                self.send_state = change.state;
                self.ice_state = ice_state(change.state).to_string();
                if change.state.is_closed() {
                    self.producers.clear();
                }
            }
            Direction::Recv => {
                self.recv_transport = Some(change.transport_id.clone());
                self.recv_state = change.state;
            }
        }
        if change.state == TransportState::Failed {
            self.last_error = Some(format!(
                "{} transport {} failed",
                change.direction, change.transport_id
            ));
        }
    }

    fn on_fallback(&mut self, fallback: &HandshakeFallback) {
        match fallback {
            HandshakeFallback::OptimisticConnect { .. } => self.optimistic_connects += 1,
            HandshakeFallback::PlaceholderProducer { .. } => self.placeholder_producers += 1,
            HandshakeFallback::LateProducerIdDiscarded { .. } => self.late_producer_ids += 1,
        }
    }

    fn on_published(&mut self, published: &ProducerPublished) {
        self.producers
            .insert(published.kind, published.producer_id.clone());
    }

    // A replacement consumer for the same publisher arrives without a removal.
    fn on_stream_added(&mut self, stream: &RemoteStream) {
        self.consumed.insert(stream.publisher_id.clone());
        self.consumers = self.consumed.len();
    }

    fn on_stream_removed(&mut self, removed: &RemoteStreamRemoved) {
        self.consumed.remove(&removed.publisher_id);
        self.consumers = self.consumed.len();
    }

    fn on_roster(&mut self, roster: &RosterChanged) {
        self.known_publishers = roster.size;
    }

    fn on_recovery(&mut self, event: &RecoveryEvent) {
        match event {
            RecoveryEvent::Started(_) => {}
            RecoveryEvent::Completed(_) => self.recoveries += 1,
            RecoveryEvent::Failed { kind, error } => {
                self.recovery_failures += 1;
                self.last_error = Some(format!("{kind} failed: {error}"));
            }
        }
    }

    fn on_server_error(&mut self, notice: &ServerNotice) {
        self.last_error = Some(notice.message.clone());
    }
}

pub struct Diagnostics {
    snapshot: watch::Sender<DiagnosticsSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Diagnostics {
    /// Subscribes to `events` and starts folding them into a snapshot.
    pub fn attach(events: &EventBus) -> Arc<Self> {
        let diagnostics = Arc::new(Self {
            snapshot: watch::Sender::new(DiagnosticsSnapshot {
                ice_state: ice_state(TransportState::New).to_string(),
                ..Default::default()
            }),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(observe(Arc::downgrade(&diagnostics), Receivers::new(events)));
        if let Ok(mut slot) = diagnostics.task.lock() {
            *slot = Some(task);
        }
        diagnostics
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiagnosticsSnapshot> {
        self.snapshot.subscribe()
    }

    fn update(&self, apply: impl FnOnce(&mut DiagnosticsSnapshot)) {
        self.snapshot.send_modify(|snapshot| {
            apply(snapshot);
            snapshot.touch();
        });
    }
}

impl Drop for Diagnostics {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
    }
}

struct Receivers {
    connection: tokio::sync::broadcast::Receiver<ConnectionState>,
    transport: tokio::sync::broadcast::Receiver<Arc<TransportStateChanged>>,
    fallback: tokio::sync::broadcast::Receiver<Arc<HandshakeFallback>>,
    published: tokio::sync::broadcast::Receiver<Arc<ProducerPublished>>,
    roster: tokio::sync::broadcast::Receiver<Arc<RosterChanged>>,
    stream_added: tokio::sync::broadcast::Receiver<Arc<RemoteStream>>,
    stream_removed: tokio::sync::broadcast::Receiver<Arc<RemoteStreamRemoved>>,
    recovery: tokio::sync::broadcast::Receiver<Arc<RecoveryEvent>>,
    restart: tokio::sync::broadcast::Receiver<Arc<crate::events::RestartRequired>>,
    server_error: tokio::sync::broadcast::Receiver<Arc<ServerNotice>>,
}

impl Receivers {
    fn new(events: &EventBus) -> Self {
        Self {
            connection: events.connection.subscribe(),
            transport: events.transport_state.subscribe(),
            fallback: events.handshake_fallback.subscribe(),
            published: events.producer_published.subscribe(),
            roster: events.roster.subscribe(),
            stream_added: events.remote_stream_added.subscribe(),
            stream_removed: events.remote_stream_removed.subscribe(),
            recovery: events.recovery.subscribe(),
            restart: events.restart_required.subscribe(),
            server_error: events.server_error.subscribe(),
        }
    }
}

// Applies one received event, skips over lag, and stops the loop when the bus is gone.
macro_rules! fold {
    ($diagnostics:expr, $received:expr, |$snapshot:ident, $event:ident| $body:expr) => {
        match $received {
            Ok($event) => {
                let Some(diagnostics) = $diagnostics.upgrade() else { break };
                diagnostics.update(|$snapshot| $body);
            }
            Err(RecvError::Lagged(n)) => {
                warn!(target: "Room/Diagnostics", "Diagnostics missed {n} events");
            }
            Err(RecvError::Closed) => break,
        }
    };
}

async fn observe(diagnostics: Weak<Diagnostics>, mut rx: Receivers) {
    loop {
        tokio::select! {
            r = rx.connection.recv() => fold!(diagnostics, r, |s, e| s.on_connection(e)),
            r = rx.transport.recv() => fold!(diagnostics, r, |s, e| s.on_transport(&e)),
            r = rx.fallback.recv() => fold!(diagnostics, r, |s, e| s.on_fallback(&e)),
            r = rx.published.recv() => fold!(diagnostics, r, |s, e| s.on_published(&e)),
            r = rx.roster.recv() => fold!(diagnostics, r, |s, e| s.on_roster(&e)),
            r = rx.stream_added.recv() => fold!(diagnostics, r, |s, e| s.on_stream_added(&e)),
            r = rx.stream_removed.recv() => fold!(diagnostics, r, |s, e| s.on_stream_removed(&e)),
            r = rx.recovery.recv() => fold!(diagnostics, r, |s, e| s.on_recovery(&e)),
            r = rx.restart.recv() => fold!(diagnostics, r, |s, _e| s.restarts_required += 1),
            r = rx.server_error.recv() => fold!(diagnostics, r, |s, e| s.on_server_error(&e)),
        }
    }
}
