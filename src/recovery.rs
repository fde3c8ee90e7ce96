//! Self-healing of the send transport.
//!
//! A `disconnected` send transport gets a grace period and is then
//! recreated together with the receive transport; every live local track
//! is republished and remote publishers are rebound without rediscovery.
//! A `failed` send transport is reported as needing a restart, which also
//! clears all consumption state and asks the server for the roster again.

use crate::config::ClientConfig;
use crate::engine::{LocalTrack, SharedLocalStream};
use crate::error::RecoveryError;
use crate::events::{EventBus, RecoveryEvent, RestartRequired};
use crate::publisher::TrackPublisher;
use crate::signaling::SignalingChannel;
use crate::subscriber::TrackSubscriber;
use crate::transport_manager::{TransportManager, TransportSnapshot};
use log::{error, info, warn};
use roomcore::{Direction, TransportId, TransportState};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryKind {
    /// Recreate both transports and republish; keep the publisher registry.
    Recover,
    /// As `Recover`, but also discard all consumption state.
    Restart,
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryKind::Recover => f.write_str("recover"),
            RecoveryKind::Restart => f.write_str("restart"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// The kind of the sequence that finally succeeded.
    pub kind: RecoveryKind,
    pub producers: usize,
    pub publishers: usize,
    pub send_transport: Option<TransportId>,
    pub recv_transport: Option<TransportId>,
    /// How many times a failed sequence was escalated to a restart.
    pub escalations: u32,
}

pub struct RecoveryController {
    config: Arc<ClientConfig>,
    signaling: Arc<SignalingChannel>,
    transports: Arc<TransportManager>,
    publisher: Arc<TrackPublisher>,
    subscriber: Arc<TrackSubscriber>,
    local: SharedLocalStream,
    events: Arc<EventBus>,
    in_flight: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryController {
    pub fn new(
        config: Arc<ClientConfig>,
        signaling: Arc<SignalingChannel>,
        transports: Arc<TransportManager>,
        publisher: Arc<TrackPublisher>,
        subscriber: Arc<TrackSubscriber>,
        local: SharedLocalStream,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let send_states = transports.subscribe(Direction::Send);
        let controller = Arc::new(Self {
            config,
            signaling,
            transports,
            publisher,
            subscriber,
            local,
            events,
            in_flight: AtomicBool::new(false),
            watcher: Mutex::new(None),
        });
        let watcher = tokio::spawn(watch_send_transport(
            Arc::downgrade(&controller),
            send_states,
        ));
        if let Ok(mut slot) = controller.watcher.lock() {
            *slot = Some(watcher);
        }
        controller
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Recreates both transports and republishes every live local track.
    ///
    /// Tracks come from the session's local stream when there is one, so a
    /// later attempt still republishes them after an earlier one failed.
    pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
        self.run(RecoveryKind::Recover).await
    }

    /// Like [`recover`](Self::recover), and also forces rediscovery of every remote publisher.
    pub async fn restart(&self) -> Result<RecoveryReport, RecoveryError> {
        self.run(RecoveryKind::Restart).await
    }

    async fn run(&self, kind: RecoveryKind) -> Result<RecoveryReport, RecoveryError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!(target: "Room/Recovery", "Ignoring {kind}: another recovery is in progress");
            return Err(RecoveryError::AlreadyInProgress);
        }
        let _guard = scopeguard::guard((), |_| {
            self.in_flight.store(false, Ordering::SeqCst);
        });

        info!(target: "Room/Recovery", "Starting {kind}");
        let _ = self.events.recovery.send(Arc::new(RecoveryEvent::Started(kind)));

        let released = self.publisher.release_all().await;
        // A failed attempt leaves nothing published, so the stream is the source of truth.
        let tracks = match self.local.lock().await.as_ref() {
            Some(stream) => stream.live_tracks(),
            None => released,
        };
        let mut current = kind;
        let mut escalations = 0;
        let result = loop {
            match self.recreate(current, &tracks).await {
                Ok(mut report) => {
                    report.escalations = escalations;
                    break Ok(report);
                }
                Err(RecoveryError::NotConnected) => break Err(RecoveryError::NotConnected),
                Err(e) if escalations < self.config.max_restart_escalations => {
                    escalations += 1;
                    warn!(
                        target: "Room/Recovery",
                        "{current} failed: {e}; escalating to restart ({escalations}/{})",
                        self.config.max_restart_escalations
                    );
                    current = RecoveryKind::Restart;
                }
                Err(e) => break Err(e),
            }
        };

        match &result {
            Ok(report) => {
                info!(
                    target: "Room/Recovery",
                    "{} complete: {} producers, {} publishers",
                    report.kind,
                    report.producers,
                    report.publishers
                );
                let _ = self
                    .events
                    .recovery
                    .send(Arc::new(RecoveryEvent::Completed(report.clone())));
            }
            Err(e) => {
                error!(target: "Room/Recovery", "{kind} failed: {e}");
                let _ = self.events.recovery.send(Arc::new(RecoveryEvent::Failed {
                    kind,
                    error: e.to_string(),
                }));
            }
        }
        result
    }

    async fn recreate(
        &self,
        kind: RecoveryKind,
        tracks: &[LocalTrack],
    ) -> Result<RecoveryReport, RecoveryError> {
        if !self.signaling.is_connected() {
            return Err(RecoveryError::NotConnected);
        }
        // Clears anything a previous failed attempt managed to publish.
        self.publisher.release_all().await;
        self.subscriber.detach();
        if kind == RecoveryKind::Restart {
            self.subscriber.reset();
        }

        self.transports.close_all().await;
        let send = self.transports.create(Direction::Send).await?;
        let recv = self.transports.create(Direction::Recv).await?;

        for track in tracks.iter().filter(|t| !t.is_stopped()) {
            self.publisher.publish(track.clone(), track.kind()).await?;
        }

        match kind {
            RecoveryKind::Recover => self.subscriber.rebind(),
            RecoveryKind::Restart => self.subscriber.request_roster().await?,
        }

        Ok(RecoveryReport {
            kind,
            producers: self.publisher.producer_count().await,
            publishers: self.subscriber.registry_len(),
            send_transport: Some(send.id().clone()),
            recv_transport: Some(recv.id().clone()),
            escalations: 0,
        })
    }

    fn on_send_state(self: &Arc<Self>, snapshot: TransportSnapshot) {
        let Some(transport_id) = snapshot.id else {
            return;
        };
        match snapshot.state {
            TransportState::Disconnected => {
                let grace = self.config.recovery_grace();
                warn!(
                    target: "Room/Recovery",
                    "Send transport {transport_id} disconnected; recovering in {grace:?} unless it comes back"
                );
                let weak = Arc::downgrade(self);
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let Some(this) = weak.upgrade() else { return };
                    let current = this.transports.snapshot(Direction::Send);
                    let still_down = current.id.as_ref() == Some(&transport_id)
                        && !current.state.is_connected()
                        && !current.state.is_closed();
                    if still_down {
                        let _ = this.recover().await;
                    } else {
                        info!(target: "Room/Recovery", "Send transport {transport_id} settled as {}", current.state);
                    }
                });
            }
            TransportState::Failed => {
                let auto_restart = self.config.auto_restart_on_failure;
                error!(
                    target: "Room/Recovery",
                    "Send transport {transport_id} failed; restart required"
                );
                let _ = self.events.restart_required.send(Arc::new(RestartRequired {
                    transport_id,
                    auto_restart,
                }));
                if auto_restart {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _ = this.restart().await;
                    });
                }
            }
            _ => {}
        }
    }
}

impl Drop for RecoveryController {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().ok().and_then(|mut w| w.take()) {
            watcher.abort();
        }
    }
}

async fn watch_send_transport(
    controller: Weak<RecoveryController>,
    mut states: watch::Receiver<TransportSnapshot>,
) {
    while states.changed().await.is_ok() {
        let snapshot = states.borrow_and_update().clone();
        let Some(this) = controller.upgrade() else { break };
        this.on_send_state(snapshot);
    }
}
