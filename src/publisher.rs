use crate::engine::{EngineProducer, LocalTrack};
use crate::error::{PublishError, TransportError};
use crate::events::{EventBus, ProducerPublished};
use crate::signaling::SignalingChannel;
use crate::transport_manager::TransportManager;
use log::{debug, info, warn};
use roomcore::{Direction, MediaKind, ProducerId, TransportId};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A local track being sent on the send transport.
#[derive(Debug, Clone)]
pub struct PublishedTrack {
    pub kind: MediaKind,
    pub producer: Arc<dyn EngineProducer>,
    pub track: LocalTrack,
    pub transport_id: TransportId,
}

impl PublishedTrack {
    pub fn producer_id(&self) -> &ProducerId {
        self.producer.id()
    }

    fn release(&self) {
        self.producer.close();
    }
}

#[derive(Default)]
struct PublisherState {
    producers: HashMap<MediaKind, PublishedTrack>,
    // Bumped by every publish or release of a kind; a publish that finds
    // its number outdated when the handshake returns was superseded.
    sequence: HashMap<MediaKind, u64>,
}

impl PublisherState {
    fn bump(&mut self, kind: MediaKind) -> u64 {
        let seq = self.sequence.entry(kind).or_insert(0);
        *seq += 1;
        *seq
    }

    fn is_current(&self, kind: MediaKind, seq: u64) -> bool {
        self.sequence.get(&kind).copied() == Some(seq)
    }
}

/// Publishes local tracks, keeping at most one producer per media kind.
pub struct TrackPublisher {
    signaling: Arc<SignalingChannel>,
    transports: Arc<TransportManager>,
    events: Arc<EventBus>,
    state: Mutex<PublisherState>,
}

impl TrackPublisher {
    pub fn new(
        signaling: Arc<SignalingChannel>,
        transports: Arc<TransportManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            signaling,
            transports,
            events,
            state: Mutex::new(PublisherState::default()),
        }
    }

    /// Publishes `track` as `kind`, releasing any producer already active for that kind.
    ///
    /// The send transport is created on demand. If the server never assigns a
    /// producer id the call still succeeds, with a placeholder id.
    pub async fn publish(
        &self,
        track: LocalTrack,
        kind: MediaKind,
    ) -> Result<PublishedTrack, PublishError> {
        if !self.signaling.is_connected() {
            return Err(PublishError::NotConnected);
        }
        if track.kind() != kind {
            return Err(PublishError::KindMismatch {
                track: track.kind(),
                requested: kind,
            });
        }
        if track.is_stopped() {
            return Err(PublishError::TrackEnded);
        }

        let seq = {
            let mut state = self.state.lock().await;
            let seq = state.bump(kind);
            if let Some(previous) = state.producers.remove(&kind) {
                previous.release();
                info!(
                    target: "Room/Publisher",
                    "Released {kind} producer {} before republishing",
                    previous.producer_id()
                );
            }
            seq
        };

        let transport = self.transports.ensure(Direction::Send).await?;
        let producer = transport
            .produce(&track, json!({ "mediaTag": kind.as_str() }))
            .await?;

        let mut state = self.state.lock().await;
        if !state.is_current(kind, seq) {
            producer.close();
            debug!(target: "Room/Publisher", "Dropping superseded {kind} producer {}", producer.id());
            return Err(PublishError::Superseded(kind));
        }
        if !self.transports.is_active(Direction::Send, transport.id()) {
            producer.close();
            return Err(TransportError::Stale(transport.id().clone()).into());
        }
        if track.is_stopped() {
            producer.close();
            return Err(PublishError::TrackEnded);
        }

        let published = PublishedTrack {
            kind,
            producer,
            track,
            transport_id: transport.id().clone(),
        };
        if let Some(displaced) = state.producers.insert(kind, published.clone()) {
            displaced.release();
        }
        drop(state);

        if published.producer_id().is_placeholder() {
            warn!(
                target: "Room/Publisher",
                "Publishing {kind} under placeholder id {}",
                published.producer_id()
            );
        } else {
            info!(
                target: "Room/Publisher",
                "Publishing {kind} as {} on {}",
                published.producer_id(),
                published.transport_id
            );
        }
        let _ = self.events.producer_published.send(Arc::new(ProducerPublished {
            kind,
            producer_id: published.producer_id().clone(),
            track_id: published.track.id().to_string(),
            transport_id: published.transport_id.clone(),
        }));
        Ok(published)
    }

    /// Stops sending `kind`. The track itself is left running.
    pub async fn unpublish(&self, kind: MediaKind) -> Option<PublishedTrack> {
        let mut state = self.state.lock().await;
        state.bump(kind);
        let removed = state.producers.remove(&kind)?;
        removed.release();
        info!(target: "Room/Publisher", "Unpublished {kind} producer {}", removed.producer_id());
        Some(removed)
    }

    /// Closes every producer and returns the tracks that are still live, video first.
    pub async fn release_all(&self) -> Vec<LocalTrack> {
        let mut state = self.state.lock().await;
        let mut tracks = Vec::new();
        for kind in MediaKind::ALL {
            state.bump(kind);
            if let Some(published) = state.producers.remove(&kind) {
                published.release();
                if !published.track.is_stopped() {
                    tracks.push(published.track);
                }
            }
        }
        tracks
    }

    pub async fn active_tracks(&self) -> Vec<PublishedTrack> {
        let state = self.state.lock().await;
        MediaKind::ALL
            .iter()
            .filter_map(|kind| state.producers.get(kind).cloned())
            .collect()
    }

    pub async fn producer(&self, kind: MediaKind) -> Option<ProducerId> {
        self.state
            .lock()
            .await
            .producers
            .get(&kind)
            .map(|p| p.producer_id().clone())
    }

    pub async fn track(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.state
            .lock()
            .await
            .producers
            .get(&kind)
            .map(|p| p.track.clone())
    }

    pub async fn producer_count(&self) -> usize {
        self.state.lock().await.producers.len()
    }
}
