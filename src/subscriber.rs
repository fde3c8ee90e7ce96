//! Discovery and consumption of remote publishers.
//!
//! Roster pushes and live notifications feed the [`PublisherRegistry`].
//! Each announced publisher is consumed on the receive transport at most
//! once; attempts that cannot start yet are deferred and retried, either
//! after a short delay or when the receive transport reports `connected`.

use crate::config::ClientConfig;
use crate::engine::{ConsumerOptions, EngineConsumer};
use crate::error::SubscribeError;
use crate::events::{EventBus, RemoteStreamRemoved, RosterChanged};
use crate::negotiator::CapabilityNegotiator;
use crate::signaling::{SignalingChannel, Subscription};
use crate::transport_manager::{TransportManager, TransportSnapshot};
use log::{debug, info, warn};
use roomcore::messages::{ConsumeRequest, Consumed, parse_publisher_id, parse_publisher_list};
use roomcore::protocol::decode_payload;
use roomcore::{
    BeginConsume, ConsumerId, ConsumptionStatus, Direction, MediaKind, PublisherId,
    PublisherRegistry, Topic, TransportId, TransportState,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A remote publisher bound to a consumer on the receive transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub publisher_id: PublisherId,
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
}

/// What a call to [`TrackSubscriber::consume`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// A `consume` request is on the wire.
    Requested,
    /// Already consuming or consumed.
    AlreadyActive,
    /// The receive transport was not usable; a retry is scheduled.
    Deferred,
    /// Not in the registry.
    Unknown,
    /// The publisher was removed while the receive transport was being prepared.
    Stale,
}

#[derive(Default)]
struct SubscriberState {
    registry: PublisherRegistry,
    consumers: HashMap<PublisherId, Arc<dyn EngineConsumer>>,
    streams: HashMap<PublisherId, RemoteStream>,
    retries: HashMap<PublisherId, u32>,
}

pub struct TrackSubscriber {
    config: Arc<ClientConfig>,
    signaling: Arc<SignalingChannel>,
    negotiator: Arc<CapabilityNegotiator>,
    transports: Arc<TransportManager>,
    events: Arc<EventBus>,
    state: Mutex<SubscriberState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TrackSubscriber {
    pub fn new(
        config: Arc<ClientConfig>,
        signaling: Arc<SignalingChannel>,
        negotiator: Arc<CapabilityNegotiator>,
        transports: Arc<TransportManager>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let subscription = signaling.on_many(&[
            Topic::ProducerList,
            Topic::NewProducer,
            Topic::ProducerClosed,
            Topic::Consumed,
            Topic::ConsumerResumed,
        ]);
        let recv_states = transports.subscribe(Direction::Recv);
        let subscriber = Arc::new(Self {
            config,
            signaling,
            negotiator,
            transports,
            events,
            state: Mutex::new(SubscriberState::default()),
            listener: Mutex::new(None),
        });
        let listener = tokio::spawn(run_listener(
            Arc::downgrade(&subscriber),
            subscription,
            recv_states,
        ));
        if let Ok(mut slot) = subscriber.listener.lock() {
            *slot = Some(listener);
        }
        subscriber
    }

    fn state(&self) -> MutexGuard<'_, SubscriberState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(self: &Arc<Self>, topic: Topic, data: Value) {
        match topic {
            Topic::ProducerList => {
                let added = self.announce(parse_publisher_list(&data));
                for id in added {
                    self.spawn_consume(id);
                }
            }
            Topic::NewProducer => match parse_publisher_id(&data) {
                Some(id) => {
                    if self.announce([id.clone()]).is_empty() {
                        debug!(target: "Room/Subscriber", "Duplicate newProducer for {id}");
                    } else {
                        self.spawn_consume(id);
                    }
                }
                None => warn!(target: "Room/Subscriber", "newProducer without a publisher id: {data}"),
            },
            Topic::ProducerClosed => match parse_publisher_id(&data) {
                Some(id) => self.remove(&id),
                None => warn!(target: "Room/Subscriber", "producerClosed without a publisher id: {data}"),
            },
            Topic::Consumed => match decode_payload::<Consumed>(topic.as_str(), &data) {
                Ok(consumed) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.on_consumed(consumed).await });
                }
                Err(e) => warn!(target: "Room/Subscriber", "{e}"),
            },
            Topic::ConsumerResumed => {
                debug!(target: "Room/Subscriber", "Server resumed consumer: {data}");
            }
            other => debug!(target: "Room/Subscriber", "Unexpected topic {other}"),
        }
    }

    /// Adds publishers to the registry and returns the ones that were new.
    pub fn announce<I>(&self, ids: I) -> Vec<PublisherId>
    where
        I: IntoIterator<Item = PublisherId>,
    {
        let (added, size) = {
            let mut state = self.state();
            let added = state.registry.announce_all(ids);
            (added, state.registry.len())
        };
        if !added.is_empty() {
            info!(target: "Room/Subscriber", "New publishers: {added:?} (roster size {size})");
            let _ = self.events.roster.send(Arc::new(RosterChanged {
                added: added.clone(),
                removed: Vec::new(),
                size,
            }));
        }
        added
    }

    /// Forgets a publisher and tears down whatever was consuming it.
    pub fn remove(&self, id: &PublisherId) {
        let (entry, consumer, stream, size) = {
            let mut state = self.state();
            let entry = state.registry.remove(id);
            let consumer = state.consumers.remove(id);
            let stream = state.streams.remove(id);
            state.retries.remove(id);
            (entry, consumer, stream, state.registry.len())
        };
        if let Some(consumer) = consumer {
            consumer.close();
        }
        if stream.is_some() {
            let _ = self
                .events
                .remote_stream_removed
                .send(Arc::new(RemoteStreamRemoved {
                    publisher_id: id.clone(),
                }));
        }
        match entry {
            Some(status) => {
                info!(target: "Room/Subscriber", "Publisher {id} closed (was {status:?})");
                let _ = self.events.roster.send(Arc::new(RosterChanged {
                    added: Vec::new(),
                    removed: vec![id.clone()],
                    size,
                }));
            }
            None => debug!(target: "Room/Subscriber", "producerClosed for unknown publisher {id}"),
        }
    }

    fn spawn_consume(self: &Arc<Self>, id: PublisherId) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.consume(&id).await {
                debug!(target: "Room/Subscriber", "Consume of {id} not started: {e}");
            }
        });
    }

    /// Starts consuming a known publisher.
    ///
    /// No-op for publishers already consuming or consumed. If the receive
    /// transport cannot be obtained or is not usable the entry stays
    /// `known` and a retry is scheduled.
    pub async fn consume(self: &Arc<Self>, id: &PublisherId) -> Result<ConsumeOutcome, SubscribeError> {
        if !self.signaling.is_connected() {
            return Err(SubscribeError::NotConnected);
        }
        let capabilities = self
            .negotiator
            .local()
            .map_err(|_| SubscribeError::CapabilitiesNotReady)?;

        let attempt = match self.state().registry.begin_consuming(id) {
            BeginConsume::Started(attempt) => attempt,
            BeginConsume::AlreadyActive => {
                debug!(target: "Room/Subscriber", "Already consuming {id}");
                return Ok(ConsumeOutcome::AlreadyActive);
            }
            BeginConsume::Unknown => return Ok(ConsumeOutcome::Unknown),
        };

        let transport = match self.transports.ensure(Direction::Recv).await {
            Ok(transport) if transport.state().is_usable() => transport,
            Ok(transport) => {
                debug!(
                    target: "Room/Subscriber",
                    "Receive transport {} is {}; deferring {id}",
                    transport.id(),
                    transport.state()
                );
                self.defer(id, attempt);
                return Ok(ConsumeOutcome::Deferred);
            }
            Err(e) => {
                debug!(target: "Room/Subscriber", "No receive transport for {id} yet: {e}");
                self.defer(id, attempt);
                return Ok(ConsumeOutcome::Deferred);
            }
        };

        if !self
            .state()
            .registry
            .bind_transport(id, attempt, transport.id().clone())
        {
            return Ok(ConsumeOutcome::Stale);
        }

        let request = ConsumeRequest {
            rtp_capabilities: capabilities.0,
            remote_producer_id: id.clone(),
            server_consumer_transport_id: transport.id().clone(),
        };
        if let Err(e) = self.signaling.send(Topic::Consume, &request).await {
            self.state().registry.revert(id, attempt);
            return Err(e.into());
        }
        debug!(target: "Room/Subscriber", "Requested consumer for {id} on {}", transport.id());
        self.spawn_watchdog(id.clone(), attempt);
        Ok(ConsumeOutcome::Requested)
    }

    fn defer(self: &Arc<Self>, id: &PublisherId, attempt: u64) {
        if self.state().registry.revert(id, attempt) {
            self.schedule_retry(id.clone());
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: PublisherId) {
        let count = {
            let mut state = self.state();
            let count = state.retries.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count > self.config.consume_retry_limit {
            warn!(
                target: "Room/Subscriber",
                "Stopped retrying {id} after {} attempts; waiting for the receive transport",
                self.config.consume_retry_limit
            );
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.consume_retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                if let Err(e) = this.consume(&id).await {
                    debug!(target: "Room/Subscriber", "Retry of {id} not started: {e}");
                }
            }
        });
    }

    fn spawn_watchdog(self: &Arc<Self>, id: PublisherId, attempt: u64) {
        let weak = Arc::downgrade(self);
        let wait = self.config.consume_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(this) = weak.upgrade() else { return };
            if this.state().registry.revert(&id, attempt) {
                warn!(target: "Room/Subscriber", "No consumed reply for {id} within {wait:?}");
                this.schedule_retry(id);
            }
        });
    }

    async fn on_consumed(self: Arc<Self>, consumed: Consumed) {
        let id = consumed.producer_id.clone();
        let (attempt, bound) = match self.state().registry.pending_attempt(&id) {
            Some((attempt, Some(bound))) => (attempt, bound.clone()),
            _ => {
                debug!(target: "Room/Subscriber", "Ignoring consumed for {id}: no attempt in flight");
                return;
            }
        };
        let Some(transport) = self
            .transports
            .get(Direction::Recv)
            .filter(|t| t.id() == &bound)
        else {
            warn!(target: "Room/Subscriber", "Consumed for {id} arrived on stale transport {bound}");
            self.defer(&id, attempt);
            return;
        };

        let consumer = match transport
            .consume(ConsumerOptions {
                id: consumed.id,
                publisher_id: id.clone(),
                kind: consumed.kind,
                rtp_parameters: consumed.rtp_parameters,
            })
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(target: "Room/Subscriber", "Failed to bind consumer for {id}: {e}");
                self.defer(&id, attempt);
                return;
            }
        };

        let stream = {
            let mut state = self.state();
            let still_active = self.transports.is_active(Direction::Recv, &bound);
            if !still_active || !state.registry.complete(&id, attempt, consumer.id().clone()) {
                drop(state);
                consumer.close();
                debug!(target: "Room/Subscriber", "Dropping consumer for {id}: attempt superseded");
                return;
            }
            let stream = RemoteStream {
                publisher_id: id.clone(),
                consumer_id: consumer.id().clone(),
                kind: consumer.kind(),
                transport_id: bound,
            };
            if let Some(previous) = state.consumers.insert(id.clone(), consumer) {
                previous.close();
            }
            state.streams.insert(id.clone(), stream.clone());
            state.retries.remove(&id);
            stream
        };
        info!(
            target: "Room/Subscriber",
            "Consuming {} from {id} as {}",
            stream.kind,
            stream.consumer_id
        );
        let _ = self.events.remote_stream_added.send(Arc::new(stream));
    }

    /// Starts every publisher still waiting in `known`.
    pub fn consume_known(self: &Arc<Self>) {
        let known = self.state().registry.known_ids();
        if !known.is_empty() {
            debug!(target: "Room/Subscriber", "Consuming {} known publishers", known.len());
        }
        for id in known {
            self.spawn_consume(id);
        }
    }

    /// Closes every consumer and drops every exposed stream. The registry is left as is.
    pub fn detach(&self) -> Vec<PublisherId> {
        let (consumers, streams) = {
            let mut state = self.state();
            let consumers: Vec<_> = state.consumers.drain().map(|(_, c)| c).collect();
            let streams: Vec<_> = state.streams.drain().map(|(id, _)| id).collect();
            (consumers, streams)
        };
        for consumer in consumers {
            consumer.close();
        }
        for publisher_id in &streams {
            let _ = self
                .events
                .remote_stream_removed
                .send(Arc::new(RemoteStreamRemoved {
                    publisher_id: publisher_id.clone(),
                }));
        }
        streams
    }

    /// Returns every entry to `known` and consumes them again on the current receive transport.
    pub fn rebind(self: &Arc<Self>) {
        let ids = {
            let mut state = self.state();
            state.retries.clear();
            state.registry.reset_to_known()
        };
        info!(target: "Room/Subscriber", "Rebinding {} publishers", ids.len());
        self.consume_known();
    }

    /// Forgets every publisher. The next roster push repopulates the registry.
    pub fn reset(&self) {
        self.detach();
        let removed = {
            let mut state = self.state();
            let removed = state.registry.ids();
            state.registry.clear();
            state.retries.clear();
            removed
        };
        if !removed.is_empty() {
            info!(target: "Room/Subscriber", "Cleared {} publishers", removed.len());
            let _ = self.events.roster.send(Arc::new(RosterChanged {
                added: Vec::new(),
                removed,
                size: 0,
            }));
        }
    }

    /// Asks the server for the current roster.
    pub async fn request_roster(&self) -> Result<(), SubscribeError> {
        self.signaling.send(Topic::GetProducers, &Value::Null).await?;
        Ok(())
    }

    /// Exposed streams, ordered by publisher id.
    pub fn streams(&self) -> Vec<RemoteStream> {
        let mut streams: Vec<_> = self.state().streams.values().cloned().collect();
        streams.sort_by(|a, b| a.publisher_id.cmp(&b.publisher_id));
        streams
    }

    pub fn stream(&self, id: &PublisherId) -> Option<RemoteStream> {
        self.state().streams.get(id).cloned()
    }

    pub fn status(&self, id: &PublisherId) -> Option<ConsumptionStatus> {
        self.state().registry.status(id).cloned()
    }

    pub fn known_publishers(&self) -> Vec<PublisherId> {
        self.state().registry.ids()
    }

    pub fn registry_len(&self) -> usize {
        self.state().registry.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.state().consumers.len()
    }
}

impl Drop for TrackSubscriber {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().ok().and_then(|mut l| l.take()) {
            listener.abort();
        }
    }
}

async fn run_listener(
    subscriber: Weak<TrackSubscriber>,
    mut subscription: Subscription,
    mut recv_states: watch::Receiver<TransportSnapshot>,
) {
    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some((topic, data)) = message else { break };
                let Some(this) = subscriber.upgrade() else { break };
                this.handle(topic, data);
            }
            changed = recv_states.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = recv_states.borrow_and_update().state == TransportState::Connected;
                if connected {
                    let Some(this) = subscriber.upgrade() else { break };
                    this.consume_known();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SignalingOnlyEngine;
    use crate::signaling::mock::{MockPeer, MockSocketFactory};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Fixture {
        subscriber: Arc<TrackSubscriber>,
        negotiator: Arc<CapabilityNegotiator>,
        peer: MockPeer,
        events: Arc<EventBus>,
    }

    async fn fixture() -> Fixture {
        let config = Arc::new(ClientConfig::default());
        let events = Arc::new(EventBus::new());
        let factory = Arc::new(MockSocketFactory::new());
        let peer = factory.peer();
        let signaling = SignalingChannel::new(config.clone(), factory, events.clone());
        signaling.connect().await.expect("connect");
        let engine = Arc::new(SignalingOnlyEngine::new());
        let negotiator = Arc::new(CapabilityNegotiator::new(engine.clone()));
        let transports = TransportManager::new(
            config.clone(),
            signaling.clone(),
            negotiator.clone(),
            engine,
            events.clone(),
        );
        let subscriber = TrackSubscriber::new(
            config,
            signaling,
            negotiator.clone(),
            transports,
            events.clone(),
        );
        Fixture {
            subscriber,
            negotiator,
            peer,
            events,
        }
    }

    async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn test_roster_deduplicates_notifications() {
        let f = fixture().await;
        let mut roster = f.events.roster.subscribe();

        f.peer.push(Topic::NewProducer, json!("P1"));
        f.peer.push(Topic::NewProducer, json!({"producerId": "P1"}));
        f.peer.push(Topic::ProducerList, json!(["P1", "P2", null, ""]));
        f.peer.push(Topic::ProducerClosed, json!("P1"));
        f.peer.push(Topic::ProducerClosed, json!("P1"));

        assert_eq!(next(&mut roster).await.added, vec![PublisherId::new("P1")]);
        assert_eq!(next(&mut roster).await.added, vec![PublisherId::new("P2")]);
        let closed = next(&mut roster).await;
        assert_eq!(closed.removed, vec![PublisherId::new("P1")]);
        assert_eq!(closed.size, 1);

        // Capabilities were never loaded, so nothing left `known`.
        assert_eq!(f.subscriber.registry_len(), 1);
        assert_eq!(
            f.subscriber.status(&PublisherId::new("P2")),
            Some(ConsumptionStatus::Known)
        );
        assert_eq!(f.peer.sent_count(Topic::Consume), 0);
    }

    #[tokio::test]
    async fn test_consume_rejected_before_capabilities() {
        let f = fixture().await;
        let id = PublisherId::new("P1");
        f.subscriber.announce([id.clone()]);
        assert!(matches!(
            f.subscriber.consume(&id).await,
            Err(SubscribeError::CapabilitiesNotReady)
        ));
        assert_eq!(f.subscriber.status(&id), Some(ConsumptionStatus::Known));
    }

    #[tokio::test]
    async fn test_concurrent_consume_yields_one_consumer() {
        let f = fixture().await;
        f.negotiator
            .load(Some(&json!({"codec": "VP8"})))
            .await
            .expect("load");
        let mut added = f.events.remote_stream_added.subscribe();
        let id = PublisherId::new("P1");
        f.subscriber.announce([id.clone()]);

        let peer = f.peer.clone();
        let server = tokio::spawn(async move {
            peer.expect(Topic::CreateWebRtcTransport).await;
            peer.push(
                Topic::CreateWebRtcTransportSuccess,
                json!({"id": "R1", "iceParameters": {}, "iceCandidates": [], "dtlsParameters": {}}),
            );
            let request = peer.expect(Topic::Consume).await;
            assert_eq!(request["remoteProducerId"], "P1");
            assert_eq!(request["serverConsumerTransportId"], "R1");
            peer.push(
                Topic::Consumed,
                json!({"id": "C1", "kind": "video", "rtpParameters": {}, "producerId": "P1"}),
            );
            peer.expect(Topic::TransportConnect).await;
            peer.push(Topic::TransportConnected, Value::Null);
        });

        let (a, b) = tokio::join!(f.subscriber.consume(&id), f.subscriber.consume(&id));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == ConsumeOutcome::Requested);
        assert_eq!(
            outcomes,
            vec![ConsumeOutcome::AlreadyActive, ConsumeOutcome::Requested]
        );

        let stream = next(&mut added).await;
        server.await.unwrap();
        assert_eq!(stream.publisher_id, id);
        assert_eq!(stream.consumer_id.as_str(), "C1");
        assert_eq!(f.subscriber.consumer_count(), 1);
        assert_eq!(f.subscriber.streams().len(), 1);
        assert_eq!(f.peer.sent_count(Topic::Consume), 1);
        assert!(matches!(
            f.subscriber.status(&id),
            Some(ConsumptionStatus::Consumed { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_removes_consumed_stream() {
        let f = fixture().await;
        f.negotiator
            .load(Some(&json!({"codec": "VP8"})))
            .await
            .expect("load");
        let mut added = f.events.remote_stream_added.subscribe();
        let mut removed = f.events.remote_stream_removed.subscribe();

        let peer = f.peer.clone();
        let server = tokio::spawn(async move {
            peer.expect(Topic::CreateWebRtcTransport).await;
            peer.push(
                Topic::CreateWebRtcTransportSuccess,
                json!({"id": "R1", "iceParameters": {}, "iceCandidates": [], "dtlsParameters": {}}),
            );
            peer.expect(Topic::Consume).await;
            peer.push(
                Topic::Consumed,
                json!({"id": "C9", "kind": "audio", "rtpParameters": {}, "producerId": "P9"}),
            );
            peer.expect(Topic::TransportConnect).await;
            peer.push(Topic::TransportConnected, Value::Null);
        });
        f.peer.push(Topic::NewProducer, json!("P9"));
        next(&mut added).await;
        server.await.unwrap();

        f.peer.push(Topic::ProducerClosed, json!({"producerId": "P9"}));
        assert_eq!(next(&mut removed).await.publisher_id.as_str(), "P9");
        assert!(f.subscriber.streams().is_empty());
        assert_eq!(f.subscriber.registry_len(), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_registry() {
        let f = fixture().await;
        f.subscriber
            .announce([PublisherId::new("A"), PublisherId::new("B")]);
        f.subscriber.reset();
        assert_eq!(f.subscriber.registry_len(), 0);

        f.subscriber.request_roster().await.expect("roster request");
        assert_eq!(f.peer.expect(Topic::GetProducers).await, Value::Null);
    }
}
