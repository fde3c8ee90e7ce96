//! The room session: one signaling connection, one joined room, and the
//! components that publish, subscribe and recover media within it.

use crate::chat::SessionMessaging;
use crate::config::ClientConfig;
use crate::diagnostics::Diagnostics;
use crate::engine::{LocalStream, MediaEngine, MediaSource, SharedLocalStream};
use crate::error::{ClientError, RecoveryError};
use crate::events::{EventBus, RoomJoined, ServerNotice};
use crate::negotiator::CapabilityNegotiator;
use crate::publisher::{PublishedTrack, TrackPublisher};
use crate::recovery::{RecoveryController, RecoveryReport};
use crate::signaling::{SignalingChannel, SocketFactory, Subscription};
use crate::subscriber::{RemoteStream, TrackSubscriber};
use crate::transport_manager::TransportManager;
use log::{debug, error, info, warn};
use roomcore::chat::ChatMessage;
use roomcore::messages::{ChatPayload, JoinRoom, JoinedRoom, ServerError};
use roomcore::protocol::decode_payload;
use roomcore::{ConnectionState, Direction, MediaKind, RoomId, Topic};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;


/// Progress of joining the current room.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinStatus {
    Idle,
    Pending,
    Joined(RoomJoined),
    Rejected(String),
    RoomFull,
}

/// A client for one room call.
///
/// Must be created inside a tokio runtime: the components start their
/// listener tasks on construction.
pub struct RoomClient {
    config: Arc<ClientConfig>,
    events: Arc<EventBus>,
    signaling: Arc<SignalingChannel>,
    negotiator: Arc<CapabilityNegotiator>,
    transports: Arc<TransportManager>,
    publisher: Arc<TrackPublisher>,
    subscriber: Arc<TrackSubscriber>,
    recovery: Arc<RecoveryController>,
    chat: Arc<SessionMessaging>,
    room: RwLock<Option<RoomId>>,
    join_status: watch::Sender<JoinStatus>,
    local: SharedLocalStream,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl RoomClient {
    pub fn new(
        config: ClientConfig,
        socket_factory: Arc<dyn SocketFactory>,
        engine: Arc<dyn MediaEngine>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());
        let signaling = SignalingChannel::new(config.clone(), socket_factory, events.clone());
        let negotiator = Arc::new(CapabilityNegotiator::new(engine.clone()));
        let transports = TransportManager::new(
            config.clone(),
            signaling.clone(),
            negotiator.clone(),
            engine,
            events.clone(),
        );
        let publisher = Arc::new(TrackPublisher::new(
            signaling.clone(),
            transports.clone(),
            events.clone(),
        ));
        let subscriber = TrackSubscriber::new(
            config.clone(),
            signaling.clone(),
            negotiator.clone(),
            transports.clone(),
            events.clone(),
        );
        let local: SharedLocalStream = Arc::new(tokio::sync::Mutex::new(None));
        let recovery = RecoveryController::new(
            config.clone(),
            signaling.clone(),
            transports.clone(),
            publisher.clone(),
            subscriber.clone(),
            local.clone(),
            events.clone(),
        );
        let chat = Arc::new(SessionMessaging::new(
            config.clone(),
            signaling.clone(),
            events.clone(),
        ));

        let room_messages =
            signaling.on_many(&[Topic::JoinedRoom, Topic::Error, Topic::ChatMessage]);
        let connection = signaling.subscribe_state();

        let client = Arc::new(Self {
            config,
            events,
            signaling,
            negotiator,
            transports,
            publisher,
            subscriber,
            recovery,
            chat,
            room: RwLock::new(None),
            join_status: watch::Sender::new(JoinStatus::Idle),
            local,
            control: Mutex::new(None),
        });
        let control = tokio::spawn(run_control_loop(
            Arc::downgrade(&client),
            room_messages,
            connection,
        ));
        if let Ok(mut slot) = client.control.lock() {
            *slot = Some(control);
        }
        client
    }

    /// Connects signaling and joins `room`, resolving once the server confirms or rejects the join.
    ///
    /// The join is re-sent automatically after every signaling reconnect,
    /// except after a capacity rejection.
    pub async fn connect(&self, room: RoomId) -> Result<RoomJoined, ClientError> {
        if let Ok(mut current) = self.room.write() {
            *current = Some(room.clone());
        }
        self.join_status.send_replace(JoinStatus::Pending);
        let mut status = self.join_status.subscribe();

        if self.signaling.is_connected() {
            self.send_join().await?;
        } else {
            // The control loop sends the join as soon as the socket is up.
            self.signaling.connect().await?;
        }

        let outcome = tokio::time::timeout(
            self.config.transport_request_timeout(),
            status.wait_for(|s| !matches!(s, JoinStatus::Pending)),
        )
        .await
        .map_err(|_| ClientError::JoinTimeout)?
        .map(|s| s.clone())
        .map_err(|_| ClientError::NotJoined)?;

        match outcome {
            JoinStatus::Joined(joined) => Ok(joined),
            JoinStatus::RoomFull => {
                self.signaling.disconnect().await;
                Err(ClientError::RoomFull(room))
            }
            JoinStatus::Rejected(message) => Err(ClientError::JoinRejected(message)),
            JoinStatus::Idle | JoinStatus::Pending => Err(ClientError::NotJoined),
        }
    }

    async fn send_join(&self) -> Result<(), ClientError> {
        let Some(room_name) = self.room_id() else {
            return Err(ClientError::NotJoined);
        };
        info!("Joining room {room_name}");
        self.signaling
            .send(Topic::JoinRoom, &JoinRoom { room_name })
            .await?;
        Ok(())
    }

    async fn on_joined(self: &Arc<Self>, data: Value) {
        let Some(room_id) = self.room_id() else {
            debug!("joinedRoom without a pending join");
            return;
        };
        let joined: JoinedRoom = decode_payload(Topic::JoinedRoom.as_str(), &data).unwrap_or_else(|e| {
            warn!("{e}");
            JoinedRoom::default()
        });
        let codecs = match self.negotiator.load(joined.rtp_capabilities.as_ref()).await {
            Ok(descriptor) => descriptor.codec_names(),
            Err(e) => {
                warn!("Joined {room_id} without usable capabilities: {e}");
                Vec::new()
            }
        };
        let was_joined = self.is_joined();
        let event = RoomJoined { room_id, codecs };
        info!("Joined room {} (codecs: {:?})", event.room_id, event.codecs);
        self.join_status.send_replace(JoinStatus::Joined(event.clone()));
        let _ = self.events.room_joined.send(Arc::new(event));

        if was_joined && self.local.lock().await.is_some() {
            // Rejoined after a signaling reconnect: server-side transports are gone.
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.recovery.restart().await {
                    warn!("Restart after rejoin failed: {e}");
                }
            });
        } else {
            self.subscriber.consume_known();
        }
    }

    fn on_server_error(&self, data: &Value) {
        let server_error = ServerError::from_value(data);
        let room_full = server_error.is_room_full();
        if room_full {
            error!("Server rejected join: {}", server_error.message);
        } else {
            warn!("Server error: {}", server_error.message);
        }
        let pending = matches!(*self.join_status.borrow(), JoinStatus::Pending);
        if pending {
            self.join_status.send_replace(if room_full {
                JoinStatus::RoomFull
            } else {
                JoinStatus::Rejected(server_error.message.clone())
            });
        }
        let _ = self.events.server_error.send(Arc::new(ServerNotice {
            message: server_error.message,
            room_full,
        }));
    }

    async fn on_connection(&self, state: ConnectionState) {
        if !state.is_connected() {
            return;
        }
        let status = self.join_status.borrow().clone();
        match status {
            JoinStatus::Pending | JoinStatus::Joined(_) => {
                if let Err(e) = self.send_join().await {
                    warn!("Failed to send join: {e}");
                }
            }
            JoinStatus::RoomFull => debug!("Not rejoining a full room"),
            JoinStatus::Idle | JoinStatus::Rejected(_) => {}
        }
    }

    /// Acquires local audio and video, opens both transports and publishes video then audio.
    ///
    /// A device error aborts before anything changes; a previously started
    /// stream keeps running in that case.
    pub async fn start_media(
        &self,
        source: &dyn MediaSource,
    ) -> Result<Vec<PublishedTrack>, ClientError> {
        if !self.is_joined() {
            return Err(ClientError::NotJoined);
        }
        let stream = source.acquire(true, true).await?;

        let previous = self.local.lock().await.replace(stream.clone());
        if let Some(previous) = previous {
            info!("Replacing local media");
            self.publisher.release_all().await;
            previous.stop();
        }

        self.transports.ensure(Direction::Send).await?;
        self.transports.ensure(Direction::Recv).await?;

        let mut published = Vec::new();
        for kind in MediaKind::ALL {
            if let Some(track) = stream.track(kind) {
                published.push(self.publisher.publish(track.clone(), kind).await?);
            }
        }
        self.subscriber.request_roster().await?;
        Ok(published)
    }

    /// Flips the microphone. Returns the new enabled state, or `None` without local audio.
    pub async fn toggle_microphone(&self) -> Option<bool> {
        self.toggle(MediaKind::Audio).await
    }

    /// Flips the camera. Returns the new enabled state, or `None` without local video.
    pub async fn toggle_camera(&self) -> Option<bool> {
        self.toggle(MediaKind::Video).await
    }

    async fn toggle(&self, kind: MediaKind) -> Option<bool> {
        let local = self.local.lock().await;
        let track = local.as_ref()?.track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        info!("{kind} {}", if enabled { "enabled" } else { "muted" });
        Some(enabled)
    }

    /// Ends the local `kind` track and closes its producer. Returns false without such a track.
    pub async fn stop_track(&self, kind: MediaKind) -> bool {
        {
            let local = self.local.lock().await;
            let Some(track) = local.as_ref().and_then(|s| s.track(kind)) else {
                return false;
            };
            track.stop();
        }
        self.publisher.unpublish(kind).await;
        info!("Stopped local {kind}");
        true
    }

    pub async fn send_chat(&self, body: &str) -> Result<ChatMessage, ClientError> {
        let room = self.room_id().filter(|_| self.is_joined());
        let Some(room) = room else {
            return Err(ClientError::NotJoined);
        };
        Ok(self.chat.send(&room, body).await?)
    }

    pub async fn recover(&self) -> Result<RecoveryReport, ClientError> {
        self.require_joined()?;
        Ok(self.recovery.recover().await?)
    }

    pub async fn restart(&self) -> Result<RecoveryReport, ClientError> {
        self.require_joined()?;
        Ok(self.recovery.restart().await?)
    }

    fn require_joined(&self) -> Result<(), ClientError> {
        if self.is_joined() {
            Ok(())
        } else {
            Err(RecoveryError::NotConnected.into())
        }
    }

    /// Stops local media, closes both transports, disconnects and forgets the room.
    pub async fn leave(&self) {
        info!("Leaving room");
        if let Some(local) = self.local.lock().await.take() {
            local.stop();
        }
        self.publisher.release_all().await;
        self.subscriber.reset();
        self.transports.close_all().await;
        self.join_status.send_replace(JoinStatus::Idle);
        self.signaling.disconnect().await;
        self.chat.clear();
        self.negotiator.reset();
        if let Ok(mut room) = self.room.write() {
            *room = None;
        }
    }

    /// Starts a diagnostics observer on this client's events.
    pub fn attach_diagnostics(&self) -> Arc<Diagnostics> {
        Diagnostics::attach(&self.events)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.room.read().ok().and_then(|r| r.clone())
    }

    pub fn join_status(&self) -> JoinStatus {
        self.join_status.borrow().clone()
    }

    pub fn is_joined(&self) -> bool {
        matches!(*self.join_status.borrow(), JoinStatus::Joined(_))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.signaling.state()
    }

    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        self.subscriber.streams()
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.chat.messages()
    }

    pub async fn local_stream(&self) -> Option<LocalStream> {
        self.local.lock().await.clone()
    }

    pub fn transports(&self) -> &Arc<TransportManager> {
        &self.transports
    }

    pub fn publisher(&self) -> &Arc<TrackPublisher> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Arc<TrackSubscriber> {
        &self.subscriber
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        if let Some(control) = self.control.lock().ok().and_then(|mut c| c.take()) {
            control.abort();
        }
    }
}

async fn run_control_loop(
    client: Weak<RoomClient>,
    mut messages: Subscription,
    mut connection: watch::Receiver<ConnectionState>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some((topic, data)) = message else { break };
                let Some(this) = client.upgrade() else { break };
                match topic {
                    Topic::JoinedRoom => this.on_joined(data).await,
                    Topic::Error => this.on_server_error(&data),
                    Topic::ChatMessage => match decode_payload::<ChatPayload>(topic.as_str(), &data) {
                        Ok(payload) => {
                            this.chat.on_incoming(payload);
                        }
                        Err(e) => warn!(target: "Room/Chat", "{e}"),
                    },
                    other => debug!("Unexpected topic {other} on room handler"),
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                let Some(this) = client.upgrade() else { break };
                this.on_connection(state).await;
            }
        }
    }
}
