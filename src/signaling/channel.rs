use super::dispatcher::{HandlerId, OnceWaiter, Subscription, TopicDispatcher};
use super::socket::{Socket, SocketEvent, SocketFactory};
use crate::config::ClientConfig;
use crate::error::SignalingError;
use crate::events::EventBus;
use log::{debug, error, info, trace, warn};
use roomcore::{ConnectionState, Topic, protocol};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::time::sleep;

/// The single signaling connection of a client.
///
/// Owns the socket, reconnects with a bounded number of attempts and a
/// fixed delay, and fans incoming envelopes out to topic handlers. The
/// connection state is published through a watch channel that every other
/// component consults before sending.
pub struct SignalingChannel {
    config: Arc<ClientConfig>,
    factory: Arc<dyn SocketFactory>,
    socket: Mutex<Option<Arc<dyn Socket>>>,
    dispatcher: TopicDispatcher,
    state: watch::Sender<ConnectionState>,
    events: Arc<EventBus>,
    is_running: AtomicBool,
    expected_disconnect: AtomicBool,
    shutdown_notifier: Notify,
}

impl SignalingChannel {
    pub fn new(
        config: Arc<ClientConfig>,
        factory: Arc<dyn SocketFactory>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            socket: Mutex::new(None),
            dispatcher: TopicDispatcher::new(),
            state: watch::Sender::new(ConnectionState::Disconnected),
            events,
            is_running: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
        })
    }

    /// Starts the connection loop and waits for the first outcome.
    ///
    /// Resolves once the socket is up, or fails once reconnection has been
    /// exhausted. After exhaustion the channel stays in `Error` until
    /// `connect` is called again.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SignalingError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::AlreadyRunning);
        }
        self.expected_disconnect.store(false, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);

        let mut state_rx = self.state.subscribe();
        let this = self.clone();
        tokio::spawn(async move { this.run().await });

        let outcome = state_rx
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Error))
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Error);
        match outcome {
            ConnectionState::Connected => Ok(()),
            _ => Err(SignalingError::ReconnectExhausted(
                self.config.reconnect_attempts,
            )),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut failures: u32 = 0;
        while self.is_running.load(Ordering::Relaxed) {
            self.set_state(ConnectionState::Connecting);

            match self.factory.create_socket(&self.config.server_url).await {
                Ok((socket, socket_events)) => {
                    *self.socket.lock().await = Some(socket);
                    let was_connected = self.read_loop(socket_events).await;
                    *self.socket.lock().await = None;
                    if was_connected {
                        failures = 0;
                    }
                }
                Err(e) => {
                    warn!(target: "Room/Signaling", "Failed to connect: {e}");
                }
            }

            if self.expected_disconnect.load(Ordering::Relaxed)
                || !self.is_running.load(Ordering::Relaxed)
            {
                debug!(target: "Room/Signaling", "Connection loop exiting (expected disconnect).");
                break;
            }

            failures += 1;
            if failures > self.config.reconnect_attempts {
                error!(
                    target: "Room/Signaling",
                    "Giving up after {} reconnection attempts",
                    self.config.reconnect_attempts
                );
                self.is_running.store(false, Ordering::Relaxed);
                self.set_state(ConnectionState::Error);
                return;
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = self.config.reconnect_delay();
            info!(
                target: "Room/Signaling",
                "Will attempt to reconnect in {:?} (attempt {}/{})",
                delay, failures, self.config.reconnect_attempts
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_notifier.notified() => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!(target: "Room/Signaling", "Signaling loop has shut down.");
    }

    /// Pumps socket events until the socket goes away. Returns whether it ever connected.
    async fn read_loop(&self, mut socket_events: mpsc::Receiver<SocketEvent>) -> bool {
        let mut connected = false;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Room/Signaling", "Shutdown signaled in read loop.");
                    return connected;
                }
                event = socket_events.recv() => match event {
                    Some(SocketEvent::Connected) => {
                        connected = true;
                        info!(target: "Room/Signaling", "Connected to {}", self.config.server_url);
                        self.set_state(ConnectionState::Connected);
                    }
                    Some(SocketEvent::Message(text)) => self.handle_text(&text),
                    Some(SocketEvent::Disconnected) | None => {
                        if !self.expected_disconnect.load(Ordering::Relaxed) {
                            warn!(target: "Room/Signaling", "Socket disconnected unexpectedly.");
                        }
                        return connected;
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let envelope = match protocol::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "Room/Signaling", "Dropping frame: {e}");
                return;
            }
        };
        let Some(topic) = envelope.topic() else {
            debug!(target: "Room/Signaling", "Ignoring unknown topic '{}'", envelope.event);
            return;
        };
        let delivered = self.dispatcher.dispatch(topic, envelope.data);
        trace!(target: "Room/Signaling", "<-- {topic} ({delivered} handlers)");
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(target: "Room/Signaling", "Connection state -> {next}");
            let _ = self.events.connection.send(next);
        }
    }

    /// Sends one message. Refused while not connected.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        topic: Topic,
        payload: &T,
    ) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let text = protocol::encode(topic, payload)?;
        let socket = self
            .socket
            .lock()
            .await
            .clone()
            .ok_or(SignalingError::NotConnected)?;
        debug!(target: "Room/Signaling", "--> {topic}");
        socket.send_text(text).await?;
        Ok(())
    }

    pub fn on(&self, topic: Topic) -> Subscription {
        self.dispatcher.on(topic)
    }

    pub fn on_many(&self, topics: &[Topic]) -> Subscription {
        self.dispatcher.on_many(topics)
    }

    pub fn once(&self, topic: Topic) -> OnceWaiter {
        self.dispatcher.once(topic)
    }

    pub fn off(&self, topic: Topic, id: HandlerId) -> bool {
        self.dispatcher.off(topic, id)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub async fn disconnect(&self) {
        info!(target: "Room/Signaling", "Disconnecting signaling intentionally.");
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.is_running.store(false, Ordering::Relaxed);
        self.shutdown_notifier.notify_waiters();

        if let Some(socket) = self.socket.lock().await.take() {
            socket.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }
}
