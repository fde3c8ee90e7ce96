//! In-memory signaling peer for tests.

use super::socket::{Socket, SocketEvent, SocketFactory};
use async_trait::async_trait;
use roomcore::{Envelope, Topic, protocol};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

struct PeerInner {
    /// Sender feeding the client's current socket, if one is open.
    to_client: Mutex<Option<mpsc::Sender<SocketEvent>>>,
    from_client_tx: mpsc::UnboundedSender<Envelope>,
    from_client_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    stash: Mutex<VecDeque<Envelope>>,
    sent_log: Mutex<Vec<Envelope>>,
}

/// The server side of a mock connection.
#[derive(Clone)]
pub struct MockPeer {
    inner: Arc<PeerInner>,
}

impl MockPeer {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PeerInner {
                to_client: Mutex::new(None),
                from_client_tx: tx,
                from_client_rx: tokio::sync::Mutex::new(rx),
                stash: Mutex::new(VecDeque::new()),
                sent_log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Delivers a message to the client.
    pub fn push(&self, topic: Topic, data: Value) {
        let text = serde_json::to_string(&Envelope::new(topic, data)).expect("encode envelope");
        self.push_raw(text);
    }

    pub fn push_raw(&self, text: String) {
        let guard = self.inner.to_client.lock().expect("peer lock");
        let tx = guard.as_ref().expect("no open socket to push to");
        tx.try_send(SocketEvent::Message(text))
            .expect("client socket buffer full");
    }

    /// Like [`push`](Self::push), but returns false instead of panicking when no socket is open.
    pub fn try_push(&self, topic: Topic, data: Value) -> bool {
        let Ok(text) = serde_json::to_string(&Envelope::new(topic, data)) else {
            return false;
        };
        let guard = self.inner.to_client.lock().expect("peer lock");
        guard
            .as_ref()
            .is_some_and(|tx| tx.try_send(SocketEvent::Message(text)).is_ok())
    }

    /// Closes the client's socket from the server side.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.inner.to_client.lock().expect("peer lock").take() {
            let _ = tx.try_send(SocketEvent::Disconnected);
        }
    }

    /// Waits for the next client message on `topic`, keeping others for later calls.
    pub async fn expect(&self, topic: Topic) -> Value {
        self.try_expect(topic, EXPECT_TIMEOUT)
            .await
            .unwrap_or_else(|| panic!("client never sent {topic}"))
    }

    pub async fn try_expect(&self, topic: Topic, wait: Duration) -> Option<Value> {
        if let Some(data) = self.take_stashed(topic) {
            return Some(data);
        }
        let mut rx = self.inner.from_client_rx.lock().await;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let envelope = tokio::time::timeout_at(deadline, rx.recv()).await.ok()??;
            if envelope.topic() == Some(topic) {
                return Some(envelope.data);
            }
            self.inner
                .stash
                .lock()
                .expect("stash lock")
                .push_back(envelope);
        }
    }

    /// Waits for the next client message on any topic, oldest stashed first.
    pub async fn next_message(&self, wait: Duration) -> Option<(Topic, Value)> {
        loop {
            let stashed = self.inner.stash.lock().expect("stash lock").pop_front();
            let envelope = match stashed {
                Some(envelope) => envelope,
                None => {
                    let mut rx = self.inner.from_client_rx.lock().await;
                    tokio::time::timeout(wait, rx.recv()).await.ok()??
                }
            };
            if let Some(topic) = envelope.topic() {
                return Some((topic, envelope.data));
            }
        }
    }

    /// Whether a client socket is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.to_client.lock().expect("peer lock").is_some()
    }

    fn take_stashed(&self, topic: Topic) -> Option<Value> {
        let mut stash = self.inner.stash.lock().expect("stash lock");
        let index = stash.iter().position(|e| e.topic() == Some(topic))?;
        stash.remove(index).map(|e| e.data)
    }

    /// How many messages on `topic` the client has sent so far.
    pub fn sent_count(&self, topic: Topic) -> usize {
        self.inner
            .sent_log
            .lock()
            .expect("log lock")
            .iter()
            .filter(|e| e.topic() == Some(topic))
            .count()
    }
}

struct MockSocket {
    peer: Arc<PeerInner>,
    open: AtomicBool,
}

#[async_trait]
impl Socket for MockSocket {
    async fn send_text(&self, text: String) -> Result<(), anyhow::Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Socket is closed"));
        }
        let envelope = protocol::decode(&text)?;
        self.peer
            .sent_log
            .lock()
            .expect("log lock")
            .push(envelope.clone());
        self.peer
            .from_client_tx
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("peer gone"))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(tx) = self.peer.to_client.lock().expect("peer lock").take() {
                let _ = tx.try_send(SocketEvent::Disconnected);
            }
        }
    }
}

/// Hands out sockets wired to a single [`MockPeer`].
pub struct MockSocketFactory {
    peer: MockPeer,
    refuse_all: AtomicBool,
    dials: AtomicU32,
}

impl MockSocketFactory {
    pub fn new() -> Self {
        Self {
            peer: MockPeer::new(),
            refuse_all: AtomicBool::new(false),
            dials: AtomicU32::new(0),
        }
    }

    pub fn peer(&self) -> MockPeer {
        self.peer.clone()
    }

    pub fn refuse_all_dials(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketFactory for MockSocketFactory {
    async fn create_socket(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>), anyhow::Error> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("connection refused"));
        }
        let (tx, rx) = mpsc::channel(256);
        tx.try_send(SocketEvent::Connected)
            .map_err(|e| anyhow::anyhow!("mock socket: {e}"))?;
        *self.peer.inner.to_client.lock().expect("peer lock") = Some(tx);
        let socket = Arc::new(MockSocket {
            peer: self.peer.inner.clone(),
            open: AtomicBool::new(true),
        });
        Ok((socket, rx))
    }
}
