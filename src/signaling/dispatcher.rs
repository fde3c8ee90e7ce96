//! Topic-keyed handler registry.
//!
//! Every handler registered for a topic receives every message on that
//! topic, in receipt order. One-shot handlers fire at most once and are
//! removed as they fire; persistent handlers are pruned once their
//! receiving side is dropped.

use dashmap::DashMap;
use roomcore::Topic;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

enum Handler {
    Persistent(mpsc::UnboundedSender<(Topic, Value)>),
    Once(Option<oneshot::Sender<Value>>),
}

/// A persistent registration on one or more topics.
pub struct Subscription {
    id: HandlerId,
    topics: Vec<Topic>,
    rx: mpsc::UnboundedReceiver<(Topic, Value)>,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub async fn recv(&mut self) -> Option<(Topic, Value)> {
        self.rx.recv().await
    }
}

/// A one-shot registration on a single topic.
pub struct OnceWaiter {
    id: HandlerId,
    topic: Topic,
    rx: oneshot::Receiver<Value>,
}

impl OnceWaiter {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Resolves with the payload, or `None` if the handler was removed first.
    pub async fn recv(self) -> Option<Value> {
        self.rx.await.ok()
    }
}

#[derive(Default)]
pub struct TopicDispatcher {
    handlers: DashMap<Topic, Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
}

impl TopicDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on(&self, topic: Topic) -> Subscription {
        self.on_many(&[topic])
    }

    /// Registers one handler that receives every listed topic through a single ordered stream.
    pub fn on_many(&self, topics: &[Topic]) -> Subscription {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        for topic in topics {
            self.handlers
                .entry(*topic)
                .or_default()
                .push((id, Handler::Persistent(tx.clone())));
        }
        Subscription {
            id,
            topics: topics.to_vec(),
            rx,
        }
    }

    pub fn once(&self, topic: Topic) -> OnceWaiter {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.handlers
            .entry(topic)
            .or_default()
            .push((id, Handler::Once(Some(tx))));
        OnceWaiter { id, topic, rx }
    }

    /// Removes a handler. Returns false if it had already fired or been removed.
    pub fn off(&self, topic: Topic, id: HandlerId) -> bool {
        let Some(mut entry) = self.handlers.get_mut(&topic) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(handler_id, _)| *handler_id != id);
        before != entry.len()
    }

    /// Delivers a payload to every handler for `topic`. Returns how many received it.
    pub fn dispatch(&self, topic: Topic, data: Value) -> usize {
        let Some(mut entry) = self.handlers.get_mut(&topic) else {
            return 0;
        };
        let mut delivered = 0;
        entry.retain_mut(|(_, handler)| match handler {
            Handler::Persistent(tx) => {
                let alive = tx.send((topic, data.clone())).is_ok();
                if alive {
                    delivered += 1;
                }
                alive
            }
            Handler::Once(slot) => {
                if let Some(tx) = slot.take() {
                    if tx.send(data.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                false
            }
        });
        delivered
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.handlers.get(&topic).map(|h| h.len()).unwrap_or(0)
    }
}
