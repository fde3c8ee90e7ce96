//! FIFO matching of replies that carry no request id.
//!
//! The session router answers `createWebRtcTransport`, `transport-connect`
//! and `transport-produce` in the order it received them, but the replies
//! do not echo anything that identifies the request. Each request therefore
//! enqueues a waiter and each reply resolves the oldest one. A waiter whose
//! caller gave up (timeout or superseded) stays in the queue until its reply
//! window has passed, so a late reply is consumed and discarded instead of
//! being handed to a newer request. Once the window is over the waiter only
//! absorbs a reply if nothing newer is queued behind it; a reply the peer
//! never sent therefore cannot shift every later match by one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

struct Waiter<C, T> {
    ticket: Ticket,
    context: C,
    tx: oneshot::Sender<T>,
    expires: Instant,
}

impl<C, T> Waiter<C, T> {
    /// Abandoned by its caller and past its reply window.
    fn is_stale(&self, now: Instant) -> bool {
        self.tx.is_closed() && now >= self.expires
    }
}

/// What became of a reply handed to [`PendingResponses::resolve`].
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution<C, T> {
    Delivered,
    /// The oldest waiter had already been abandoned; the reply is returned with its context.
    Abandoned(C, T),
    /// Nothing was waiting.
    Unmatched(T),
}

pub struct PendingResponses<C, T> {
    queue: Mutex<VecDeque<Waiter<C, T>>>,
    next_ticket: AtomicU64,
}

impl<C, T> Default for PendingResponses<C, T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            next_ticket: AtomicU64::new(0),
        }
    }
}

impl<C, T> PendingResponses<C, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a waiter whose reply is expected within `window`.
    pub fn push(&self, context: C, window: Duration) -> (Ticket, oneshot::Receiver<T>) {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        if let Ok(mut queue) = self.queue.lock() {
            queue.retain(|w| !w.is_stale(now));
            queue.push_back(Waiter {
                ticket,
                context,
                tx,
                expires: now + window,
            });
        }
        (ticket, rx)
    }

    /// Removes a waiter whose request never went out.
    pub fn cancel(&self, ticket: Ticket) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.retain(|w| w.ticket != ticket);
        }
    }

    pub fn resolve(&self, value: T) -> Resolution<C, T> {
        let now = Instant::now();
        let waiter = match self.queue.lock() {
            Ok(mut queue) => {
                while queue.len() > 1 && queue.front().is_some_and(|w| w.is_stale(now)) {
                    queue.pop_front();
                }
                queue.pop_front()
            }
            Err(_) => None,
        };
        match waiter {
            None => Resolution::Unmatched(value),
            Some(waiter) => match waiter.tx.send(value) {
                Ok(()) => Resolution::Delivered,
                Err(value) => Resolution::Abandoned(waiter.context, value),
            },
        }
    }

    /// Drops every waiter. Callers still waiting observe a closed channel.
    pub fn clear(&self) -> usize {
        match self.queue.lock() {
            Ok(mut queue) => {
                let n = queue.len();
                queue.clear();
                n
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
