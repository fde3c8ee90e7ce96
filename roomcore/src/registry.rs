//! Remote publisher registry.
//!
//! Tracks every remote publisher this client has heard about and how far
//! its consumption has progressed. Roster pushes and live notifications
//! can interleave or repeat arbitrarily, so every mutation here is
//! idempotent per publisher id.

use crate::types::{ConsumerId, PublisherId, TransportId};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;

/// Consumption progress of one remote publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ConsumptionStatus {
    /// Announced but not yet requested.
    Known,
    /// A consume attempt is in flight. `transport_id` is bound once the
    /// request has actually been sent on a receive transport.
    Consuming {
        attempt: u64,
        transport_id: Option<TransportId>,
    },
    /// Bound to a consumer on the receive transport.
    Consumed {
        consumer_id: ConsumerId,
        transport_id: TransportId,
    },
}

impl ConsumptionStatus {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known)
    }

    pub fn is_consuming(&self) -> bool {
        matches!(self, Self::Consuming { .. })
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self, Self::Consumed { .. })
    }
}

/// Result of [`PublisherRegistry::begin_consuming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginConsume {
    /// The entry moved to `consuming` under this attempt number.
    Started(u64),
    /// Already `consuming` or `consumed`; nothing to do.
    AlreadyActive,
    /// No entry for this publisher (never announced, or closed since).
    Unknown,
}

#[derive(Debug, Default)]
pub struct PublisherRegistry {
    entries: HashMap<PublisherId, ConsumptionStatus>,
    next_attempt: u64,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a publisher in the `known` state. Returns false for duplicates.
    pub fn announce(&mut self, id: PublisherId) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, ConsumptionStatus::Known);
        true
    }

    /// Announces a whole roster and returns only the ids that were new.
    pub fn announce_all<I>(&mut self, ids: I) -> Vec<PublisherId>
    where
        I: IntoIterator<Item = PublisherId>,
    {
        ids.into_iter()
            .filter(|id| self.announce(id.clone()))
            .collect()
    }

    /// Moves a `known` publisher to `consuming`.
    pub fn begin_consuming(&mut self, id: &PublisherId) -> BeginConsume {
        match self.entries.get(id) {
            None => BeginConsume::Unknown,
            Some(ConsumptionStatus::Known) => {
                self.next_attempt += 1;
                let attempt = self.next_attempt;
                self.entries.insert(
                    id.clone(),
                    ConsumptionStatus::Consuming {
                        attempt,
                        transport_id: None,
                    },
                );
                debug!(target: "Room/Registry", "Consuming {id} (attempt {attempt})");
                BeginConsume::Started(attempt)
            }
            Some(status) => {
                debug!(target: "Room/Registry", "Not consuming {id}: already {status:?}");
                BeginConsume::AlreadyActive
            }
        }
    }

    /// Records the receive transport a consume attempt was sent on.
    /// Fails if the attempt has been superseded or the publisher removed.
    pub fn bind_transport(
        &mut self,
        id: &PublisherId,
        attempt: u64,
        transport_id: TransportId,
    ) -> bool {
        match self.entries.get_mut(id) {
            Some(ConsumptionStatus::Consuming {
                attempt: current,
                transport_id: bound,
            }) if *current == attempt => {
                *bound = Some(transport_id);
                true
            }
            _ => false,
        }
    }

    /// The in-flight attempt for `id`, if any, with its bound transport.
    pub fn pending_attempt(&self, id: &PublisherId) -> Option<(u64, Option<&TransportId>)> {
        match self.entries.get(id) {
            Some(ConsumptionStatus::Consuming {
                attempt,
                transport_id,
            }) => Some((*attempt, transport_id.as_ref())),
            _ => None,
        }
    }

    /// Completes an attempt. Only the attempt that is still current may complete.
    pub fn complete(&mut self, id: &PublisherId, attempt: u64, consumer_id: ConsumerId) -> bool {
        let transport_id = match self.entries.get(id) {
            Some(ConsumptionStatus::Consuming {
                attempt: current,
                transport_id: Some(transport_id),
            }) if *current == attempt => transport_id.clone(),
            _ => return false,
        };
        self.entries.insert(
            id.clone(),
            ConsumptionStatus::Consumed {
                consumer_id,
                transport_id,
            },
        );
        true
    }

    /// Returns a failed or stale attempt to `known` so it can be retried.
    pub fn revert(&mut self, id: &PublisherId, attempt: u64) -> bool {
        let is_current = matches!(
            self.entries.get(id),
            Some(ConsumptionStatus::Consuming { attempt: current, .. }) if *current == attempt
        );
        if is_current {
            debug!(target: "Room/Registry", "Attempt {attempt} for {id} reverted to known");
            self.entries.insert(id.clone(), ConsumptionStatus::Known);
        } else {
            debug!(target: "Room/Registry", "Ignoring revert of stale attempt {attempt} for {id}");
        }
        is_current
    }

    /// Returns every entry to `known`, keeping the set of publishers intact.
    pub fn reset_to_known(&mut self) -> Vec<PublisherId> {
        for status in self.entries.values_mut() {
            *status = ConsumptionStatus::Known;
        }
        self.ids()
    }

    pub fn remove(&mut self, id: &PublisherId) -> Option<ConsumptionStatus> {
        let removed = self.entries.remove(id);
        if removed.is_some() {
            debug!(target: "Room/Registry", "Removed {id}");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn status(&self, id: &PublisherId) -> Option<&ConsumptionStatus> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &PublisherId) -> bool {
        self.entries.contains_key(id)
    }

    /// All publisher ids, sorted for stable output.
    pub fn ids(&self) -> Vec<PublisherId> {
        let mut ids: Vec<_> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Publishers still waiting for a consume attempt.
    pub fn known_ids(&self) -> Vec<PublisherId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, status)| status.is_known())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
