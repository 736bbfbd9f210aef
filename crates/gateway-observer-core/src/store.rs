use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::error::ObserverError;
use crate::event::ObservedEvent;

/// Append-only container of observed events with secondary indexes by
/// thread, turn, and actor.
///
/// A single readers-writer lock covers the event vector and all three
/// indexes, so readers observe either pre- or post-append state, never a
/// partial one. No event is ever removed or mutated once stored.
#[derive(Debug, Default)]
pub struct EventStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    events: Vec<ObservedEvent>,
    by_thread: BTreeMap<String, Vec<usize>>,
    by_turn: BTreeMap<String, Vec<usize>>,
    by_actor: BTreeMap<String, Vec<usize>>,
}

impl EventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one event and updates the indexes atomically, returning the
    /// 0-based slot index.
    ///
    /// # Errors
    /// Returns [`ObserverError::NonMonotonicIngest`] when `event_id` is not
    /// strictly above the last stored one.
    pub fn append(&self, event: ObservedEvent) -> Result<usize, ObserverError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = inner.events.last() {
            if event.event_id <= last.event_id {
                return Err(ObserverError::NonMonotonicIngest {
                    last: last.event_id,
                    got: event.event_id,
                });
            }
        }

        let slot = inner.events.len();
        if let Some(thread_id) = event.thread_id.clone() {
            inner.by_thread.entry(thread_id).or_default().push(slot);
        }
        if let Some(turn_id) = event.turn_id.clone() {
            inner.by_turn.entry(turn_id).or_default().push(slot);
        }
        if let Some(actor) = event.actor.clone() {
            inner.by_actor.entry(actor).or_default().push(slot);
        }
        inner.events.push(event);
        Ok(slot)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.read().events.len()
    }

    #[must_use]
    pub fn last_event_id(&self) -> Option<u64> {
        self.read().events.last().map(|event| event.event_id)
    }

    /// Snapshot of all events in append order.
    #[must_use]
    pub fn all(&self) -> Vec<ObservedEvent> {
        self.read().events.clone()
    }

    #[must_use]
    pub fn by_thread(&self, thread_id: &str) -> Vec<ObservedEvent> {
        let inner = self.read();
        collect_indexed(&inner, inner.by_thread.get(thread_id))
    }

    #[must_use]
    pub fn by_turn(&self, turn_id: &str) -> Vec<ObservedEvent> {
        let inner = self.read();
        collect_indexed(&inner, inner.by_turn.get(turn_id))
    }

    #[must_use]
    pub fn by_actor(&self, actor: &str) -> Vec<ObservedEvent> {
        let inner = self.read();
        collect_indexed(&inner, inner.by_actor.get(actor))
    }

    /// Events with `event_id` strictly above `after_event_id`, capped at
    /// `limit`. Relies on the stored sequence being strictly increasing.
    #[must_use]
    pub fn tail(&self, after_event_id: Option<u64>, limit: usize) -> Vec<ObservedEvent> {
        let inner = self.read();
        let start = match after_event_id {
            Some(after) => inner
                .events
                .partition_point(|event| event.event_id <= after),
            None => 0,
        };
        inner.events[start..].iter().take(limit).cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn collect_indexed(inner: &StoreInner, slots: Option<&Vec<usize>>) -> Vec<ObservedEvent> {
    slots
        .map(|slots| slots.iter().map(|slot| inner.events[*slot].clone()).collect())
        .unwrap_or_default()
}
