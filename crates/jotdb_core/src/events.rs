//! Event feed for observing committed operations.
//!
//! Every database owns a feed that emits an event after each completed
//! operation. Listeners are optional; the engine never requires them and
//! emission is best-effort.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, Sender};

/// Kind of database event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Documents were inserted.
    Insert,
    /// Documents were replaced or merged by an update pass.
    Update,
    /// Document fields were modified through operator prefixes.
    Modify,
    /// Documents were tombstoned.
    Remove,
    /// Any mutation (emitted alongside the specific kind).
    Change,
    /// Compaction completed.
    Clean,
    /// The data file was cleared.
    Clear,
    /// A counter hit was recorded.
    Hit,
    /// A counter running sum changed.
    Sum,
    /// A counter minimum was recorded.
    Min,
    /// A counter maximum was recorded.
    Max,
    /// Counter statistics were read.
    Stats,
}

/// A single event emitted by a database.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Number of records the operation touched.
    pub count: usize,
    /// Optional payload: the affected document or counter value.
    pub payload: Option<Value>,
}

impl DatabaseEvent {
    /// Creates an event with a payload.
    #[must_use]
    pub fn with_payload(kind: EventKind, count: usize, payload: Value) -> Self {
        Self {
            kind,
            count,
            payload: Some(payload),
        }
    }

    /// Creates an event without a payload.
    #[must_use]
    pub fn bare(kind: EventKind, count: usize) -> Self {
        Self {
            kind,
            count,
            payload: None,
        }
    }
}

/// A multi-listener event feed.
///
/// Subscribers receive events over a channel; a subscriber registered for a
/// specific kind receives only that kind. Disconnected subscribers are
/// pruned on the next emission.
pub struct EventFeed {
    subscribers: RwLock<Vec<(Option<EventKind>, Sender<DatabaseEvent>)>>,
}

impl EventFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to every event kind.
    pub fn subscribe(&self) -> Receiver<DatabaseEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push((None, tx));
        rx
    }

    /// Subscribes to a single event kind.
    pub fn subscribe_kind(&self, kind: EventKind) -> Receiver<DatabaseEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push((Some(kind), tx));
        rx
    }

    /// Emits an event to all matching subscribers.
    pub fn emit(&self, event: DatabaseEvent) {
        let mut subscribers = self.subscribers.write();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|(filter, tx)| {
            if filter.is_some_and(|kind| kind != event.kind) {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }

    /// Removes every subscriber.
    pub fn detach_all(&self) {
        self.subscribers.write().clear();
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn emit_and_receive() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();

        let event = DatabaseEvent::with_payload(EventKind::Insert, 1, json!({"id": "a"}));
        feed.emit(event.clone());

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received, event);
    }

    #[test]
    fn kind_filter_applies() {
        let feed = EventFeed::new();
        let inserts = feed.subscribe_kind(EventKind::Insert);
        let removes = feed.subscribe_kind(EventKind::Remove);

        feed.emit(DatabaseEvent::bare(EventKind::Insert, 2));

        assert_eq!(inserts.recv().unwrap().count, 2);
        assert!(removes.try_recv().is_err());
    }

    #[test]
    fn disconnected_subscriber_pruned() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(DatabaseEvent::bare(EventKind::Change, 1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn detach_all_removes_listeners() {
        let feed = EventFeed::new();
        let _rx = feed.subscribe();
        let _rx2 = feed.subscribe_kind(EventKind::Hit);

        feed.detach_all();
        assert_eq!(feed.subscriber_count(), 0);
    }
}
