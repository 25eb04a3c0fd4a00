//! Ordered event feed from the primary to its secondaries.

use crate::error::ProtocolResult;
use crate::event::ReplicationEvent;
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// Sink for events published by a primary site.
pub trait EventPublisher: Send + Sync {
    /// Publishes an event, returning the sequence number assigned to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the event was not recorded.
    fn publish(&self, event: ReplicationEvent) -> ProtocolResult<u64>;
}

/// An event together with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Position in the log, starting at 1.
    pub sequence: u64,
    /// The event.
    pub event: ReplicationEvent,
}

/// An append-only event log that secondaries consume by cursor.
///
/// The log:
/// - Assigns strictly increasing sequence numbers
/// - Preserves publish order
/// - Supports push subscribers and cursor-based polling
/// - Is thread-safe
pub struct EventLog {
    inner: RwLock<LogInner>,
    subscribers: RwLock<Vec<Sender<EventRecord>>>,
    max_history: usize,
}

struct LogInner {
    next_sequence: u64,
    history: Vec<EventRecord>,
}

impl EventLog {
    /// Creates a new event log.
    pub fn new() -> Self {
        Self::with_max_history(100_000)
    }

    /// Creates an event log that keeps at most `max_history` events.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            inner: RwLock::new(LogInner {
                next_sequence: 1,
                history: Vec::new(),
            }),
            subscribers: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to events published after this call.
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Returns events with sequence > `cursor`, up to `limit`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<EventRecord> {
        self.inner
            .read()
            .history
            .iter()
            .filter(|r| r.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the latest assigned sequence number, or 0.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.read().next_sequence - 1
    }

    /// Returns the number of events retained.
    pub fn len(&self) -> usize {
        self.inner.read().history.len()
    }

    /// Returns true if no events are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for EventLog {
    fn publish(&self, event: ReplicationEvent) -> ProtocolResult<u64> {
        let record = {
            let mut inner = self.inner.write();
            let record = EventRecord {
                sequence: inner.next_sequence,
                event,
            };
            inner.next_sequence += 1;
            inner.history.push(record.clone());
            if inner.history.len() > self.max_history {
                let excess = inner.history.len() - self.max_history;
                inner.history.drain(0..excess);
            }
            record
        };

        tracing::debug!(
            sequence = record.sequence,
            event_type = %record.event.event_type,
            kind = %record.event.resource_kind,
            model_record_id = record.event.model_record_id,
            "published event"
        );

        let sequence = record.sequence;
        self.subscribers
            .write()
            .retain(|tx| tx.send(record.clone()).is_ok());
        Ok(sequence)
    }
}
