//! Delivery of the primary's events to a secondary's replicators.

use crate::error::{EngineError, EngineResult};
use crate::replicator::Replicator;
use georep_protocol::{EventLog, ReplicationEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes events to the replicator of their resource kind and tracks how
/// far into the primary's event log this secondary has read.
pub struct EventDispatcher {
    replicators: HashMap<String, Arc<Replicator>>,
    cursor: Mutex<u64>,
}

impl EventDispatcher {
    /// Creates a dispatcher starting at the beginning of the log.
    pub fn new() -> Self {
        Self::with_cursor(0)
    }

    /// Creates a dispatcher that resumes after sequence `cursor`.
    pub fn with_cursor(cursor: u64) -> Self {
        Self {
            replicators: HashMap::new(),
            cursor: Mutex::new(cursor),
        }
    }

    /// Registers a replicator for its kind, replacing any previous one.
    pub fn register(&mut self, replicator: Arc<Replicator>) {
        self.replicators
            .insert(replicator.kind().to_string(), replicator);
    }

    /// Returns the replicator for `kind`.
    pub fn replicator(&self, kind: &str) -> Option<&Arc<Replicator>> {
        self.replicators.get(kind)
    }

    /// Returns every registered replicator.
    pub fn replicators(&self) -> impl Iterator<Item = &Arc<Replicator>> {
        self.replicators.values()
    }

    /// Returns the sequence number of the last event handled.
    pub fn cursor(&self) -> u64 {
        *self.cursor.lock()
    }

    /// Delivers one event.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownKind`] if no replicator handles the
    /// event's kind, or the replicator's error.
    pub fn dispatch(&self, event: &ReplicationEvent) -> EngineResult<()> {
        let replicator = self
            .replicators
            .get(&event.resource_kind)
            .ok_or_else(|| EngineError::UnknownKind(event.resource_kind.clone()))?;
        tracing::debug!(
            kind = %event.resource_kind,
            event_type = %event.event_type,
            model_record_id = event.model_record_id,
            "consuming event"
        );
        replicator.consume(event)
    }

    /// Decodes and delivers one wire-encoded event.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding or delivery fails.
    pub fn dispatch_encoded(&self, bytes: &[u8]) -> EngineResult<()> {
        let event = ReplicationEvent::decode(bytes)?;
        self.dispatch(&event)
    }

    /// Delivers up to `limit` events published after the cursor, advancing
    /// the cursor past each one handled. Returns how many were handled.
    ///
    /// Events of unknown kinds are skipped with a warning. Any other
    /// failure stops the drain; the failed event is retried on the next
    /// call.
    ///
    /// # Errors
    ///
    /// Returns the first delivery error.
    pub fn drain(&self, log: &EventLog, limit: usize) -> EngineResult<usize> {
        let mut cursor = self.cursor.lock();
        let records = log.poll(*cursor, limit);
        let mut handled = 0;
        for record in records {
            match self.dispatch(&record.event) {
                Ok(()) => {}
                Err(EngineError::UnknownKind(kind)) => {
                    tracing::warn!(kind = %kind, sequence = record.sequence, "no replicator for event");
                }
                Err(e) => {
                    tracing::error!(sequence = record.sequence, error = %e, "event delivery failed");
                    return Err(e);
                }
            }
            *cursor = record.sequence;
            handled += 1;
        }
        Ok(handled)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
