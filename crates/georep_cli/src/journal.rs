//! Event journal shared through the store directory.
//!
//! The primary appends every event it publishes as a CBOR payload; each
//! secondary keeps its own cursor per resource kind and replays the
//! entries after it.

use georep_protocol::{EventPublisher, ProtocolError, ProtocolResult, ReplicationEvent};
use georep_storage::{FileTable, Row, RowKey, StorageError, Table};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors reading or writing the journal.
#[derive(Error, Debug)]
pub enum JournalError {
    /// The store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An event could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An entry's payload is not valid hex.
    #[error("corrupted journal entry {0}")]
    Corrupted(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    sequence: RowKey,
    payload: String,
}

impl Row for JournalEntry {
    fn key(&self) -> RowKey {
        self.sequence
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorRow {
    id: RowKey,
    sequence: u64,
}

impl Row for CursorRow {
    fn key(&self) -> RowKey {
        self.id
    }
}

/// Append-only event journal.
pub struct EventJournal {
    entries: FileTable<JournalEntry>,
}

impl EventJournal {
    /// Opens the journal in `store`.
    pub fn open(store: &Path) -> Result<Self, JournalError> {
        Ok(Self {
            entries: FileTable::open(store, "events")?,
        })
    }

    /// Appends `event`, returning its sequence number.
    pub fn append(&self, event: &ReplicationEvent) -> Result<u64, JournalError> {
        let payload = hex::encode(event.encode()?);
        // Another process may take the next sequence between reading the
        // keys and inserting; insert refuses existing keys, so retry.
        loop {
            let next = self.entries.keys()?.last().map_or(1, |last| last + 1);
            let entry = JournalEntry {
                sequence: next,
                payload: payload.clone(),
            };
            if self.entries.insert(entry)? {
                return Ok(next as u64);
            }
        }
    }

    /// Returns the encoded events after `cursor`, oldest first.
    pub fn entries_after(&self, cursor: u64) -> Result<Vec<(u64, Vec<u8>)>, JournalError> {
        let mut out = Vec::new();
        for key in self.entries.keys()? {
            let sequence = key as u64;
            if sequence <= cursor {
                continue;
            }
            if let Some(entry) = self.entries.get(key)? {
                let bytes = hex::decode(&entry.payload).map_err(|_| JournalError::Corrupted(sequence))?;
                out.push((sequence, bytes));
            }
        }
        Ok(out)
    }
}

impl EventPublisher for EventJournal {
    fn publish(&self, event: ReplicationEvent) -> ProtocolResult<u64> {
        self.append(&event).map_err(|e| {
            tracing::error!(
                kind = %event.resource_kind,
                model_record_id = event.model_record_id,
                error = %e,
                "failed to journal event"
            );
            match e {
                JournalError::Protocol(e) => e,
                other => ProtocolError::Publish(other.to_string()),
            }
        })
    }
}

/// How far one secondary has replayed the journal for one kind.
pub struct Cursor {
    table: FileTable<CursorRow>,
}

impl Cursor {
    /// Opens the cursor of `site` for `kind`.
    pub fn open(store: &Path, site: &str, kind: &str) -> Result<Self, JournalError> {
        Ok(Self {
            table: FileTable::open(store, format!("{kind}_cursor_{site}"))?,
        })
    }

    /// Last sequence replayed.
    pub fn load(&self) -> Result<u64, JournalError> {
        Ok(self.table.get(0)?.map_or(0, |row| row.sequence))
    }

    /// Records `sequence` as replayed.
    pub fn save(&self, sequence: u64) -> Result<(), JournalError> {
        self.table.insert(CursorRow { id: 0, sequence: 0 })?;
        self.table
            .update_if(0, &|_| true, &mut |row| row.sequence = sequence)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use georep_protocol::EventParams;

    #[test]
    fn journal_assigns_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let journal = EventJournal::open(dir.path()).unwrap();
        assert_eq!(journal.publish(ReplicationEvent::created("upload", 1)).unwrap(), 1);
        assert_eq!(journal.publish(ReplicationEvent::updated("upload", 1)).unwrap(), 2);

        let entries = journal.entries_after(1).unwrap();
        assert_eq!(entries.len(), 1);
        let event = ReplicationEvent::decode(&entries[0].1).unwrap();
        assert_eq!(event, ReplicationEvent::updated("upload", 1));
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        EventJournal::open(dir.path())
            .unwrap()
            .publish(ReplicationEvent::created("upload", 1))
            .unwrap();
        let journal = EventJournal::open(dir.path()).unwrap();
        assert_eq!(journal.publish(ReplicationEvent::created("upload", 2)).unwrap(), 2);
        assert_eq!(journal.entries_after(0).unwrap().len(), 2);
    }

    #[test]
    fn unwritable_store_fails_publish() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let journal = EventJournal::open(&store).unwrap();

        // Replace the store directory with a plain file.
        std::fs::remove_dir_all(&store).unwrap();
        std::fs::write(&store, b"not a directory").unwrap();

        let result = journal.publish(ReplicationEvent::deleted("upload", 1, EventParams::new()));
        assert!(matches!(result, Err(ProtocolError::Publish(_))));
    }

    #[test]
    fn cursors_are_per_site_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let a = Cursor::open(dir.path(), "eu", "upload").unwrap();
        let b = Cursor::open(dir.path(), "eu", "project_repository").unwrap();
        assert_eq!(a.load().unwrap(), 0);
        a.save(5).unwrap();
        a.save(7).unwrap();
        assert_eq!(a.load().unwrap(), 7);
        assert_eq!(b.load().unwrap(), 0);
    }
}
