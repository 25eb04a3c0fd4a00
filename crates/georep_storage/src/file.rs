//! File-backed table for persistent, multi-process storage.

use crate::error::{StorageError, StorageResult};
use crate::table::{apply_selection, count_matching, Row, RowKey, Selection, Table};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// A table persisted as a JSON document in a directory.
///
/// Every operation takes an advisory lock on `<name>.lock` next to the data
/// file: shared for reads, exclusive for writes. The whole operation
/// (read, mutate, write back) happens while the exclusive lock is held, so
/// every write is atomic with respect to other threads and other processes
/// using the same directory.
///
/// Because a claim selects and updates under one exclusive lock, no row is
/// ever observed locked by another claimant. Concurrent claims serialize and
/// each sees the rows the previous one already moved out of eligibility.
///
/// # Durability
///
/// Writes go to `<name>.json.tmp`, are synced, and then renamed over
/// `<name>.json`, so a crash leaves either the old or the new table.
///
/// # Example
///
/// ```no_run
/// use georep_storage::{FileTable, Row, Table};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Job { id: i64 }
///
/// impl Row for Job {
///     fn key(&self) -> i64 { self.id }
/// }
///
/// let table: FileTable<Job> = FileTable::open("data", "jobs").unwrap();
/// table.insert(Job { id: 1 }).unwrap();
/// ```
#[derive(Debug)]
pub struct FileTable<R> {
    name: String,
    data_path: PathBuf,
    lock_path: PathBuf,
    /// Serializes threads of this process; the file lock serializes processes.
    local: Mutex<()>,
    _rows: PhantomData<fn() -> R>,
}

impl<R> FileTable<R>
where
    R: Row + Serialize + DeserializeOwned,
{
    /// Opens or creates the table `name` inside `dir`.
    ///
    /// The directory is created if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or lock file cannot be created, or
    /// if an existing data file cannot be parsed.
    pub fn open(dir: impl AsRef<Path>, name: impl Into<String>) -> StorageResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let name = name.into();

        let table = Self {
            data_path: dir.join(format!("{name}.json")),
            lock_path: dir.join(format!("{name}.lock")),
            name,
            local: Mutex::new(()),
            _rows: PhantomData,
        };

        // Validate the existing contents up front.
        table.read(|_| ())?;
        Ok(table)
    }

    /// Returns the path of the data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.data_path
    }

    fn lock_file(&self) -> StorageResult<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?)
    }

    fn load(&self) -> StorageResult<BTreeMap<RowKey, R>> {
        let file = match File::open(&self.data_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() == 0 {
            return Ok(BTreeMap::new());
        }

        let rows: Vec<R> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StorageError::serialization(&self.name, e))?;

        let mut map = BTreeMap::new();
        for row in rows {
            if map.insert(row.key(), row).is_some() {
                return Err(StorageError::Corrupted(format!(
                    "duplicate primary key in table {}",
                    self.name
                )));
            }
        }
        Ok(map)
    }

    fn store(&self, rows: &BTreeMap<RowKey, R>) -> StorageResult<()> {
        let tmp_path = self.data_path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(&file);
            let values: Vec<&R> = rows.values().collect();
            serde_json::to_writer(&mut writer, &values)
                .map_err(|e| StorageError::serialization(&self.name, e))?;
            writer.flush()?;
            drop(writer);
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.data_path)?;
        Ok(())
    }

    /// Runs `f` over the current rows under a shared lock.
    fn read<T>(&self, f: impl FnOnce(&BTreeMap<RowKey, R>) -> T) -> StorageResult<T> {
        let _local = self.local.lock();
        let lock = self.lock_file()?;
        lock.lock_shared()?;
        let result = self.load().map(|rows| f(&rows));
        lock.unlock()?;
        result
    }

    /// Runs `f` over the current rows under an exclusive lock, writing the
    /// rows back if `f` reports a change.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<RowKey, R>) -> (T, bool),
    ) -> StorageResult<T> {
        let _local = self.local.lock();
        let lock = self.lock_file()?;
        lock.lock_exclusive()?;
        let result = self.load().and_then(|mut rows| {
            let (value, changed) = f(&mut rows);
            if changed {
                self.store(&rows)?;
            }
            Ok(value)
        });
        lock.unlock()?;
        result
    }
}

impl<R> Table<R> for FileTable<R>
where
    R: Row + Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, row: R) -> StorageResult<bool> {
        self.write(|rows| {
            let key = row.key();
            if rows.contains_key(&key) {
                (false, false)
            } else {
                rows.insert(key, row);
                (true, true)
            }
        })
    }

    fn get(&self, key: RowKey) -> StorageResult<Option<R>> {
        self.read(|rows| rows.get(&key).cloned())
    }

    fn delete(&self, key: RowKey) -> StorageResult<bool> {
        self.write(|rows| {
            let removed = rows.remove(&key).is_some();
            (removed, removed)
        })
    }

    fn update_if(
        &self,
        key: RowKey,
        predicate: &dyn Fn(&R) -> bool,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<bool> {
        self.write(|rows| match rows.get_mut(&key) {
            Some(row) if predicate(row) => {
                apply(row);
                (true, true)
            }
            _ => (false, false),
        })
    }

    fn update_where(
        &self,
        filter: &dyn Fn(&R) -> bool,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<usize> {
        self.write(|rows| {
            let mut updated = 0;
            for row in rows.values_mut() {
                if filter(row) {
                    apply(row);
                    updated += 1;
                }
            }
            (updated, updated > 0)
        })
    }

    fn claim(
        &self,
        selection: Selection<'_, R>,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<Vec<RowKey>> {
        let keys = self.write(|rows| {
            let keys: Vec<RowKey> = apply_selection(rows.values(), &selection)
                .into_iter()
                .map(Row::key)
                .collect();
            for key in &keys {
                if let Some(row) = rows.get_mut(key) {
                    apply(row);
                }
            }
            let changed = !keys.is_empty();
            (keys, changed)
        })?;
        tracing::trace!(table = %self.name, claimed = keys.len(), "claimed rows");
        Ok(keys)
    }

    fn select(&self, selection: Selection<'_, R>) -> StorageResult<Vec<R>> {
        self.read(|rows| {
            apply_selection(rows.values(), &selection)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    fn count(&self, filter: &dyn Fn(&R) -> bool, limit: Option<usize>) -> StorageResult<usize> {
        self.read(|rows| count_matching(rows.values(), filter, limit))
    }

    fn keys(&self) -> StorageResult<Vec<RowKey>> {
        self.read(|rows| rows.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: i64,
        state: u8,
    }

    impl Row for Job {
        fn key(&self) -> i64 {
            self.id
        }
    }

    fn pending(j: &Job) -> bool {
        j.state == 0
    }

    fn by_id(a: &Job, b: &Job) -> std::cmp::Ordering {
        a.id.cmp(&b.id)
    }

    #[test]
    fn file_table_create_empty() {
        let dir = tempdir().unwrap();
        let table: FileTable<Job> = FileTable::open(dir.path(), "jobs").unwrap();
        assert_eq!(table.name(), "jobs");
        assert!(table.keys().unwrap().is_empty());
    }

    #[test]
    fn file_table_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let table = FileTable::open(dir.path(), "jobs").unwrap();
            table.insert(Job { id: 1, state: 0 }).unwrap();
            table.insert(Job { id: 2, state: 0 }).unwrap();
            table
                .update_if(2, &pending, &mut |j: &mut Job| j.state = 2)
                .unwrap();
        }

        let table: FileTable<Job> = FileTable::open(dir.path(), "jobs").unwrap();
        assert_eq!(table.keys().unwrap(), vec![1, 2]);
        assert_eq!(table.get(2).unwrap().unwrap().state, 2);
    }

    #[test]
    fn file_table_claim_and_count() {
        let dir = tempdir().unwrap();
        let table = FileTable::open(dir.path(), "jobs").unwrap();
        for id in 1..=5 {
            table.insert(Job { id, state: 0 }).unwrap();
        }

        let claimed = table
            .claim(Selection::new(&pending, &by_id, 3), &mut |j| j.state = 1)
            .unwrap();
        assert_eq!(claimed, vec![1, 2, 3]);
        assert_eq!(table.count(&pending, None).unwrap(), 2);
    }

    #[test]
    fn file_table_insert_existing_is_noop() {
        let dir = tempdir().unwrap();
        let table = FileTable::open(dir.path(), "jobs").unwrap();
        assert!(table.insert(Job { id: 1, state: 0 }).unwrap());
        assert!(!table.insert(Job { id: 1, state: 3 }).unwrap());
        assert_eq!(table.get(1).unwrap().unwrap().state, 0);
    }

    #[test]
    fn file_table_corrupted_file_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("jobs.json"), b"{not json").unwrap();
        let result: StorageResult<FileTable<Job>> = FileTable::open(dir.path(), "jobs");
        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }

    #[test]
    fn file_table_concurrent_claims_are_disjoint() {
        let dir = tempdir().unwrap();
        let table = Arc::new(FileTable::open(dir.path(), "jobs").unwrap());
        for id in 1..=20 {
            table.insert(Job { id, state: 0 }).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    loop {
                        let batch = table
                            .claim(Selection::new(&pending, &by_id, 2), &mut |j| j.state = 1)
                            .unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        mine.extend(batch);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn file_table_separate_handles_share_state() {
        let dir = tempdir().unwrap();
        let a: FileTable<Job> = FileTable::open(dir.path(), "jobs").unwrap();
        let b: FileTable<Job> = FileTable::open(dir.path(), "jobs").unwrap();

        a.insert(Job { id: 1, state: 0 }).unwrap();
        assert!(b.update_if(1, &pending, &mut |j| j.state = 2).unwrap());
        assert!(!a.update_if(1, &pending, &mut |j| j.state = 3).unwrap());
        assert_eq!(a.get(1).unwrap().unwrap().state, 2);
    }
}
