//! In-memory table with row-level lock simulation.

use crate::error::StorageResult;
use crate::table::{apply_selection, count_matching, Row, RowKey, Selection, Table};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// An in-memory table.
///
/// This table stores all rows in memory and is suitable for:
/// - Unit and integration tests
/// - Single-process deployments where all workers are threads
///
/// # Locking
///
/// Claims run in two phases, the way `SELECT ... FOR UPDATE SKIP LOCKED`
/// followed by `UPDATE ... RETURNING` does in a relational store:
///
/// 1. Under the table mutex, eligible rows that are not locked are selected
///    and their keys added to the lock set. The mutex is then released.
/// 2. The mutex is re-acquired, the mutation is applied to every locked row,
///    and the row locks are released.
///
/// Between the two phases the selected rows are still eligible but locked,
/// so a concurrent claim skips them. Plain updates and deletes wait for the
/// row lock instead of skipping.
///
/// # Example
///
/// ```rust
/// use georep_storage::{InMemoryTable, Row, Table};
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Counter { id: i64, value: u32 }
///
/// impl Row for Counter {
///     fn key(&self) -> i64 { self.id }
/// }
///
/// let table = InMemoryTable::new("counters");
/// assert!(table.insert(Counter { id: 7, value: 0 }).unwrap());
/// assert!(!table.insert(Counter { id: 7, value: 9 }).unwrap());
/// assert_eq!(table.get(7).unwrap().unwrap().value, 0);
/// ```
#[derive(Debug)]
pub struct InMemoryTable<R> {
    name: String,
    inner: Mutex<Inner<R>>,
    released: Condvar,
    lock_hold: Option<Duration>,
}

#[derive(Debug)]
struct Inner<R> {
    rows: BTreeMap<RowKey, R>,
    locked: HashSet<RowKey>,
}

impl<R: Row> InMemoryTable<R> {
    /// Creates a new empty table.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                rows: BTreeMap::new(),
                locked: HashSet::new(),
            }),
            released: Condvar::new(),
            lock_hold: None,
        }
    }

    /// Creates a table pre-populated with rows.
    #[must_use]
    pub fn with_rows(name: impl Into<String>, rows: impl IntoIterator<Item = R>) -> Self {
        let table = Self::new(name);
        {
            let mut inner = table.inner.lock();
            for row in rows {
                inner.rows.insert(row.key(), row);
            }
        }
        table
    }

    /// Holds row locks for the given duration between the select and update
    /// phases of every claim.
    ///
    /// Widens the window in which concurrent claims observe each other's
    /// locks. Intended for concurrency tests.
    #[must_use]
    pub fn with_lock_hold(mut self, hold: Duration) -> Self {
        self.lock_hold = Some(hold);
        self
    }

    /// Returns a copy of all rows in key order.
    #[must_use]
    pub fn rows(&self) -> Vec<R> {
        self.inner.lock().rows.values().cloned().collect()
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until none of `keys` is locked, returning the guard.
    fn wait_unlocked<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Inner<R>>,
        keys: &dyn Fn(&Inner<R>) -> Vec<RowKey>,
    ) -> MutexGuard<'a, Inner<R>> {
        loop {
            let pending = keys(&*guard);
            if pending.iter().all(|key| !guard.locked.contains(key)) {
                return guard;
            }
            self.released.wait(&mut guard);
        }
    }
}

impl<R: Row> Table<R> for InMemoryTable<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, row: R) -> StorageResult<bool> {
        let mut inner = self.inner.lock();
        let key = row.key();
        if inner.rows.contains_key(&key) {
            return Ok(false);
        }
        inner.rows.insert(key, row);
        Ok(true)
    }

    fn get(&self, key: RowKey) -> StorageResult<Option<R>> {
        Ok(self.inner.lock().rows.get(&key).cloned())
    }

    fn delete(&self, key: RowKey) -> StorageResult<bool> {
        let guard = self.inner.lock();
        let mut inner = self.wait_unlocked(guard, &|_| vec![key]);
        Ok(inner.rows.remove(&key).is_some())
    }

    fn update_if(
        &self,
        key: RowKey,
        predicate: &dyn Fn(&R) -> bool,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<bool> {
        let guard = self.inner.lock();
        let mut inner = self.wait_unlocked(guard, &|_| vec![key]);
        match inner.rows.get_mut(&key) {
            Some(row) if predicate(row) => {
                apply(row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn update_where(
        &self,
        filter: &dyn Fn(&R) -> bool,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<usize> {
        let matching = |inner: &Inner<R>| -> Vec<RowKey> {
            inner
                .rows
                .values()
                .filter(|row| filter(*row))
                .map(Row::key)
                .collect()
        };
        let guard = self.inner.lock();
        let mut inner = self.wait_unlocked(guard, &matching);
        let keys = matching(&*inner);
        for key in &keys {
            if let Some(row) = inner.rows.get_mut(key) {
                apply(row);
            }
        }
        Ok(keys.len())
    }

    fn claim(
        &self,
        selection: Selection<'_, R>,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<Vec<RowKey>> {
        // Phase 1: select and lock, skipping rows locked by other claimants.
        let keys: Vec<RowKey> = {
            let mut inner = self.inner.lock();
            let keys: Vec<RowKey> = {
                let locked = &inner.locked;
                apply_selection(
                    inner.rows.values().filter(|row| !locked.contains(&row.key())),
                    &selection,
                )
                .into_iter()
                .map(Row::key)
                .collect()
            };
            inner.locked.extend(keys.iter().copied());
            keys
        };

        if keys.is_empty() {
            return Ok(keys);
        }

        if let Some(hold) = self.lock_hold {
            std::thread::sleep(hold);
        }

        // Phase 2: update the locked rows and release them.
        let mut inner = self.inner.lock();
        for key in &keys {
            if let Some(row) = inner.rows.get_mut(key) {
                apply(row);
            }
            inner.locked.remove(key);
        }
        drop(inner);
        self.released.notify_all();

        tracing::trace!(table = %self.name, claimed = keys.len(), "claimed rows");
        Ok(keys)
    }

    fn select(&self, selection: Selection<'_, R>) -> StorageResult<Vec<R>> {
        let inner = self.inner.lock();
        Ok(apply_selection(inner.rows.values(), &selection)
            .into_iter()
            .cloned()
            .collect())
    }

    fn count(&self, filter: &dyn Fn(&R) -> bool, limit: Option<usize>) -> StorageResult<usize> {
        let inner = self.inner.lock();
        Ok(count_matching(inner.rows.values(), filter, limit))
    }

    fn keys(&self) -> StorageResult<Vec<RowKey>> {
        Ok(self.inner.lock().rows.keys().copied().collect())
    }
}
