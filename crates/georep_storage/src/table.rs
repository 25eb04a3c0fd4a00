//! Table trait definition.

use crate::error::StorageResult;
use std::cmp::Ordering;

/// Primary key of a row.
pub type RowKey = i64;

/// A row that can be stored in a [`Table`].
pub trait Row: Clone + Send + Sync + 'static {
    /// Returns the primary key of this row.
    fn key(&self) -> RowKey;
}

/// A filtered, ordered, bounded read over a table.
///
/// This is the storage-level shape of a candidate query: which rows are
/// eligible, in what order they should be taken, and how many at most.
pub struct Selection<'a, R> {
    /// Rows for which this returns `false` are not eligible.
    pub filter: &'a dyn Fn(&R) -> bool,
    /// Ordering applied to eligible rows before the limit.
    pub order: &'a dyn Fn(&R, &R) -> Ordering,
    /// Maximum number of rows to return.
    pub limit: usize,
}

impl<'a, R> Selection<'a, R> {
    /// Creates a new selection.
    pub fn new(
        filter: &'a dyn Fn(&R) -> bool,
        order: &'a dyn Fn(&R, &R) -> Ordering,
        limit: usize,
    ) -> Self {
        Self {
            filter,
            order,
            limit,
        }
    }
}

/// A table of rows in the store shared by all replication workers.
///
/// # Invariants
///
/// - Every method is a single atomic operation with respect to every other
///   method on the same table, including calls from other threads and, for
///   persistent tables, other processes
/// - `claim` never returns a row that a concurrent `claim` has returned
///   unless that row became eligible again after the first claim finished
/// - `claim` never waits on rows locked by another claim: it skips them
/// - `update_if` and `update_where` wait for row locks held by an in-flight
///   claim before evaluating their predicate
///
/// # Implementors
///
/// - [`super::InMemoryTable`] - For tests and single-process deployments
/// - [`super::FileTable`] - For persistent, multi-process deployments
pub trait Table<R: Row>: Send + Sync {
    /// Returns the table name.
    fn name(&self) -> &str;

    /// Inserts a row if no row with the same key exists.
    ///
    /// Returns `true` if the row was inserted, `false` if a row with the
    /// same key already existed (the existing row is left untouched).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn insert(&self, row: R) -> StorageResult<bool>;

    /// Reads the row with the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn get(&self, key: RowKey) -> StorageResult<Option<R>>;

    /// Deletes the row with the given key. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn delete(&self, key: RowKey) -> StorageResult<bool>;

    /// Applies `apply` to the row with the given key if `predicate` holds
    /// for its current value.
    ///
    /// This is the compare-and-swap primitive: the predicate is evaluated
    /// and the mutation applied without any other writer in between.
    /// Returns `true` if a row was updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn update_if(
        &self,
        key: RowKey,
        predicate: &dyn Fn(&R) -> bool,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<bool>;

    /// Applies `apply` to every row matching `filter`.
    ///
    /// Returns the number of rows updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn update_where(
        &self,
        filter: &dyn Fn(&R) -> bool,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<usize>;

    /// Atomically selects, locks and updates a bounded batch of rows.
    ///
    /// Rows are taken in `selection.order`, skipping rows locked by a
    /// concurrent claimant, up to `selection.limit`. `apply` is run on each
    /// selected row before the locks are released. Returns the keys of the
    /// updated rows in selection order.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn claim(
        &self,
        selection: Selection<'_, R>,
        apply: &mut dyn FnMut(&mut R),
    ) -> StorageResult<Vec<RowKey>>;

    /// Reads rows matching a selection without locking them.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn select(&self, selection: Selection<'_, R>) -> StorageResult<Vec<R>>;

    /// Counts rows matching `filter`, stopping at `limit` if given.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn count(&self, filter: &dyn Fn(&R) -> bool, limit: Option<usize>) -> StorageResult<usize>;

    /// Returns all primary keys in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails.
    fn keys(&self) -> StorageResult<Vec<RowKey>>;
}

/// Sorts, filters and truncates `rows` according to `selection`.
pub(crate) fn apply_selection<'r, R>(
    rows: impl Iterator<Item = &'r R>,
    selection: &Selection<'_, R>,
) -> Vec<&'r R>
where
    R: 'r,
{
    let mut eligible: Vec<&R> = rows.filter(|row| (selection.filter)(*row)).collect();
    // Stable sort keeps primary-key order among equal sort keys.
    eligible.sort_by(|a, b| (selection.order)(*a, *b));
    eligible.truncate(selection.limit);
    eligible
}

/// Counts rows passing `filter`, stopping early at `limit`.
pub(crate) fn count_matching<'r, R>(
    rows: impl Iterator<Item = &'r R>,
    filter: &dyn Fn(&R) -> bool,
    limit: Option<usize>,
) -> usize
where
    R: 'r,
{
    let matching = rows.filter(|row| filter(*row));
    match limit {
        Some(limit) => matching.take(limit).count(),
        None => matching.count(),
    }
}
