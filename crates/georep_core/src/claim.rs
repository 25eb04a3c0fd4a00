//! Batch claims.
//!
//! A claim selects up to `batch_size` rows of one work category, locks them
//! while skipping rows another claimant holds, moves them to the
//! in-progress state and returns their keys, all as one store operation.
//! The candidate query is described declaratively by [`ClaimQuery`] so the
//! same description drives the in-process tables and renders to SQL for a
//! relational store:
//!
//! ```text
//! UPDATE <table> SET <state> = <in_progress>, <started_at> = NOW()
//! WHERE <pk> IN (SELECT <pk> FROM <table> WHERE ... ORDER BY ...
//!                LIMIT <n> FOR UPDATE SKIP LOCKED)
//! RETURNING <pk>
//! ```

use crate::error::CoreResult;
use crate::model::{RecordId, RegistryRecord, Resource, SyncState, VerificationState, VerificationStateRow};
use chrono::{DateTime, Utc};
use georep_storage::{Row, Selection, Table};
use std::cmp::Ordering;
use std::fmt::Write as _;

/// A column that claim queries filter or order on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// Registry sync state.
    State,
    /// Registry sync retry time.
    RetryAt,
    /// Registry last sync attempt.
    LastSyncedAt,
    /// Verification state.
    VerificationState,
    /// Verification retry time.
    VerificationRetryAt,
    /// Last checksum attempt.
    VerifiedAt,
    /// Start of the current verification attempt.
    VerificationStartedAt,
}

impl Column {
    /// Returns the SQL column name.
    pub fn name(self) -> &'static str {
        match self {
            Column::State => "state",
            Column::RetryAt => "retry_at",
            Column::LastSyncedAt => "last_synced_at",
            Column::VerificationState => "verification_state",
            Column::VerificationRetryAt => "verification_retry_at",
            Column::VerifiedAt => "verified_at",
            Column::VerificationStartedAt => "verification_started_at",
        }
    }
}

/// The value of a [`Column`] in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnValue {
    /// A state code.
    Code(u8),
    /// A nullable timestamp.
    Time(Option<DateTime<Utc>>),
    /// The row has no such column.
    Absent,
}

/// A row whose columns claim queries can read.
pub trait ClaimableRow: Row {
    /// Returns the value of `column`.
    fn column(&self, column: Column) -> ColumnValue;
}

/// One `WHERE` term of a claim query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// `column = code`.
    Equals(Column, u8),
    /// `column IS NULL OR column < at`.
    NullOrBefore(Column, DateTime<Utc>),
    /// `column < at`.
    Before(Column, DateTime<Utc>),
}

impl Condition {
    /// Returns true if `row` satisfies this condition.
    pub fn matches<R: ClaimableRow>(&self, row: &R) -> bool {
        match *self {
            Condition::Equals(column, code) => row.column(column) == ColumnValue::Code(code),
            Condition::NullOrBefore(column, at) => match row.column(column) {
                ColumnValue::Time(None) => true,
                ColumnValue::Time(Some(t)) => t < at,
                _ => false,
            },
            Condition::Before(column, at) => match row.column(column) {
                ColumnValue::Time(Some(t)) => t < at,
                _ => false,
            },
        }
    }

    fn to_sql(&self) -> String {
        match *self {
            Condition::Equals(column, code) => format!("\"{}\" = {code}", column.name()),
            Condition::NullOrBefore(column, at) => format!(
                "(\"{0}\" IS NULL OR \"{0}\" < '{1}')",
                column.name(),
                at.to_rfc3339()
            ),
            Condition::Before(column, at) => {
                format!("\"{}\" < '{}'", column.name(), at.to_rfc3339())
            }
        }
    }
}

/// A filtered, ordered candidate query for one work category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimQuery {
    name: &'static str,
    conditions: Vec<Condition>,
    order_by: Column,
    state_column: Column,
    in_progress: u8,
    progress_column: Column,
}

impl ClaimQuery {
    fn new(name: &'static str, state_column: Column, in_progress: u8, progress_column: Column, order_by: Column) -> Self {
        Self {
            name,
            conditions: Vec::new(),
            order_by,
            state_column,
            in_progress,
            progress_column,
        }
    }

    fn verification(name: &'static str, order_by: Column) -> Self {
        Self::new(
            name,
            Column::VerificationState,
            VerificationState::VerificationStarted.code(),
            Column::VerificationStartedAt,
            order_by,
        )
    }

    fn sync(name: &'static str, order_by: Column) -> Self {
        Self::new(
            name,
            Column::State,
            SyncState::Started.code(),
            Column::LastSyncedAt,
            order_by,
        )
    }

    /// Verification pending, oldest `verified_at` first.
    pub fn verification_pending() -> Self {
        Self::verification("verification_pending", Column::VerifiedAt).filter(Condition::Equals(
            Column::VerificationState,
            VerificationState::VerificationPending.code(),
        ))
    }

    /// Verification failed and due for retry, oldest retry time first.
    pub fn verification_failed(now: DateTime<Utc>) -> Self {
        Self::verification("verification_failed", Column::VerificationRetryAt)
            .filter(Condition::Equals(
                Column::VerificationState,
                VerificationState::VerificationFailed.code(),
            ))
            .filter(Condition::NullOrBefore(Column::VerificationRetryAt, now))
    }

    /// Verification started before `cutoff`.
    pub fn verification_timed_out(cutoff: DateTime<Utc>) -> Self {
        Self::verification("verification_timed_out", Column::VerificationStartedAt)
            .filter(Condition::Equals(
                Column::VerificationState,
                VerificationState::VerificationStarted.code(),
            ))
            .filter(Condition::Before(Column::VerificationStartedAt, cutoff))
    }

    /// Verification succeeded before `cutoff`, oldest first.
    pub fn needs_reverification(cutoff: DateTime<Utc>) -> Self {
        Self::verification("needs_reverification", Column::VerifiedAt)
            .filter(Condition::Equals(
                Column::VerificationState,
                VerificationState::VerificationSucceeded.code(),
            ))
            .filter(Condition::Before(Column::VerifiedAt, cutoff))
    }

    /// Sync pending, never-attempted rows first.
    pub fn sync_pending() -> Self {
        Self::sync("sync_pending", Column::LastSyncedAt)
            .filter(Condition::Equals(Column::State, SyncState::Pending.code()))
    }

    /// Sync failed and due for retry, oldest retry time first.
    pub fn sync_failed(now: DateTime<Utc>) -> Self {
        Self::sync("sync_failed", Column::RetryAt)
            .filter(Condition::Equals(Column::State, SyncState::Failed.code()))
            .filter(Condition::NullOrBefore(Column::RetryAt, now))
    }

    /// Sync started before `cutoff`.
    pub fn sync_timed_out(cutoff: DateTime<Utc>) -> Self {
        Self::sync("sync_timed_out", Column::LastSyncedAt)
            .filter(Condition::Equals(Column::State, SyncState::Started.code()))
            .filter(Condition::Before(Column::LastSyncedAt, cutoff))
    }

    /// Adds a condition.
    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Adds several conditions.
    #[must_use]
    pub fn filter_all(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    /// Returns the work category name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true if `row` is a candidate.
    pub fn matches<R: ClaimableRow>(&self, row: &R) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }

    /// Orders rows ascending by the sort column, nulls first.
    pub fn compare<R: ClaimableRow>(&self, a: &R, b: &R) -> Ordering {
        match (a.column(self.order_by), b.column(self.order_by)) {
            (ColumnValue::Time(a), ColumnValue::Time(b)) => a.cmp(&b),
            (ColumnValue::Code(a), ColumnValue::Code(b)) => a.cmp(&b),
            _ => Ordering::Equal,
        }
    }

    /// Renders the claim as a single SQL statement.
    pub fn to_sql(&self, table: &str, key_column: &str, limit: usize) -> String {
        let mut sql = format!(
            "UPDATE {table} SET \"{}\" = {}, \"{}\" = NOW() WHERE {key_column} IN (SELECT {key_column} FROM {table}",
            self.state_column.name(),
            self.in_progress,
            self.progress_column.name(),
        );
        for (i, condition) in self.conditions.iter().enumerate() {
            let keyword = if i == 0 { "WHERE" } else { "AND" };
            let _ = write!(sql, " {keyword} {}", condition.to_sql());
        }
        let _ = write!(
            sql,
            " ORDER BY \"{}\" ASC NULLS FIRST LIMIT {limit} FOR UPDATE SKIP LOCKED) RETURNING {key_column}",
            self.order_by.name()
        );
        sql
    }
}

/// Claims up to `limit` rows matching `query`, applying `apply` to each.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn claim_batch<R: ClaimableRow>(
    table: &dyn Table<R>,
    query: &ClaimQuery,
    limit: usize,
    apply: &mut dyn FnMut(&mut R),
) -> CoreResult<Vec<RecordId>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let filter = |row: &R| query.matches(row);
    let order = |a: &R, b: &R| query.compare(a, b);
    let keys = table.claim(Selection::new(&filter, &order, limit), apply)?;
    tracing::debug!(
        table = table.name(),
        query = query.name(),
        claimed = keys.len(),
        "claimed batch"
    );
    Ok(keys)
}

/// Reads up to `limit` rows matching `query` in claim order, without
/// locking or changing them.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn select_candidates<R: ClaimableRow>(
    table: &dyn Table<R>,
    query: &ClaimQuery,
    limit: usize,
) -> CoreResult<Vec<R>> {
    let filter = |row: &R| query.matches(row);
    let order = |a: &R, b: &R| query.compare(a, b);
    Ok(table.select(Selection::new(&filter, &order, limit))?)
}

fn verification_column(fields: &crate::model::VerificationFields, column: Column) -> ColumnValue {
    match column {
        Column::VerificationState => ColumnValue::Code(fields.state.code()),
        Column::VerificationRetryAt => ColumnValue::Time(fields.retry_at),
        Column::VerifiedAt => ColumnValue::Time(fields.verified_at),
        Column::VerificationStartedAt => ColumnValue::Time(fields.started_at),
        _ => ColumnValue::Absent,
    }
}

impl ClaimableRow for Resource {
    fn column(&self, column: Column) -> ColumnValue {
        verification_column(&self.verification, column)
    }
}

impl ClaimableRow for VerificationStateRow {
    fn column(&self, column: Column) -> ColumnValue {
        verification_column(&self.verification, column)
    }
}

impl ClaimableRow for RegistryRecord {
    fn column(&self, column: Column) -> ColumnValue {
        match column {
            Column::State => ColumnValue::Code(self.state.code()),
            Column::RetryAt => ColumnValue::Time(self.retry_at),
            Column::LastSyncedAt => ColumnValue::Time(self.last_synced_at),
            other => verification_column(&self.verification, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use georep_storage::InMemoryTable;

    fn registry(id: i64, state: SyncState, retry_at: Option<DateTime<Utc>>) -> RegistryRecord {
        let mut r = RegistryRecord::new(id, Utc::now());
        r.state = state;
        r.retry_at = retry_at;
        r
    }

    #[test]
    fn failed_query_respects_retry_due() {
        let now = Utc::now();
        let query = ClaimQuery::sync_failed(now);

        assert!(query.matches(&registry(1, SyncState::Failed, None)));
        assert!(query.matches(&registry(2, SyncState::Failed, Some(now - Duration::seconds(1)))));
        assert!(!query.matches(&registry(3, SyncState::Failed, Some(now + Duration::seconds(1)))));
        assert!(!query.matches(&registry(4, SyncState::Pending, None)));
    }

    #[test]
    fn order_is_nulls_first() {
        let now = Utc::now();
        let query = ClaimQuery::sync_failed(now);
        let a = registry(1, SyncState::Failed, Some(now - Duration::seconds(5)));
        let b = registry(2, SyncState::Failed, None);
        assert_eq!(query.compare(&b, &a), Ordering::Less);
    }

    #[test]
    fn resource_has_no_sync_columns() {
        let resource = Resource::new(1, "a", Utc::now());
        assert_eq!(resource.column(Column::State), ColumnValue::Absent);
        assert!(!ClaimQuery::sync_pending().matches(&resource));
        assert!(ClaimQuery::verification_pending().matches(&resource));
    }

    #[test]
    fn claim_batch_orders_by_retry_at() {
        let now = Utc::now();
        let table = InMemoryTable::with_rows(
            "registry",
            vec![
                registry(1, SyncState::Failed, Some(now - Duration::seconds(1))),
                registry(2, SyncState::Failed, Some(now - Duration::seconds(30))),
                registry(3, SyncState::Failed, Some(now + Duration::seconds(30))),
                registry(4, SyncState::Failed, None),
            ],
        );

        let claimed = claim_batch(&table, &ClaimQuery::sync_failed(now), 10, &mut |r| {
            r.state = SyncState::Started
        })
        .unwrap();
        assert_eq!(claimed, vec![4, 2, 1]);
    }

    #[test]
    fn zero_limit_claims_nothing() {
        let table = InMemoryTable::with_rows("registry", vec![registry(1, SyncState::Pending, None)]);
        let claimed = claim_batch(&table, &ClaimQuery::sync_pending(), 0, &mut |_| {}).unwrap();
        assert!(claimed.is_empty());
    }

    #[test]
    fn renders_skip_locked_sql() {
        let sql = ClaimQuery::verification_pending().to_sql("upload_registry", "id", 10);
        assert_eq!(
            sql,
            "UPDATE upload_registry SET \"verification_state\" = 1, \"verification_started_at\" = NOW() \
             WHERE id IN (SELECT id FROM upload_registry WHERE \"verification_state\" = 0 \
             ORDER BY \"verified_at\" ASC NULLS FIRST LIMIT 10 FOR UPDATE SKIP LOCKED) RETURNING id"
        );
    }

    #[test]
    fn renders_retry_due_condition() {
        let now = Utc::now();
        let sql = ClaimQuery::sync_failed(now).to_sql("t", "pk", 5);
        assert!(sql.contains("\"state\" = 3 AND (\"retry_at\" IS NULL OR \"retry_at\" < '"));
        assert!(sql.starts_with("UPDATE t SET \"state\" = 1, \"last_synced_at\" = NOW()"));
    }
}
