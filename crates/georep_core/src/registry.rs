//! Sync registry state machine.
//!
//! Tracks one resource's replication on one secondary:
//! `pending` -> `started` -> `synced` | `failed`, with `pending` reachable
//! from any state (resync) and `started` reachable again from `synced` or
//! `failed` (new attempt).

use crate::claim::{claim_batch, ClaimQuery, Column, Condition};
use crate::clock::Clock;
use crate::config::describe_duration;
use crate::error::{failure_message, CoreError, CoreResult, FailureKind};
use crate::model::{Checksum, RecordId, RegistryRecord, SyncState, VerificationFields, VerificationState};
use crate::retry::RetryPolicy;
use crate::verification::{
    apply_verification_transition, verification_transition, TransitionContext, VerifiableRow,
    VerificationEvent,
};
use chrono::{DateTime, Utc};
use georep_storage::Table;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Events accepted by the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// A transfer begins.
    Start,
    /// The transfer finished. `ready_to_verify` selects whether
    /// verification is reset to pending or disabled.
    Synced {
        /// Whether the primary's checksum is available.
        ready_to_verify: bool,
    },
    /// The transfer failed.
    Fail,
    /// The resource must be transferred again.
    Resync,
}

/// Side effects run when entering a sync state, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEffect {
    /// `last_synced_at = now`.
    RecordAttempt,
    /// Clears retry count and retry time.
    ClearRetry,
    /// Clears the failure message and the missing-on-primary flag.
    ClearFailure,
    /// Increments the retry count and schedules the next retry, with the
    /// extended cap if the resource is missing on the primary.
    ScheduleRetry,
    /// Moves verification to `verification_pending`.
    ResetVerification,
    /// Moves verification to `verification_disabled`.
    DisableVerification,
}

/// The sync transition table.
///
/// # Errors
///
/// Returns [`CoreError::InvalidTransition`] for `Start` from `started` and
/// for `Synced` outside `started`.
pub fn sync_transition(
    state: SyncState,
    event: SyncEvent,
) -> CoreResult<(SyncState, &'static [SyncEffect])> {
    use SyncEffect as E;
    match (state, event) {
        (SyncState::Started, SyncEvent::Start) => {
            Err(CoreError::invalid_transition("sync", state, event))
        }
        (_, SyncEvent::Start) => Ok((SyncState::Started, &[E::RecordAttempt])),
        (SyncState::Started, SyncEvent::Synced { ready_to_verify: true }) => Ok((
            SyncState::Synced,
            &[E::ClearRetry, E::ClearFailure, E::ResetVerification],
        )),
        (SyncState::Started, SyncEvent::Synced { ready_to_verify: false }) => Ok((
            SyncState::Synced,
            &[E::ClearRetry, E::ClearFailure, E::DisableVerification],
        )),
        (_, SyncEvent::Synced { .. }) => Err(CoreError::invalid_transition("sync", state, event)),
        (_, SyncEvent::Fail) => Ok((SyncState::Failed, &[E::ScheduleRetry])),
        (_, SyncEvent::Resync) => Ok((SyncState::Pending, &[E::ClearRetry])),
    }
}

/// Applies a looked-up sync transition to a registry row.
pub fn apply_sync_transition(
    row: &mut RegistryRecord,
    to: SyncState,
    effects: &[SyncEffect],
    ctx: &TransitionContext<'_>,
) {
    for effect in effects {
        match effect {
            SyncEffect::RecordAttempt => row.last_synced_at = Some(ctx.now),
            SyncEffect::ClearRetry => {
                row.retry_count = 0;
                row.retry_at = None;
            }
            SyncEffect::ClearFailure => {
                row.last_sync_failure = None;
                row.missing_on_primary = false;
            }
            SyncEffect::ScheduleRetry => {
                row.retry_count = row.retry_count.saturating_add(1);
                row.retry_at = Some(ctx.retry.next_retry_time(
                    row.retry_count,
                    row.missing_on_primary,
                    ctx.now,
                ));
            }
            SyncEffect::ResetVerification | SyncEffect::DisableVerification => {
                let event = if *effect == SyncEffect::ResetVerification {
                    VerificationEvent::Reset
                } else {
                    VerificationEvent::Disable
                };
                if let Ok((vto, veffects)) = verification_transition(row.verification.state, event) {
                    apply_verification_transition(row, vto, veffects, ctx);
                }
            }
        }
    }
    row.state = to;
}

/// Runs `event` against a registry row.
///
/// # Errors
///
/// Returns an error if the event is not valid in the row's state; the row
/// is left unchanged.
pub fn apply_sync_event(
    row: &mut RegistryRecord,
    event: SyncEvent,
    ctx: &TransitionContext<'_>,
) -> CoreResult<SyncState> {
    let (to, effects) = sync_transition(row.state, event)?;
    apply_sync_transition(row, to, effects, ctx);
    Ok(to)
}

fn fire(row: &mut RegistryRecord, event: SyncEvent, ctx: &TransitionContext<'_>) {
    if let Ok((to, effects)) = sync_transition(row.state, event) {
        apply_sync_transition(row, to, effects, ctx);
    }
}

impl VerifiableRow for RegistryRecord {
    fn verification(&self) -> &VerificationFields {
        &self.verification
    }

    fn verification_mut(&mut self) -> &mut VerificationFields {
        &mut self.verification
    }

    fn availability() -> Vec<Condition> {
        vec![Condition::Equals(Column::State, SyncState::Synced.code())]
    }

    fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.changed_at
    }

    fn checksum_mismatch(&self) -> bool {
        self.checksum_mismatch
    }

    fn record_checksum_mismatch(&mut self, checksum: Checksum) {
        self.verification.checksum = Some(checksum);
        self.verification_checksum_mismatched = Some(checksum);
        self.checksum_mismatch = true;
    }

    fn on_verification_transition(&mut self, to: VerificationState, ctx: &TransitionContext<'_>) {
        match to {
            VerificationState::VerificationSucceeded => {
                self.checksum_mismatch = false;
                self.verification_checksum_mismatched = None;
            }
            VerificationState::VerificationFailed => {
                // A copy that fails verification is resynced.
                let reason = self.verification.failure.as_deref().unwrap_or("unknown error");
                self.last_sync_failure =
                    Some(failure_message(&format!("Verification failed with: {reason}"), None));
                fire(self, SyncEvent::Fail, ctx);
            }
            _ => {}
        }
    }
}

/// Counts of registry rows per sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    /// All rows.
    pub total: usize,
    /// Rows in `pending`.
    pub pending: usize,
    /// Rows in `started`.
    pub started: usize,
    /// Rows in `synced`.
    pub synced: usize,
    /// Rows in `failed`.
    pub failed: usize,
    /// Rows flagged missing on the primary.
    pub missing_on_primary: usize,
}

/// The registry table of one resource kind on a secondary.
pub struct SyncRegistry {
    table: Arc<dyn Table<RegistryRecord>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl SyncRegistry {
    /// Creates a registry over `table`.
    pub fn new(table: Arc<dyn Table<RegistryRecord>>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { table, clock, retry }
    }

    /// Returns the underlying table.
    pub fn table(&self) -> &Arc<dyn Table<RegistryRecord>> {
        &self.table
    }

    /// Returns the table name.
    pub fn name(&self) -> &str {
        self.table.name()
    }

    fn update(
        &self,
        id: RecordId,
        predicate: &dyn Fn(&RegistryRecord) -> bool,
        apply: &mut dyn FnMut(&mut RegistryRecord, &TransitionContext<'_>),
    ) -> CoreResult<bool> {
        let ctx = TransitionContext::new(self.clock.now(), &self.retry);
        Ok(self.table.update_if(id, predicate, &mut |row| apply(row, &ctx))?)
    }

    /// Reads a registry row.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get(&self, id: RecordId) -> CoreResult<Option<RegistryRecord>> {
        Ok(self.table.get(id)?)
    }

    /// Returns the row for `id`, creating a pending one if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn find_or_initialize(&self, id: RecordId) -> CoreResult<RegistryRecord> {
        let record = RegistryRecord::new(id, self.clock.now());
        if self.table.insert(record.clone())? {
            tracing::debug!(table = self.name(), model_record_id = id, "created registry row");
            return Ok(record);
        }
        Ok(self.table.get(id)?.unwrap_or(record))
    }

    /// Deletes the row for `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn delete(&self, id: RecordId) -> CoreResult<bool> {
        Ok(self.table.delete(id)?)
    }

    /// Moves a row to `started` and records the attempt time.
    ///
    /// This gives no mutual exclusion: two callers can both start the same
    /// row. Workers obtain rows through [`SyncRegistry::claim_sync_batch`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn start_sync(&self, id: RecordId) -> CoreResult<bool> {
        self.update(id, &|row| row.state != SyncState::Started, &mut |row, ctx| {
            fire(row, SyncEvent::Start, ctx)
        })
    }

    /// Moves a row from `started` to `synced`.
    ///
    /// Returns `false`, leaving the row untouched, if the row is no longer
    /// `started`, which happens when an update event pushed it back to
    /// `pending` during the transfer. The pending sync then runs on the
    /// next pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn mark_synced(&self, id: RecordId, ready_to_verify: bool) -> CoreResult<bool> {
        let updated = self.update(id, &|row| row.state == SyncState::Started, &mut |row, ctx| {
            fire(row, SyncEvent::Synced { ready_to_verify }, ctx)
        })?;
        if updated {
            tracing::info!(table = self.name(), model_record_id = id, "synced");
        } else {
            tracing::info!(
                table = self.name(),
                model_record_id = id,
                "registry left started during sync, not marking synced"
            );
        }
        Ok(updated)
    }

    /// Records a failed transfer and schedules a retry.
    ///
    /// With `missing_on_primary` the extended retry cap applies.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn mark_failed(
        &self,
        id: RecordId,
        message: &str,
        error: Option<&dyn fmt::Display>,
        missing_on_primary: bool,
    ) -> CoreResult<bool> {
        let failure = failure_message(message, error);
        tracing::warn!(
            table = self.name(),
            model_record_id = id,
            failure = %FailureKind::TransferFailure,
            missing_on_primary,
            message = %failure,
            "sync failed"
        );
        self.update(id, &|_| true, &mut |row, ctx| {
            row.last_sync_failure = Some(failure.clone());
            row.missing_on_primary = missing_on_primary;
            fire(row, SyncEvent::Fail, ctx);
        })
    }

    /// Moves a row to `pending` unless a sync is in flight.
    ///
    /// Used for immutable resources, whose content cannot have changed
    /// under a running transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn resync(&self, id: RecordId) -> CoreResult<bool> {
        self.update(id, &|row| row.state != SyncState::Started, &mut |row, ctx| {
            fire(row, SyncEvent::Resync, ctx)
        })
    }

    /// Forces a row to `pending` after an update event on a mutable
    /// resource, even if a sync is in flight.
    ///
    /// The in-flight sync's [`SyncRegistry::mark_synced`] then fails, so the
    /// stale copy is never recorded as synced. Verification is reset and
    /// `changed_at` moves forward so an in-flight checksum is discarded too.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn reschedule_on_update_event(&self, id: RecordId) -> CoreResult<bool> {
        self.update(id, &|_| true, &mut |row, ctx| {
            fire(row, SyncEvent::Resync, ctx);
            row.changed_at = Some(ctx.now);
            if let Ok((to, effects)) =
                verification_transition(row.verification.state, VerificationEvent::Reset)
            {
                apply_verification_transition(row, to, effects, ctx);
            }
        })
    }

    /// Claims pending rows, then failed rows due for retry, up to `limit`,
    /// moving them to `started`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn claim_sync_batch(&self, limit: usize) -> CoreResult<Vec<RecordId>> {
        let ctx = TransitionContext::new(self.clock.now(), &self.retry);
        let mut start = |row: &mut RegistryRecord| fire(row, SyncEvent::Start, &ctx);

        let mut ids = claim_batch(self.table.as_ref(), &ClaimQuery::sync_pending(), limit, &mut start)?;
        let remaining = limit.saturating_sub(ids.len());
        if remaining > 0 {
            ids.extend(claim_batch(
                self.table.as_ref(),
                &ClaimQuery::sync_failed(ctx.now),
                remaining,
                &mut start,
            )?);
        }
        Ok(ids)
    }

    /// Fails rows stuck in `started` for longer than `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn fail_sync_timeouts(&self, timeout: Duration) -> CoreResult<usize> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let query = ClaimQuery::sync_timed_out(cutoff);
        let message = format!("Sync timed out after {}", describe_duration(timeout));

        let swept = self.table.update_where(&|row| query.matches(row), &mut |row| {
            row.state = SyncState::Failed;
            row.last_sync_failure = Some(message.clone());
            row.retry_count = 1;
            row.retry_at = Some(self.retry.next_retry_time(1, row.missing_on_primary, now));
        })?;

        if swept > 0 {
            tracing::warn!(
                table = self.name(),
                count = swept,
                failure = %FailureKind::SyncTimeout,
                "sync timed out"
            );
        }
        Ok(swept)
    }

    /// Counts rows needing sync, stopping at `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn needs_sync_count(&self, limit: usize) -> CoreResult<usize> {
        let pending = ClaimQuery::sync_pending();
        let failed = ClaimQuery::sync_failed(self.clock.now());
        Ok(self
            .table
            .count(&|row| pending.matches(row) || failed.matches(row), Some(limit))?)
    }

    /// Counts rows per state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn counts(&self) -> CoreResult<SyncCounts> {
        let count = |state: SyncState| self.table.count(&|row| row.state == state, None);
        Ok(SyncCounts {
            total: self.table.count(&|_| true, None)?,
            pending: count(SyncState::Pending)?,
            started: count(SyncState::Started)?,
            synced: count(SyncState::Synced)?,
            failed: count(SyncState::Failed)?,
            missing_on_primary: self.table.count(&|row| row.missing_on_primary, None)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::verification::{TableVerificationStore, VerificationOutcome, VerificationTracker};
    use georep_storage::InMemoryTable;
    use proptest::prelude::*;

    struct Fixture {
        clock: Arc<MockClock>,
        table: Arc<InMemoryTable<RegistryRecord>>,
        registry: SyncRegistry,
        verification: TableVerificationStore<RegistryRecord>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(MockClock::starting_now());
        let table = Arc::new(InMemoryTable::new("upload_registry"));
        let registry = SyncRegistry::new(table.clone(), clock.clone(), RetryPolicy::new());
        let verification = TableVerificationStore::new(table.clone(), clock.clone(), RetryPolicy::new());
        Fixture {
            clock,
            table,
            registry,
            verification,
        }
    }

    fn synced(f: &Fixture, id: RecordId) {
        f.registry.find_or_initialize(id).unwrap();
        f.registry.start_sync(id).unwrap();
        assert!(f.registry.mark_synced(id, true).unwrap());
    }

    fn row(f: &Fixture, id: RecordId) -> RegistryRecord {
        f.registry.get(id).unwrap().unwrap()
    }

    #[test]
    fn find_or_initialize_is_idempotent() {
        let f = fixture();
        let first = f.registry.find_or_initialize(1).unwrap();
        assert_eq!(first.state, SyncState::Pending);

        f.registry.start_sync(1).unwrap();
        let second = f.registry.find_or_initialize(1).unwrap();
        assert_eq!(second.state, SyncState::Started);
        assert_eq!(f.table.len(), 1);
    }

    #[test]
    fn start_sync_records_attempt() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        assert!(f.registry.start_sync(1).unwrap());
        let r = row(&f, 1);
        assert_eq!(r.state, SyncState::Started);
        assert_eq!(r.last_synced_at, Some(f.clock.now()));
    }

    #[test]
    fn mark_synced_requires_started() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();

        assert!(!f.registry.mark_synced(1, true).unwrap());
        assert_eq!(row(&f, 1).state, SyncState::Pending);

        f.registry.start_sync(1).unwrap();
        assert!(f.registry.mark_synced(1, true).unwrap());
        assert_eq!(row(&f, 1).state, SyncState::Synced);
    }

    #[test]
    fn mark_synced_clears_failure_and_resets_verification() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        f.registry.start_sync(1).unwrap();
        f.registry.mark_failed(1, "Sync failed", None, true).unwrap();
        f.registry.start_sync(1).unwrap();
        assert!(f.registry.mark_synced(1, true).unwrap());

        let r = row(&f, 1);
        assert_eq!(r.retry_count, 0);
        assert_eq!(r.retry_at, None);
        assert_eq!(r.last_sync_failure, None);
        assert!(!r.missing_on_primary);
        assert_eq!(r.verification.state, VerificationState::VerificationPending);
    }

    #[test]
    fn mark_synced_disables_verification_when_not_ready() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        f.registry.start_sync(1).unwrap();
        f.registry.mark_synced(1, false).unwrap();
        assert_eq!(row(&f, 1).verification.state, VerificationState::VerificationDisabled);
    }

    #[test]
    fn mark_failed_appends_error_and_backs_off() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        f.registry.start_sync(1).unwrap();

        let err = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        f.registry.mark_failed(1, "Sync failed", Some(&err), false).unwrap();

        let r = row(&f, 1);
        assert_eq!(r.state, SyncState::Failed);
        assert_eq!(r.last_sync_failure.as_deref(), Some("Sync failed: connection reset"));
        assert_eq!(r.retry_count, 1);
        assert!(r.retry_at.unwrap() > f.clock.now());
    }

    #[test]
    fn missing_on_primary_uses_extended_cap() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        f.table
            .update_if(1, &|_| true, &mut |r| r.retry_count = 40)
            .unwrap();

        f.registry.mark_failed(1, "File is not on the primary", None, true).unwrap();
        let r = row(&f, 1);
        let delay = r.retry_at.unwrap() - f.clock.now();
        assert!(delay > chrono::Duration::hours(1));
        assert!(delay <= chrono::Duration::hours(4));
        assert!(r.missing_on_primary);
    }

    #[test]
    fn resync_skips_in_flight_rows() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        f.registry.start_sync(1).unwrap();
        assert!(!f.registry.resync(1).unwrap());
        assert_eq!(row(&f, 1).state, SyncState::Started);
    }

    #[test]
    fn update_event_rejects_in_flight_mark_synced() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        f.registry.claim_sync_batch(10).unwrap();

        assert!(f.registry.reschedule_on_update_event(1).unwrap());
        assert!(!f.registry.mark_synced(1, true).unwrap());

        let r = row(&f, 1);
        assert_eq!(r.state, SyncState::Pending);
        assert_eq!(r.changed_at, Some(f.clock.now()));
        assert_eq!(f.registry.claim_sync_batch(10).unwrap(), vec![1]);
    }

    #[test]
    fn claim_prefers_pending_then_due_failures() {
        let f = fixture();
        for id in 1..=3 {
            f.registry.find_or_initialize(id).unwrap();
        }
        f.registry.start_sync(3).unwrap();
        f.registry.mark_failed(3, "boom", None, false).unwrap();

        assert_eq!(f.registry.claim_sync_batch(10).unwrap(), vec![1, 2]);
        assert!(f.registry.claim_sync_batch(10).unwrap().is_empty());

        f.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(f.registry.claim_sync_batch(10).unwrap(), vec![3]);
    }

    #[test]
    fn timeout_sweep() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        f.registry.find_or_initialize(2).unwrap();
        f.registry.start_sync(1).unwrap();
        f.clock.advance(chrono::Duration::hours(9));
        f.registry.start_sync(2).unwrap();

        let swept = f.registry.fail_sync_timeouts(Duration::from_secs(8 * 3600)).unwrap();
        assert_eq!(swept, 1);

        let r = row(&f, 1);
        assert_eq!(r.state, SyncState::Failed);
        assert!(r.last_sync_failure.unwrap().contains("timed out"));
        assert_eq!(r.retry_count, 1);
        assert_eq!(row(&f, 2).state, SyncState::Started);
    }

    #[test]
    fn mismatch_flags_and_resyncs() {
        let f = fixture();
        synced(&f, 1);
        let tracker = VerificationTracker::new(&f.verification);
        let local = Checksum::from_bytes([1; 32]);
        let primary = Checksum::from_bytes([2; 32]);

        let outcome = tracker
            .track_checksum_attempt(1, true, Some(primary), || Ok::<_, String>(local))
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::Mismatch { checksum: local, primary });

        let r = row(&f, 1);
        assert_eq!(r.verification.state, VerificationState::VerificationFailed);
        assert_eq!(r.verification.checksum, Some(local));
        assert_eq!(r.verification_checksum_mismatched, Some(local));
        assert!(r.checksum_mismatch);
        let failure = r.verification.failure.unwrap();
        assert!(failure.starts_with("Checksum does not match the primary checksum"));
        assert!(failure.contains(&primary.to_hex()));

        assert_eq!(r.state, SyncState::Failed);
        assert!(r
            .last_sync_failure
            .unwrap()
            .starts_with("Verification failed with: Checksum does not match"));
        assert_eq!(r.retry_count, 1);
    }

    #[test]
    fn matching_verification_clears_mismatch() {
        let f = fixture();
        synced(&f, 1);
        let tracker = VerificationTracker::new(&f.verification);
        let good = Checksum::from_bytes([2; 32]);

        tracker
            .track_checksum_attempt(1, true, Some(good), || Ok::<_, String>(Checksum::from_bytes([1; 32])))
            .unwrap();
        assert!(row(&f, 1).checksum_mismatch);

        // Resync, then verify again with the right content.
        f.clock.advance(chrono::Duration::hours(2));
        assert_eq!(f.registry.claim_sync_batch(1).unwrap(), vec![1]);
        assert!(f.registry.mark_synced(1, true).unwrap());
        assert!(row(&f, 1).checksum_mismatch);

        let outcome = tracker
            .track_checksum_attempt(1, true, Some(good), || Ok::<_, String>(good))
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::Succeeded(good));
        let r = row(&f, 1);
        assert!(!r.checksum_mismatch);
        assert_eq!(r.verification_checksum_mismatched, None);
    }

    #[test]
    fn verification_only_claims_synced_rows() {
        let f = fixture();
        f.registry.find_or_initialize(1).unwrap();
        synced(&f, 2);
        use crate::verification::VerificationStore;
        assert_eq!(f.verification.claim_verification_batch(10).unwrap(), vec![2]);
    }

    #[test]
    fn counts_by_state() {
        let f = fixture();
        synced(&f, 1);
        f.registry.find_or_initialize(2).unwrap();
        f.registry.find_or_initialize(3).unwrap();
        f.registry.start_sync(3).unwrap();
        f.registry.mark_failed(3, "gone", None, true).unwrap();

        let counts = f.registry.counts().unwrap();
        assert_eq!(
            counts,
            SyncCounts {
                total: 3,
                pending: 1,
                started: 0,
                synced: 1,
                failed: 1,
                missing_on_primary: 1,
            }
        );
        assert_eq!(f.registry.needs_sync_count(10).unwrap(), 1);
    }

    fn any_state() -> impl Strategy<Value = SyncState> {
        proptest::sample::select(SyncState::ALL.to_vec())
    }

    fn any_event() -> impl Strategy<Value = SyncEvent> {
        proptest::sample::select(vec![
            SyncEvent::Start,
            SyncEvent::Synced { ready_to_verify: true },
            SyncEvent::Synced { ready_to_verify: false },
            SyncEvent::Fail,
            SyncEvent::Resync,
        ])
    }

    proptest! {
        #[test]
        fn only_started_rows_become_synced(state in any_state(), event in any_event()) {
            if let Ok((to, _)) = sync_transition(state, event) {
                if to == SyncState::Synced {
                    prop_assert_eq!(state, SyncState::Started);
                }
            }
        }

        #[test]
        fn retry_at_never_decreases(failures in 1usize..40) {
            let f = fixture();
            f.registry.find_or_initialize(1).unwrap();
            let mut last = None;
            for _ in 0..failures {
                f.registry.mark_failed(1, "boom", None, false).unwrap();
                let r = row(&f, 1);
                let at = r.retry_at.unwrap();
                prop_assert!(at >= f.clock.now());
                if let Some(prev) = last {
                    prop_assert!(at >= prev);
                }
                last = Some(at);
            }
        }
    }
}
