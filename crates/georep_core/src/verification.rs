//! Verification state machine.
//!
//! The lifecycle is `verification_pending` -> `verification_started` ->
//! `verification_succeeded` | `verification_failed`, with
//! `verification_disabled` and `verification_pending` reachable from any
//! state. Transitions are a pure table ([`verification_transition`]) that
//! yields the new state and an ordered list of side effects; the effects
//! are applied to a row inside a single atomic store update.
//!
//! The same machine runs on primary resources (co-located or separate
//! verification table) and on secondary registry rows. Rows plug in
//! through [`VerifiableRow`]; stores plug in through [`VerificationStore`].

use crate::claim::{claim_batch, ClaimQuery, ClaimableRow, Condition};
use crate::clock::Clock;
use crate::config::describe_duration;
use crate::error::{failure_message, CoreError, CoreResult, FailureKind};
use crate::model::{
    Checksum, RecordId, Resource, VerificationFields, VerificationState, VerificationStateRow,
};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use georep_storage::Table;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Time and retry policy for applying transition side effects.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    /// Current time.
    pub now: DateTime<Utc>,
    /// Backoff policy for scheduled retries.
    pub retry: &'a RetryPolicy,
}

impl<'a> TransitionContext<'a> {
    /// Creates a context.
    pub fn new(now: DateTime<Utc>, retry: &'a RetryPolicy) -> Self {
        Self { now, retry }
    }
}

/// Events accepted by the verification state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationEvent {
    /// A checksum attempt begins.
    Start,
    /// The checksum attempt produced a checksum.
    Succeed,
    /// The checksum attempt failed.
    Fail,
    /// Verification should be redone.
    Reset,
    /// Verification is not possible.
    Disable,
}

/// Side effects run when entering a verification state, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationEffect {
    /// `verification_started_at = now`.
    RecordStartedAt,
    /// `verified_at = now`.
    RecordVerifiedAt,
    /// Clears the failure message.
    ClearFailure,
    /// Clears retry count and retry time.
    ClearRetry,
    /// Increments the retry count and schedules the next retry.
    ScheduleRetry,
}

use VerificationEffect as E;
use VerificationState as S;

/// The verification transition table.
///
/// # Errors
///
/// Returns [`CoreError::InvalidTransition`] for `Succeed` outside
/// `verification_started`.
pub fn verification_transition(
    state: VerificationState,
    event: VerificationEvent,
) -> CoreResult<(VerificationState, &'static [VerificationEffect])> {
    match event {
        VerificationEvent::Start => Ok((S::VerificationStarted, &[E::RecordStartedAt])),
        VerificationEvent::Succeed if state == S::VerificationStarted => Ok((
            S::VerificationSucceeded,
            &[E::RecordVerifiedAt, E::ClearFailure, E::ClearRetry],
        )),
        VerificationEvent::Succeed => Err(CoreError::invalid_transition("verification", state, event)),
        VerificationEvent::Fail => Ok((S::VerificationFailed, &[E::ScheduleRetry, E::RecordVerifiedAt])),
        VerificationEvent::Reset => Ok((S::VerificationPending, &[E::ClearFailure, E::ClearRetry])),
        VerificationEvent::Disable => Ok((S::VerificationDisabled, &[E::ClearFailure, E::ClearRetry])),
    }
}

/// A row carrying verification columns.
pub trait VerifiableRow: ClaimableRow {
    /// Returns the verification columns.
    fn verification(&self) -> &VerificationFields;

    /// Returns the verification columns for mutation.
    fn verification_mut(&mut self) -> &mut VerificationFields;

    /// Extra conditions a row must meet to be verified at all.
    fn availability() -> Vec<Condition>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// Time of the last content change, if tracked.
    fn changed_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Whether the last verification found a mismatch.
    fn checksum_mismatch(&self) -> bool {
        false
    }

    /// Records a checksum that did not match the primary's.
    fn record_checksum_mismatch(&mut self, _checksum: Checksum) {}

    /// Hook run after the common effects of entering `to`.
    fn on_verification_transition(&mut self, _to: VerificationState, _ctx: &TransitionContext<'_>) {}
}

impl VerifiableRow for Resource {
    fn verification(&self) -> &VerificationFields {
        &self.verification
    }

    fn verification_mut(&mut self) -> &mut VerificationFields {
        &mut self.verification
    }

    fn changed_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }
}

impl VerifiableRow for VerificationStateRow {
    fn verification(&self) -> &VerificationFields {
        &self.verification
    }

    fn verification_mut(&mut self) -> &mut VerificationFields {
        &mut self.verification
    }
}

/// Applies a looked-up transition to a row.
pub fn apply_verification_transition<R: VerifiableRow>(
    row: &mut R,
    to: VerificationState,
    effects: &[VerificationEffect],
    ctx: &TransitionContext<'_>,
) {
    let fields = row.verification_mut();
    for effect in effects {
        match effect {
            E::RecordStartedAt => fields.started_at = Some(ctx.now),
            E::RecordVerifiedAt => fields.verified_at = Some(ctx.now),
            E::ClearFailure => fields.failure = None,
            E::ClearRetry => {
                fields.retry_count = 0;
                fields.retry_at = None;
            }
            E::ScheduleRetry => {
                fields.retry_count = fields.retry_count.saturating_add(1);
                fields.retry_at = Some(ctx.retry.next_retry_time(fields.retry_count, false, ctx.now));
            }
        }
    }
    fields.state = to;
    row.on_verification_transition(to, ctx);
}

/// Runs `event` against a row.
///
/// # Errors
///
/// Returns an error if the event is not valid in the row's state; the row
/// is left unchanged.
pub fn apply_verification_event<R: VerifiableRow>(
    row: &mut R,
    event: VerificationEvent,
    ctx: &TransitionContext<'_>,
) -> CoreResult<VerificationState> {
    let (to, effects) = verification_transition(row.verification().state, event)?;
    apply_verification_transition(row, to, effects, ctx);
    Ok(to)
}

fn can_apply(state: VerificationState, event: VerificationEvent) -> bool {
    verification_transition(state, event).is_ok()
}

/// A failed checksum attempt to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationFailure {
    /// Failure message, already truncated.
    pub message: String,
    /// Checksum to store, if any.
    pub checksum: Option<Checksum>,
    /// Local checksum that differed from the primary's.
    pub mismatched: Option<Checksum>,
}

impl VerificationFailure {
    /// A failure of the checksum routine itself.
    pub fn compute(error: &dyn fmt::Display) -> Self {
        Self {
            message: failure_message("Error during verification", Some(error)),
            checksum: None,
            mismatched: None,
        }
    }

    /// A checksum that differs from the primary's.
    pub fn mismatch(checksum: Checksum, primary: Checksum) -> Self {
        Self {
            message: failure_message(
                &format!(
                    "Checksum does not match the primary checksum (checksum: {checksum}, primary_checksum: {primary})"
                ),
                None,
            ),
            checksum: Some(checksum),
            mismatched: Some(checksum),
        }
    }
}

/// Result of recording a successful checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessResult {
    /// The row is now `verification_succeeded`.
    Succeeded,
    /// The row changed while the checksum was computed and is back to
    /// `verification_pending`.
    Stale,
    /// The row left `verification_started` (or disappeared) during the
    /// computation; nothing was written.
    Superseded,
}

/// Storage accessor for verification columns.
///
/// Every method is a single atomic store operation.
pub trait VerificationStore: Send + Sync {
    /// Returns the table name.
    fn name(&self) -> &str;

    /// Returns the current time of the store's clock.
    fn now(&self) -> DateTime<Utc>;

    /// Reads the verification columns of a row.
    fn fields(&self, id: RecordId) -> CoreResult<Option<VerificationFields>>;

    /// Moves a row to `verification_started` unless it already is.
    fn start(&self, id: RecordId) -> CoreResult<bool>;

    /// Records a checksum for a row in `verification_started`.
    ///
    /// If the row changed after `calculation_started_at`, it is moved back
    /// to `verification_pending` in the same update.
    fn succeed(
        &self,
        id: RecordId,
        checksum: Checksum,
        calculation_started_at: DateTime<Utc>,
    ) -> CoreResult<SuccessResult>;

    /// Records a failed attempt on a row in `verification_started`.
    ///
    /// Returns false, writing nothing, if the row left that state while
    /// the attempt ran.
    fn fail(&self, id: RecordId, failure: &VerificationFailure) -> CoreResult<bool>;

    /// Moves a row to `verification_disabled`.
    fn disable(&self, id: RecordId) -> CoreResult<bool>;

    /// Moves a row to `verification_pending`.
    fn reset(&self, id: RecordId) -> CoreResult<bool>;

    /// Claims pending rows, then failed rows due for retry, up to `limit`.
    fn claim_verification_batch(&self, limit: usize) -> CoreResult<Vec<RecordId>>;

    /// Fails rows stuck in `verification_started` for longer than `timeout`.
    fn fail_verification_timeouts(&self, timeout: Duration) -> CoreResult<usize>;

    /// Marks up to `limit` rows verified before `now - interval` as pending.
    fn reverify_batch(&self, limit: usize, interval: Duration) -> CoreResult<usize>;

    /// Counts rows needing verification, stopping at `limit`.
    fn needs_verification_count(&self, limit: usize) -> CoreResult<usize>;

    /// Counts rows needing reverification, stopping at `limit`.
    fn needs_reverification_count(&self, limit: usize, interval: Duration) -> CoreResult<usize>;

    /// Counts available rows in `state`.
    fn count_in_state(&self, state: VerificationState) -> CoreResult<usize>;

    /// Counts rows with a checksum.
    fn checksummed_count(&self) -> CoreResult<usize>;

    /// Counts rows flagged with a checksum mismatch.
    fn mismatch_count(&self) -> CoreResult<usize>;
}

fn before(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// [`VerificationStore`] over a [`Table`] of [`VerifiableRow`]s.
pub struct TableVerificationStore<R: VerifiableRow> {
    table: Arc<dyn Table<R>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<R: VerifiableRow> TableVerificationStore<R> {
    /// Creates a store.
    pub fn new(table: Arc<dyn Table<R>>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { table, clock, retry }
    }

    /// Returns the underlying table.
    pub fn table(&self) -> &Arc<dyn Table<R>> {
        &self.table
    }

    fn transition(&self, id: RecordId, event: VerificationEvent, extra: &dyn Fn(&R) -> bool) -> CoreResult<bool> {
        let ctx = TransitionContext::new(self.clock.now(), &self.retry);
        Ok(self.table.update_if(
            id,
            &|row| extra(row) && can_apply(row.verification().state, event),
            &mut |row| {
                if let Ok((to, effects)) = verification_transition(row.verification().state, event) {
                    apply_verification_transition(row, to, effects, &ctx);
                }
            },
        )?)
    }

    fn count_where(&self, filter: &dyn Fn(&R) -> bool, limit: Option<usize>) -> CoreResult<usize> {
        let availability = R::availability();
        Ok(self
            .table
            .count(&|row| query_matches_all(&availability, row) && filter(row), limit)?)
    }
}

fn query_matches_all<R: ClaimableRow>(conditions: &[Condition], row: &R) -> bool {
    conditions.iter().all(|c| c.matches(row))
}

impl<R: VerifiableRow> VerificationStore for TableVerificationStore<R> {
    fn name(&self) -> &str {
        self.table.name()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn fields(&self, id: RecordId) -> CoreResult<Option<VerificationFields>> {
        Ok(self.table.get(id)?.map(|row| row.verification().clone()))
    }

    fn start(&self, id: RecordId) -> CoreResult<bool> {
        self.transition(id, VerificationEvent::Start, &|row| {
            row.verification().state != S::VerificationStarted
        })
    }

    fn succeed(
        &self,
        id: RecordId,
        checksum: Checksum,
        calculation_started_at: DateTime<Utc>,
    ) -> CoreResult<SuccessResult> {
        let ctx = TransitionContext::new(self.clock.now(), &self.retry);
        let mut result = SuccessResult::Superseded;
        self.table.update_if(
            id,
            &|row| row.verification().state == S::VerificationStarted,
            &mut |row| {
                row.verification_mut().checksum = Some(checksum);
                if let Ok((to, effects)) =
                    verification_transition(row.verification().state, VerificationEvent::Succeed)
                {
                    apply_verification_transition(row, to, effects, &ctx);
                }

                let restarted = row
                    .verification()
                    .started_at
                    .is_some_and(|t| t > calculation_started_at);
                let changed = row.changed_at().is_some_and(|t| t > calculation_started_at);
                if restarted || changed {
                    if let Ok((to, effects)) =
                        verification_transition(row.verification().state, VerificationEvent::Reset)
                    {
                        apply_verification_transition(row, to, effects, &ctx);
                    }
                    result = SuccessResult::Stale;
                } else {
                    result = SuccessResult::Succeeded;
                }
            },
        )?;
        Ok(result)
    }

    fn fail(&self, id: RecordId, failure: &VerificationFailure) -> CoreResult<bool> {
        let ctx = TransitionContext::new(self.clock.now(), &self.retry);
        let started = |row: &R| row.verification().state == S::VerificationStarted;
        Ok(self.table.update_if(id, &started, &mut |row| {
            {
                let fields = row.verification_mut();
                fields.failure = Some(failure.message.clone());
                fields.checksum = failure.checksum;
            }
            if let Some(mismatched) = failure.mismatched {
                row.record_checksum_mismatch(mismatched);
            }
            if let Ok((to, effects)) =
                verification_transition(row.verification().state, VerificationEvent::Fail)
            {
                apply_verification_transition(row, to, effects, &ctx);
            }
        })?)
    }

    fn disable(&self, id: RecordId) -> CoreResult<bool> {
        self.transition(id, VerificationEvent::Disable, &|_| true)
    }

    fn reset(&self, id: RecordId) -> CoreResult<bool> {
        self.transition(id, VerificationEvent::Reset, &|_| true)
    }

    fn claim_verification_batch(&self, limit: usize) -> CoreResult<Vec<RecordId>> {
        let ctx = TransitionContext::new(self.clock.now(), &self.retry);
        let mut start = |row: &mut R| {
            if let Ok((to, effects)) =
                verification_transition(row.verification().state, VerificationEvent::Start)
            {
                apply_verification_transition(row, to, effects, &ctx);
            }
        };

        let availability = R::availability();
        let pending = ClaimQuery::verification_pending().filter_all(availability.iter().copied());
        let mut ids = claim_batch(self.table.as_ref(), &pending, limit, &mut start)?;

        let remaining = limit.saturating_sub(ids.len());
        if remaining > 0 {
            let failed = ClaimQuery::verification_failed(ctx.now).filter_all(availability);
            ids.extend(claim_batch(self.table.as_ref(), &failed, remaining, &mut start)?);
        }
        Ok(ids)
    }

    fn fail_verification_timeouts(&self, timeout: Duration) -> CoreResult<usize> {
        let now = self.clock.now();
        let query = ClaimQuery::verification_timed_out(before(now, timeout))
            .filter_all(R::availability());
        let message = format!("Verification timed out after {}", describe_duration(timeout));
        let retry_at = self.retry.next_retry_time(1, false, now);

        let swept = self.table.update_where(&|row| query.matches(row), &mut |row| {
            let fields = row.verification_mut();
            fields.state = S::VerificationFailed;
            fields.failure = Some(message.clone());
            fields.checksum = None;
            fields.retry_count = 1;
            fields.retry_at = Some(retry_at);
            fields.verified_at = Some(now);
        })?;

        if swept > 0 {
            tracing::warn!(
                table = self.table.name(),
                count = swept,
                failure = %FailureKind::VerificationTimeout,
                "verification timed out"
            );
        }
        Ok(swept)
    }

    fn reverify_batch(&self, limit: usize, interval: Duration) -> CoreResult<usize> {
        let now = self.clock.now();
        let query = ClaimQuery::needs_reverification(before(now, interval)).filter_all(R::availability());
        let ids = claim_batch(self.table.as_ref(), &query, limit, &mut |row| {
            row.verification_mut().state = S::VerificationPending;
        })?;
        Ok(ids.len())
    }

    fn needs_verification_count(&self, limit: usize) -> CoreResult<usize> {
        let now = self.clock.now();
        let pending = ClaimQuery::verification_pending();
        let failed = ClaimQuery::verification_failed(now);
        self.count_where(&|row| pending.matches(row) || failed.matches(row), Some(limit))
    }

    fn needs_reverification_count(&self, limit: usize, interval: Duration) -> CoreResult<usize> {
        let query = ClaimQuery::needs_reverification(before(self.clock.now(), interval));
        self.count_where(&|row| query.matches(row), Some(limit))
    }

    fn count_in_state(&self, state: VerificationState) -> CoreResult<usize> {
        self.count_where(&|row| row.verification().state == state, None)
    }

    fn checksummed_count(&self) -> CoreResult<usize> {
        self.count_where(&|row| row.verification().checksum.is_some(), None)
    }

    fn mismatch_count(&self) -> CoreResult<usize> {
        self.count_where(&|row| row.checksum_mismatch(), None)
    }
}

/// What a checksum attempt did to a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The checksum was recorded and the row is `verification_succeeded`.
    Succeeded(Checksum),
    /// The checksum was computed but the row changed meanwhile and is back
    /// to `verification_pending`.
    Stale(Checksum),
    /// The row left `verification_started` during the computation.
    Superseded,
    /// The checksum routine failed; the row is `verification_failed`.
    Failed(String),
    /// The checksum differs from the primary's; the row is
    /// `verification_failed` with the mismatch recorded.
    Mismatch {
        /// Locally computed checksum.
        checksum: Checksum,
        /// The primary's checksum.
        primary: Checksum,
    },
    /// The row is not ready to verify and is now `verification_disabled`.
    Disabled,
    /// The row does not exist.
    Missing,
}

impl VerificationOutcome {
    /// Returns true if the row ended in `verification_succeeded`.
    pub fn succeeded(&self) -> bool {
        matches!(self, VerificationOutcome::Succeeded(_))
    }
}

/// Runs checksum attempts against a [`VerificationStore`].
pub struct VerificationTracker<'a> {
    store: &'a dyn VerificationStore,
}

impl<'a> VerificationTracker<'a> {
    /// Creates a tracker.
    pub fn new(store: &'a dyn VerificationStore) -> Self {
        Self { store }
    }

    /// Computes and records a checksum for `id`.
    ///
    /// If the row is not ready to verify it is disabled without running
    /// `compute`. Otherwise the row is moved to `verification_started`
    /// (unless a batch claim already did so), `compute` runs, and the
    /// result is recorded. With `primary_checksum` set, a differing
    /// checksum is recorded as a mismatch.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails. Failures of `compute` are
    /// recorded on the row.
    pub fn track_checksum_attempt<E: fmt::Display>(
        &self,
        id: RecordId,
        ready_to_verify: bool,
        primary_checksum: Option<Checksum>,
        compute: impl FnOnce() -> Result<Checksum, E>,
    ) -> CoreResult<VerificationOutcome> {
        let Some(fields) = self.store.fields(id)? else {
            return Ok(VerificationOutcome::Missing);
        };

        if !ready_to_verify {
            self.store.disable(id)?;
            tracing::debug!(table = self.store.name(), model_record_id = id, "verification disabled");
            return Ok(VerificationOutcome::Disabled);
        }

        if fields.state != S::VerificationStarted {
            self.store.start(id)?;
        }
        let calculation_started_at = self.store.now();

        let checksum = match compute() {
            Ok(checksum) => checksum,
            Err(error) => {
                let failure = VerificationFailure::compute(&error);
                tracing::warn!(
                    table = self.store.name(),
                    model_record_id = id,
                    failure = %FailureKind::ChecksumComputeFailure,
                    %error,
                    "verification failed"
                );
                if !self.store.fail(id, &failure)? {
                    return Ok(VerificationOutcome::Superseded);
                }
                return Ok(VerificationOutcome::Failed(failure.message));
            }
        };

        if let Some(primary) = primary_checksum {
            if primary != checksum {
                tracing::warn!(
                    table = self.store.name(),
                    model_record_id = id,
                    failure = %FailureKind::ChecksumMismatch,
                    %checksum,
                    primary_checksum = %primary,
                    "checksum does not match the primary checksum"
                );
                if !self.store.fail(id, &VerificationFailure::mismatch(checksum, primary))? {
                    return Ok(VerificationOutcome::Superseded);
                }
                return Ok(VerificationOutcome::Mismatch { checksum, primary });
            }
        }

        let outcome = match self.store.succeed(id, checksum, calculation_started_at)? {
            SuccessResult::Succeeded => VerificationOutcome::Succeeded(checksum),
            SuccessResult::Stale => VerificationOutcome::Stale(checksum),
            SuccessResult::Superseded => VerificationOutcome::Superseded,
        };
        tracing::debug!(
            table = self.store.name(),
            model_record_id = id,
            outcome = ?outcome,
            "verification finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use georep_storage::InMemoryTable;
    use proptest::prelude::*;

    struct Fixture {
        clock: Arc<MockClock>,
        table: Arc<InMemoryTable<Resource>>,
        store: TableVerificationStore<Resource>,
    }

    fn fixture(ids: &[i64]) -> Fixture {
        let clock = Arc::new(MockClock::starting_now());
        let now = clock.now();
        let table = Arc::new(InMemoryTable::with_rows(
            "resources",
            ids.iter().map(|&id| Resource::new(id, format!("blob/{id}"), now)),
        ));
        let store = TableVerificationStore::new(
            table.clone() as Arc<dyn Table<Resource>>,
            clock.clone() as Arc<dyn Clock>,
            RetryPolicy::new(),
        );
        Fixture { clock, table, store }
    }

    fn state_of(f: &Fixture, id: i64) -> VerificationFields {
        f.table.get(id).unwrap().unwrap().verification
    }

    fn any_state() -> impl Strategy<Value = VerificationState> {
        proptest::sample::select(VerificationState::ALL.to_vec())
    }

    fn any_event() -> impl Strategy<Value = VerificationEvent> {
        proptest::sample::select(vec![
            VerificationEvent::Start,
            VerificationEvent::Succeed,
            VerificationEvent::Fail,
            VerificationEvent::Reset,
            VerificationEvent::Disable,
        ])
    }

    #[test]
    fn succeed_requires_started() {
        assert!(verification_transition(S::VerificationPending, VerificationEvent::Succeed).is_err());
        let (to, effects) =
            verification_transition(S::VerificationStarted, VerificationEvent::Succeed).unwrap();
        assert_eq!(to, S::VerificationSucceeded);
        assert_eq!(effects[0], E::RecordVerifiedAt);
    }

    #[test]
    fn failure_schedules_retry() {
        let retry = RetryPolicy::new();
        let now = Utc::now();
        let ctx = TransitionContext::new(now, &retry);
        let mut row = Resource::new(1, "a", now);

        apply_verification_event(&mut row, VerificationEvent::Fail, &ctx).unwrap();
        apply_verification_event(&mut row, VerificationEvent::Fail, &ctx).unwrap();

        assert_eq!(row.verification.state, S::VerificationFailed);
        assert_eq!(row.verification.retry_count, 2);
        assert!(row.verification.retry_at.unwrap() > now);
        assert_eq!(row.verification.verified_at, Some(now));
    }

    #[test]
    fn reset_clears_failure_fields() {
        let retry = RetryPolicy::new();
        let ctx = TransitionContext::new(Utc::now(), &retry);
        let mut row = Resource::new(1, "a", ctx.now);
        row.verification.failure = Some("boom".into());
        apply_verification_event(&mut row, VerificationEvent::Fail, &ctx).unwrap();

        apply_verification_event(&mut row, VerificationEvent::Reset, &ctx).unwrap();
        assert_eq!(row.verification.state, S::VerificationPending);
        assert_eq!(row.verification.failure, None);
        assert_eq!(row.verification.retry_count, 0);
        assert_eq!(row.verification.retry_at, None);
    }

    #[test]
    fn tracker_records_checksum() {
        let f = fixture(&[1]);
        let tracker = VerificationTracker::new(&f.store);
        let sum = Checksum::from_bytes([7; 32]);

        let outcome = tracker
            .track_checksum_attempt(1, true, None, || Ok::<_, String>(sum))
            .unwrap();

        assert_eq!(outcome, VerificationOutcome::Succeeded(sum));
        let fields = state_of(&f, 1);
        assert_eq!(fields.state, S::VerificationSucceeded);
        assert_eq!(fields.checksum, Some(sum));
        assert!(fields.verified_at.is_some());
        assert!(fields.started_at.is_some());
    }

    #[test]
    fn tracker_records_compute_failure() {
        let f = fixture(&[1]);
        let tracker = VerificationTracker::new(&f.store);

        let outcome = tracker
            .track_checksum_attempt(1, true, None, || Err("storage unreachable"))
            .unwrap();

        assert_eq!(
            outcome,
            VerificationOutcome::Failed("Error during verification: storage unreachable".into())
        );
        let fields = state_of(&f, 1);
        assert_eq!(fields.state, S::VerificationFailed);
        assert_eq!(fields.checksum, None);
        assert_eq!(fields.retry_count, 1);
    }

    #[test]
    fn tracker_disables_when_not_ready() {
        let f = fixture(&[1]);
        let tracker = VerificationTracker::new(&f.store);
        let mut called = false;

        let outcome = tracker
            .track_checksum_attempt(1, false, None, || {
                called = true;
                Ok::<_, String>(Checksum::ZERO)
            })
            .unwrap();

        assert_eq!(outcome, VerificationOutcome::Disabled);
        assert!(!called);
        assert_eq!(state_of(&f, 1).state, S::VerificationDisabled);
    }

    #[test]
    fn tracker_missing_row() {
        let f = fixture(&[]);
        let tracker = VerificationTracker::new(&f.store);
        let outcome = tracker
            .track_checksum_attempt(9, true, None, || Ok::<_, String>(Checksum::ZERO))
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::Missing);
    }

    #[test]
    fn change_during_checksum_returns_to_pending() {
        let f = fixture(&[1]);
        let tracker = VerificationTracker::new(&f.store);
        let sum = Checksum::from_bytes([1; 32]);

        let outcome = tracker
            .track_checksum_attempt(1, true, None, || {
                f.clock.advance(chrono::Duration::seconds(5));
                let now = f.clock.now();
                f.table
                    .update_if(1, &|_| true, &mut |r| r.updated_at = now)
                    .unwrap();
                Ok::<_, String>(sum)
            })
            .unwrap();

        assert_eq!(outcome, VerificationOutcome::Stale(sum));
        let fields = state_of(&f, 1);
        assert_eq!(fields.state, S::VerificationPending);
        assert_eq!(fields.checksum, Some(sum));
    }

    #[test]
    fn reset_during_checksum_supersedes() {
        let f = fixture(&[1]);
        let tracker = VerificationTracker::new(&f.store);

        let outcome = tracker
            .track_checksum_attempt(1, true, None, || {
                f.store.reset(1).unwrap();
                Ok::<_, String>(Checksum::ZERO)
            })
            .unwrap();

        assert_eq!(outcome, VerificationOutcome::Superseded);
        let fields = state_of(&f, 1);
        assert_eq!(fields.state, S::VerificationPending);
        assert_eq!(fields.checksum, None);
    }

    #[test]
    fn reset_during_failed_checksum_is_kept() {
        let f = fixture(&[1]);
        let tracker = VerificationTracker::new(&f.store);

        let outcome = tracker
            .track_checksum_attempt(1, true, None, || {
                f.store.reset(1).unwrap();
                Err::<Checksum, _>("disk unavailable")
            })
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::Superseded);

        let primary = Checksum::from_bytes([1; 32]);
        let outcome = tracker
            .track_checksum_attempt(1, true, Some(primary), || {
                f.store.reset(1).unwrap();
                Ok::<_, String>(Checksum::from_bytes([2; 32]))
            })
            .unwrap();
        assert_eq!(outcome, VerificationOutcome::Superseded);

        let fields = state_of(&f, 1);
        assert_eq!(fields.state, S::VerificationPending);
        assert_eq!(fields.failure, None);
        assert_eq!(fields.retry_count, 0);
    }

    #[test]
    fn claim_takes_pending_then_due_failures() {
        let f = fixture(&[1, 2, 3, 4]);
        let ctx_retry = RetryPolicy::new();
        let ctx = TransitionContext::new(f.clock.now(), &ctx_retry);
        for id in [3, 4] {
            f.table
                .update_if(id, &|_| true, &mut |r| {
                    apply_verification_event(r, VerificationEvent::Fail, &ctx).unwrap();
                })
                .unwrap();
        }
        // Row 4 is due, row 3 is not.
        f.table
            .update_if(4, &|_| true, &mut |r| r.verification.retry_at = None)
            .unwrap();

        let ids = f.store.claim_verification_batch(10).unwrap();
        assert_eq!(ids, vec![1, 2, 4]);
        assert_eq!(state_of(&f, 4).state, S::VerificationStarted);
        assert_eq!(state_of(&f, 3).state, S::VerificationFailed);
    }

    #[test]
    fn claim_respects_limit() {
        let f = fixture(&[1, 2, 3]);
        assert_eq!(f.store.claim_verification_batch(2).unwrap(), vec![1, 2]);
        assert_eq!(f.store.claim_verification_batch(2).unwrap(), vec![3]);
        assert!(f.store.claim_verification_batch(2).unwrap().is_empty());
    }

    #[test]
    fn timeout_sweep_fails_stuck_rows() {
        let f = fixture(&[1, 2]);
        f.store.claim_verification_batch(1).unwrap();
        f.clock.advance(chrono::Duration::hours(9));
        f.store.start(2).unwrap();

        let swept = f
            .store
            .fail_verification_timeouts(Duration::from_secs(8 * 3600))
            .unwrap();

        assert_eq!(swept, 1);
        let fields = state_of(&f, 1);
        assert_eq!(fields.state, S::VerificationFailed);
        assert_eq!(
            fields.failure.as_deref(),
            Some("Verification timed out after 8 hours")
        );
        assert_eq!(fields.retry_count, 1);
        assert_eq!(fields.verified_at, Some(f.clock.now()));
        assert_eq!(state_of(&f, 2).state, S::VerificationStarted);
    }

    #[test]
    fn reverify_marks_old_successes_pending() {
        let f = fixture(&[1, 2, 3]);
        let tracker = VerificationTracker::new(&f.store);
        for id in [1, 2] {
            tracker
                .track_checksum_attempt(id, true, None, || Ok::<_, String>(Checksum::ZERO))
                .unwrap();
        }
        let interval = Duration::from_secs(90 * 24 * 3600);
        assert_eq!(f.store.needs_reverification_count(10, interval).unwrap(), 0);

        f.clock.advance(chrono::Duration::days(91));
        assert_eq!(f.store.needs_reverification_count(10, interval).unwrap(), 2);
        assert_eq!(f.store.reverify_batch(1, interval).unwrap(), 1);
        assert_eq!(f.store.count_in_state(S::VerificationPending).unwrap(), 2);
        assert_eq!(f.store.count_in_state(S::VerificationSucceeded).unwrap(), 1);
    }

    #[test]
    fn counts() {
        let f = fixture(&[1, 2, 3]);
        let tracker = VerificationTracker::new(&f.store);
        tracker
            .track_checksum_attempt(1, true, None, || Ok::<_, String>(Checksum::ZERO))
            .unwrap();

        assert_eq!(f.store.needs_verification_count(10).unwrap(), 2);
        assert_eq!(f.store.needs_verification_count(1).unwrap(), 1);
        assert_eq!(f.store.checksummed_count().unwrap(), 1);
        assert_eq!(f.store.mismatch_count().unwrap(), 0);
    }

    proptest! {
        #[test]
        fn transitions_stay_closed(state in any_state(), event in any_event()) {
            match verification_transition(state, event) {
                Ok((to, _)) => {
                    prop_assert!(VerificationState::ALL.contains(&to));
                    if event == VerificationEvent::Succeed {
                        prop_assert_eq!(state, S::VerificationStarted);
                    }
                }
                Err(_) => {
                    prop_assert_eq!(event, VerificationEvent::Succeed);
                    prop_assert_ne!(state, S::VerificationStarted);
                }
            }
        }
    }
}
