//! # georep Core
//!
//! Replication and verification state machines for georep.
//!
//! This crate provides:
//! - Data model: resources, registry rows, verification columns, checksums
//! - Retry policy with capped, jittered backoff
//! - Verification state machine (pending → started → succeeded | failed,
//!   plus disabled), usable on primary resources, separate verification
//!   tables, and secondary registries
//! - Sync registry state machine (pending → started → synced | failed)
//! - Batch claim coordinator over skip-locked table claims
//! - Backfill passes keeping shadow tables consistent with resources
//!
//! ## Architecture
//!
//! Each state machine is a **pure transition table**
//! `(state, event) -> (new_state, effects)` plus a function that applies
//! the effects to a row. Stores never run read-modify-write cycles: every
//! transition reaches the shared table as a single conditional update or
//! claim, so workers on different processes need no other coordination.
//!
//! ## Key Invariants
//!
//! - A row only enters `started`/`verification_started` through a claim or a
//!   conditional update, never by overwriting another claimant
//! - `mark_synced` only succeeds on rows still in `started`
//! - A checksum computed against content that changed meanwhile is never
//!   left marked succeeded
//! - Retry times never decrease across consecutive failures
//! - Failure messages are at most 255 characters

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backfill;
mod claim;
mod clock;
mod config;
mod error;
mod model;
mod registry;
mod retry;
mod verification;

pub use backfill::{backfill_registry, backfill_verification_state, BackfillReport};
pub use claim::{
    claim_batch, select_candidates, ClaimQuery, ClaimableRow, Column, ColumnValue, Condition,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{describe_duration, ReplicationConfig};
pub use error::{
    failure_message, truncate_failure, CoreError, CoreResult, FailureKind, MAX_FAILURE_LENGTH,
};
pub use model::{
    Checksum, RecordId, RegistryRecord, Resource, SyncState, VerificationFields,
    VerificationState, VerificationStateRow,
};
pub use registry::{
    apply_sync_event, apply_sync_transition, sync_transition, SyncCounts, SyncEffect, SyncEvent,
    SyncRegistry,
};
pub use retry::RetryPolicy;
pub use verification::{
    apply_verification_event, apply_verification_transition, verification_transition,
    SuccessResult, TableVerificationStore, TransitionContext, VerifiableRow, VerificationEffect,
    VerificationEvent, VerificationFailure, VerificationOutcome, VerificationStore,
    VerificationTracker,
};
