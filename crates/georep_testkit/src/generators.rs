//! Property-based test generators using proptest.
//!
//! Strategies for rows, events and checksums that respect the model's
//! invariants: failure messages fit the column, retry counts are bounded,
//! and locators are relative paths.

use chrono::{DateTime, TimeZone, Utc};
use georep_core::{
    Checksum, RegistryRecord, Resource, SyncState, VerificationFields, VerificationState,
    MAX_FAILURE_LENGTH,
};
use georep_engine::PATH_PARAM;
use georep_protocol::{EventParams, EventType, ReplicationEvent};
use proptest::prelude::*;

/// Strategy for sync states.
pub fn sync_state_strategy() -> impl Strategy<Value = SyncState> {
    prop::sample::select(SyncState::ALL.to_vec())
}

/// Strategy for verification states.
pub fn verification_state_strategy() -> impl Strategy<Value = VerificationState> {
    prop::sample::select(VerificationState::ALL.to_vec())
}

/// Strategy for checksums, with the all-zero digest over-represented.
pub fn checksum_strategy() -> impl Strategy<Value = Checksum> {
    prop_oneof![
        1 => Just(Checksum::ZERO),
        9 => prop::array::uniform32(any::<u8>()).prop_map(Checksum::from_bytes),
    ]
}

/// Strategy for timestamps within a few years of 2024.
pub fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp())
        .unwrap_or(0);
    (start..start + 100_000_000).prop_map(|secs| {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    })
}

/// Strategy for failure messages that fit the failure column.
pub fn failure_message_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 :._-]{1,80}")
        .expect("Invalid regex")
        .prop_map(|s| s.chars().take(MAX_FAILURE_LENGTH).collect())
}

/// Strategy for relative storage locators.
pub fn locator_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9]{1,8}", 1..4).prop_map(|parts| parts.join("/"))
}

/// Strategy for selective-sync scopes.
pub fn scope_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop::sample::select(vec![
        "group-a".to_string(),
        "group-b".to_string(),
        "group-c".to_string(),
    ]))
}

/// Strategy for consistent verification columns.
///
/// Only `verification_started` rows carry a start time, and only failed
/// rows carry a failure and a retry.
pub fn verification_fields_strategy() -> impl Strategy<Value = VerificationFields> {
    (
        verification_state_strategy(),
        prop::option::of(checksum_strategy()),
        failure_message_strategy(),
        0u32..20,
        timestamp_strategy(),
    )
        .prop_map(|(state, checksum, failure, retry_count, at)| {
            let failed = state == VerificationState::VerificationFailed;
            VerificationFields {
                state,
                checksum,
                failure: failed.then_some(failure),
                retry_count: if failed { retry_count.max(1) } else { 0 },
                retry_at: failed.then_some(at),
                verified_at: Some(at),
                started_at: (state == VerificationState::VerificationStarted).then_some(at),
            }
        })
}

/// Strategy for primary resources.
pub fn resource_strategy() -> impl Strategy<Value = Resource> {
    (1i64..10_000, locator_strategy(), scope_strategy(), timestamp_strategy()).prop_map(
        |(id, locator, scope, now)| {
            let mut resource = Resource::new(id, locator, now);
            resource.scope = scope;
            resource
        },
    )
}

/// Strategy for registry rows in any sync state.
pub fn registry_record_strategy() -> impl Strategy<Value = RegistryRecord> {
    (
        1i64..10_000,
        sync_state_strategy(),
        0u32..20,
        timestamp_strategy(),
        failure_message_strategy(),
        any::<bool>(),
        verification_fields_strategy(),
    )
        .prop_map(
            |(id, state, retry_count, now, failure, missing, verification)| {
                let mut row = RegistryRecord::new(id, now);
                row.state = state;
                row.verification = verification;
                match state {
                    SyncState::Failed => {
                        row.retry_count = retry_count.max(1);
                        row.retry_at = Some(now);
                        row.last_sync_failure = Some(failure);
                        row.missing_on_primary = missing;
                    }
                    SyncState::Started => row.last_synced_at = Some(now),
                    SyncState::Synced => row.last_synced_at = Some(now),
                    SyncState::Pending => {}
                }
                row
            },
        )
}

/// Strategy for events of one resource kind.
pub fn event_strategy(kind: &'static str) -> impl Strategy<Value = ReplicationEvent> {
    (
        prop::sample::select(vec![
            EventType::Created,
            EventType::Updated,
            EventType::Deleted,
            EventType::ChecksumSucceeded,
        ]),
        1i64..10_000,
        locator_strategy(),
    )
        .prop_map(move |(event_type, id, locator)| {
            let event = ReplicationEvent::new(event_type, kind, id);
            if event_type == EventType::Deleted {
                event.with_params(EventParams::new().with(PATH_PARAM, locator))
            } else {
                event
            }
        })
}
