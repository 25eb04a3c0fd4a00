//! Rows and enumerations shared by the state machines.

use chrono::{DateTime, Utc};
use georep_storage::{Row, RowKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Primary key of a resource on the primary site.
pub type RecordId = i64;

/// Sync lifecycle of a registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SyncState {
    /// Waiting to be synced.
    #[default]
    Pending = 0,
    /// A worker is transferring the resource.
    Started = 1,
    /// The local copy is up to date.
    Synced = 2,
    /// The last attempt failed; a retry is scheduled.
    Failed = 3,
}

impl SyncState {
    /// Every state, in code order.
    pub const ALL: [SyncState; 4] = [
        SyncState::Pending,
        SyncState::Started,
        SyncState::Synced,
        SyncState::Failed,
    ];

    /// Returns the stored integer code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns the state name.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Started => "started",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checksum lifecycle of a resource or registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum VerificationState {
    /// Waiting for a checksum.
    #[default]
    VerificationPending = 0,
    /// A worker is computing the checksum.
    VerificationStarted = 1,
    /// The checksum was computed (and matched, on a secondary).
    VerificationSucceeded = 2,
    /// The checksum could not be computed or did not match.
    VerificationFailed = 3,
    /// Verification is not possible yet.
    VerificationDisabled = 4,
}

impl VerificationState {
    /// Every state, in code order.
    pub const ALL: [VerificationState; 5] = [
        VerificationState::VerificationPending,
        VerificationState::VerificationStarted,
        VerificationState::VerificationSucceeded,
        VerificationState::VerificationFailed,
        VerificationState::VerificationDisabled,
    ];

    /// Returns the stored integer code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns the state name.
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationState::VerificationPending => "verification_pending",
            VerificationState::VerificationStarted => "verification_started",
            VerificationState::VerificationSucceeded => "verification_succeeded",
            VerificationState::VerificationFailed => "verification_failed",
            VerificationState::VerificationDisabled => "verification_disabled",
        }
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SHA-256 digest of a resource's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// The all-zero digest, recorded for empty repositories.
    pub const ZERO: Checksum = Checksum([0u8; 32]);

    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns true for the all-zero digest.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Returns the lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid checksum: {s}")))
    }
}

/// Verification columns, co-located on a resource, held in a separate
/// verification table, or embedded in a registry row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFields {
    /// Current state.
    pub state: VerificationState,
    /// Last computed checksum.
    pub checksum: Option<Checksum>,
    /// Last failure message, at most 255 characters.
    pub failure: Option<String>,
    /// Consecutive failed attempts.
    pub retry_count: u32,
    /// When a failed verification may be retried.
    pub retry_at: Option<DateTime<Utc>>,
    /// When the last checksum attempt finished.
    pub verified_at: Option<DateTime<Utc>>,
    /// When the current attempt started.
    pub started_at: Option<DateTime<Utc>>,
}

/// A resource owned by the primary site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Primary key.
    pub id: RecordId,
    /// Storage path (blob) or disk path (repository), relative to the
    /// site's storage root.
    pub locator: String,
    /// Selective-sync scope the resource belongs to.
    pub scope: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last content change.
    pub updated_at: DateTime<Utc>,
    /// Co-located verification columns.
    #[serde(default)]
    pub verification: VerificationFields,
}

impl Resource {
    /// Creates a resource with pending verification.
    pub fn new(id: RecordId, locator: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            locator: locator.into(),
            scope: None,
            created_at: now,
            updated_at: now,
            verification: VerificationFields::default(),
        }
    }

    /// Sets the selective-sync scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

impl Row for Resource {
    fn key(&self) -> RowKey {
        self.id
    }
}

/// Primary-side verification columns kept in a table separate from the
/// resource table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationStateRow {
    /// Primary key of the resource.
    pub model_record_id: RecordId,
    /// Verification columns.
    pub verification: VerificationFields,
}

impl VerificationStateRow {
    /// Creates a row with pending verification.
    pub fn new(model_record_id: RecordId) -> Self {
        Self {
            model_record_id,
            verification: VerificationFields::default(),
        }
    }
}

impl Row for VerificationStateRow {
    fn key(&self) -> RowKey {
        self.model_record_id
    }
}

/// Secondary-side bookkeeping for one resource.
///
/// Registry rows are keyed by the resource's primary key, so there is at
/// most one row per resource per secondary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// Primary key of the resource on the primary.
    pub model_record_id: RecordId,
    /// Sync state.
    pub state: SyncState,
    /// Consecutive failed syncs.
    pub retry_count: u32,
    /// When a failed sync may be retried.
    pub retry_at: Option<DateTime<Utc>>,
    /// Last sync failure message, at most 255 characters.
    pub last_sync_failure: Option<String>,
    /// When the last sync attempt started.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether the primary reported the resource missing.
    #[serde(default)]
    pub missing_on_primary: bool,
    /// When an update event last rescheduled this row.
    #[serde(default)]
    pub changed_at: Option<DateTime<Utc>>,
    /// Whether the last verification found a checksum mismatch.
    #[serde(default)]
    pub checksum_mismatch: bool,
    /// The local checksum that did not match the primary's.
    #[serde(default)]
    pub verification_checksum_mismatched: Option<Checksum>,
    /// Embedded verification columns.
    #[serde(default)]
    pub verification: VerificationFields,
}

impl RegistryRecord {
    /// Creates a pending registry row.
    pub fn new(model_record_id: RecordId, now: DateTime<Utc>) -> Self {
        Self {
            model_record_id,
            state: SyncState::Pending,
            retry_count: 0,
            retry_at: None,
            last_sync_failure: None,
            last_synced_at: None,
            created_at: now,
            missing_on_primary: false,
            changed_at: None,
            checksum_mismatch: false,
            verification_checksum_mismatched: None,
            verification: VerificationFields::default(),
        }
    }
}

impl Row for RegistryRecord {
    fn key(&self) -> RowKey {
        self.model_record_id
    }
}
