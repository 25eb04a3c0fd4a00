//! Replication status per resource kind.

use crate::context::SiteRole;
use crate::error::EngineResult;
use crate::replicator::Replicator;
use georep_core::{SyncCounts, VerificationState};
use serde::Serialize;
use std::fmt;

/// Registry counts of a secondary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    /// Registry rows.
    pub count: usize,
    /// Rows waiting to sync.
    pub pending: usize,
    /// Rows being synced.
    pub started: usize,
    /// Rows with an up-to-date copy.
    pub synced: usize,
    /// Rows whose last sync failed.
    pub failed: usize,
    /// Rows the primary reported missing.
    pub missing_on_primary: usize,
}

impl From<SyncCounts> for RegistryStatus {
    fn from(counts: SyncCounts) -> Self {
        Self {
            count: counts.total,
            pending: counts.pending,
            started: counts.started,
            synced: counts.synced,
            failed: counts.failed,
            missing_on_primary: counts.missing_on_primary,
        }
    }
}

/// Verification counts of the site's copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationStatus {
    /// Rows in `verification_succeeded`.
    pub verified: usize,
    /// Rows in `verification_failed`.
    pub failed: usize,
    /// Rows with a recorded checksum.
    pub checksummed: usize,
    /// Rows whose checksum differs from the primary's.
    pub checksum_mismatch: usize,
}

/// Status of one resource kind on one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationStatus {
    /// Resource kind.
    pub kind: String,
    /// Site role.
    pub role: SiteRole,
    /// Resources on the primary.
    pub total: usize,
    /// Registry counts; `None` on the primary.
    pub registry: Option<RegistryStatus>,
    /// Verification counts; `None` while verification is disabled.
    pub verification: Option<VerificationStatus>,
}

impl Replicator {
    /// Collects the status of this kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn status(&self) -> EngineResult<ReplicationStatus> {
        let registry = match self.registry() {
            Ok(registry) => Some(RegistryStatus::from(registry.counts()?)),
            Err(_) => None,
        };

        let verification = if self.context.config().verification_enabled {
            let store = self.verification_store();
            Some(VerificationStatus {
                verified: store.count_in_state(VerificationState::VerificationSucceeded)?,
                failed: store.count_in_state(VerificationState::VerificationFailed)?,
                checksummed: store.checksummed_count()?,
                checksum_mismatch: store.mismatch_count()?,
            })
        } else {
            None
        };

        Ok(ReplicationStatus {
            kind: self.kind().to_string(),
            role: self.context.role(),
            total: self.tables.resources.count(&|_| true, None)?,
            registry,
            verification,
        })
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}):", self.kind, self.role)?;
        writeln!(f, "  resources:           {}", self.total)?;
        if let Some(r) = &self.registry {
            writeln!(f, "  registry:            {}", r.count)?;
            writeln!(f, "    pending:           {}", r.pending)?;
            writeln!(f, "    started:           {}", r.started)?;
            writeln!(f, "    synced:            {}", r.synced)?;
            writeln!(f, "    failed:            {}", r.failed)?;
            writeln!(f, "    missing on primary: {}", r.missing_on_primary)?;
        }
        match &self.verification {
            Some(v) => {
                writeln!(f, "  verified:            {}", v.verified)?;
                writeln!(f, "  verification failed: {}", v.failed)?;
                writeln!(f, "  checksummed:         {}", v.checksummed)?;
                write!(f, "  checksum mismatch:   {}", v.checksum_mismatch)
            }
            None => write!(f, "  verification:        disabled"),
        }
    }
}
