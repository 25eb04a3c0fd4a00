//! Batch entry points run by the periodic scheduler.
//!
//! Each entry point claims one bounded batch, works it, and returns. Many
//! may run at once against the same tables; the claims keep them apart.

use crate::error::EngineResult;
use crate::replicator::{Replicator, VerificationStorage};
use georep_core::{backfill_registry, backfill_verification_state, BackfillReport};

/// Result of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Rows claimed.
    pub claimed: usize,
    /// Rows that ended in the success state.
    pub succeeded: usize,
}

impl BatchReport {
    /// Rows that did not succeed.
    pub fn failed(&self) -> usize {
        self.claimed - self.succeeded
    }
}

fn batches(count: usize, batch_size: usize) -> usize {
    count.div_ceil(batch_size.max(1))
}

impl Replicator {
    /// Claims and syncs one batch of pending and due-for-retry rows.
    ///
    /// Does nothing while replication is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails, or on the primary.
    pub fn sync_batch(&self) -> EngineResult<BatchReport> {
        let registry = self.registry()?;
        let config = self.context.config();
        if !config.replication_enabled {
            return Ok(BatchReport::default());
        }

        let ids = registry.claim_sync_batch(config.sync_batch_size)?;
        let mut report = BatchReport {
            claimed: ids.len(),
            succeeded: 0,
        };
        for id in ids {
            if self.sync(id)? {
                report.succeeded += 1;
            }
        }
        if report.claimed > 0 {
            tracing::info!(
                kind = self.kind(),
                claimed = report.claimed,
                synced = report.succeeded,
                "sync batch"
            );
        }
        Ok(report)
    }

    /// Claims and verifies one batch of pending and due-for-retry rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn verify_batch(&self) -> EngineResult<BatchReport> {
        let ids = self
            .verification_store()
            .claim_verification_batch(self.context.config().verification_batch_size)?;
        let mut report = BatchReport {
            claimed: ids.len(),
            succeeded: 0,
        };
        for id in ids {
            if self.verify(id)?.succeeded() {
                report.succeeded += 1;
            }
        }
        if report.claimed > 0 {
            tracing::info!(
                kind = self.kind(),
                claimed = report.claimed,
                verified = report.succeeded,
                "verification batch"
            );
        }
        Ok(report)
    }

    /// Fails rows stuck in `started` or `verification_started` past their
    /// timeouts. Returns how many rows were swept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn fail_timeouts(&self) -> EngineResult<usize> {
        let config = self.context.config();
        let mut swept = self
            .verification_store()
            .fail_verification_timeouts(config.verification_timeout)?;
        if let Ok(registry) = self.registry() {
            swept += registry.fail_sync_timeouts(config.sync_timeout)?;
        }
        Ok(swept)
    }

    /// Marks old successful verifications for recomputation. Returns how
    /// many rows were marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn reverify_batch(&self) -> EngineResult<usize> {
        let config = self.context.config();
        let marked = self.verification_store().reverify_batch(
            config.reverification_batch_size,
            config.minimum_reverification_interval,
        )?;
        if marked > 0 {
            tracing::info!(kind = self.kind(), marked, "marked for reverification");
        }
        Ok(marked)
    }

    /// Runs one backfill pass: registry rows on a secondary, separate
    /// verification rows on the primary.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn backfill(&self) -> EngineResult<BackfillReport> {
        let batch_size = self.context.config().backfill_batch_size;
        if let Ok(registry) = self.registry() {
            let selective = &self.context.settings().selective_sync;
            let report = backfill_registry(
                self.tables.resources.as_ref(),
                registry.table().as_ref(),
                &|r| selective.includes(r.scope.as_deref()),
                batch_size,
                self.context.clock().as_ref(),
            )?;
            return Ok(report);
        }
        match &self.tables.verification {
            VerificationStorage::Separate(states) => Ok(backfill_verification_state(
                self.tables.resources.as_ref(),
                states.as_ref(),
                batch_size,
            )?),
            VerificationStorage::CoLocated => Ok(BackfillReport::default()),
        }
    }

    /// Runs the periodic verification pass.
    ///
    /// Returns false without doing anything while verification is
    /// disabled. Otherwise verifies one batch and sweeps timeouts; on the
    /// primary it also marks reverifications and backfills a separate
    /// verification table.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn trigger_background_verification(&self) -> EngineResult<bool> {
        if !self.context.config().verification_enabled {
            return Ok(false);
        }
        self.verify_batch()?;
        self.verification_store()
            .fail_verification_timeouts(self.context.config().verification_timeout)?;
        if self.context.is_primary() {
            self.reverify_batch()?;
            if matches!(self.tables.verification, VerificationStorage::Separate(_)) {
                self.backfill()?;
            }
        }
        Ok(true)
    }

    /// Verification batches still to run, counting at most
    /// `max_batch_count` batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn remaining_verification_batch_count(&self, max_batch_count: usize) -> EngineResult<usize> {
        let batch_size = self.context.config().verification_batch_size;
        let count = self
            .verification_store()
            .needs_verification_count(max_batch_count.saturating_mul(batch_size))?;
        Ok(batches(count, batch_size))
    }

    /// Reverification batches still to run, counting at most
    /// `max_batch_count` batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn remaining_reverification_batch_count(&self, max_batch_count: usize) -> EngineResult<usize> {
        let config = self.context.config();
        let batch_size = config.reverification_batch_size;
        let count = self.verification_store().needs_reverification_count(
            max_batch_count.saturating_mul(batch_size),
            config.minimum_reverification_interval,
        )?;
        Ok(batches(count, batch_size))
    }
}
