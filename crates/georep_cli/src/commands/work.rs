//! Worker commands: one invocation runs one or more bounded batches.

use super::{Target, Workspace};
use crate::journal::Cursor;
use georep_engine::{BatchReport, EngineError, EventDispatcher};
use std::error::Error;
use std::sync::Arc;

/// Applies journal entries this secondary has not seen for the target
/// kind. Returns how many were applied. Does nothing on the primary.
pub fn replay(workspace: &Workspace) -> Result<usize, Box<dyn Error>> {
    let replicator = &workspace.replicator;
    if replicator.context().is_primary() {
        return Ok(0);
    }
    let cursor = Cursor::open(workspace.store(), &workspace.settings.name, replicator.kind())?;
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(Arc::clone(replicator));

    let mut applied = 0;
    for (sequence, bytes) in workspace.journal.entries_after(cursor.load()?)? {
        match dispatcher.dispatch_encoded(&bytes) {
            Ok(()) => applied += 1,
            Err(EngineError::UnknownKind(_)) => {}
            Err(e) => return Err(e.into()),
        }
        cursor.save(sequence)?;
    }
    if applied > 0 {
        tracing::info!(kind = replicator.kind(), applied, "replayed events");
    }
    Ok(applied)
}

fn run_batches(
    batches: usize,
    mut batch: impl FnMut() -> Result<BatchReport, EngineError>,
) -> Result<BatchReport, EngineError> {
    let mut total = BatchReport::default();
    for _ in 0..batches.max(1) {
        let report = batch()?;
        total.claimed += report.claimed;
        total.succeeded += report.succeeded;
        if report.claimed == 0 {
            break;
        }
    }
    Ok(total)
}

/// Runs the backfill command.
pub fn backfill(target: &Target) -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::open(target)?;
    let report = workspace.replicator.backfill()?;
    println!(
        "Backfill of {}: {} created, {} removed",
        target.kind, report.created, report.removed
    );
    Ok(())
}

/// Runs the sync command.
pub fn sync(target: &Target, batches: usize) -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::open(target)?;
    let replayed = replay(&workspace)?;
    let report = run_batches(batches, || workspace.replicator.sync_batch())?;
    println!(
        "Sync of {}: {} events, {} claimed, {} synced, {} failed",
        target.kind,
        replayed,
        report.claimed,
        report.succeeded,
        report.failed()
    );
    Ok(())
}

/// Runs the verify command.
///
/// With `background` it runs the full periodic verification pass instead
/// of plain batches.
pub fn verify(target: &Target, batches: usize, background: bool) -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::open(target)?;
    let replicator = &workspace.replicator;
    replay(&workspace)?;

    if background {
        if replicator.trigger_background_verification()? {
            println!("Background verification of {} ran", target.kind);
        } else {
            println!("Verification is disabled");
        }
        return Ok(());
    }

    let report = run_batches(batches, || replicator.verify_batch())?;
    let remaining = replicator.remaining_verification_batch_count(100)?;
    println!(
        "Verification of {}: {} claimed, {} verified, {} failed, {} batches remaining",
        target.kind,
        report.claimed,
        report.succeeded,
        report.failed(),
        remaining
    );
    Ok(())
}

/// Runs the sweep-timeouts command.
pub fn sweep_timeouts(target: &Target) -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::open(target)?;
    let swept = workspace.replicator.fail_timeouts()?;
    println!("Swept {swept} timed-out rows of {}", target.kind);
    Ok(())
}

/// Runs the reverify command.
pub fn reverify(target: &Target) -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::open(target)?;
    let marked = workspace.replicator.reverify_batch()?;
    let remaining = workspace.replicator.remaining_reverification_batch_count(100)?;
    println!(
        "Marked {marked} rows of {} for reverification, {remaining} batches remaining",
        target.kind
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::TwoSites;
    use crate::commands::{resources, Layout};
    use georep_core::{SyncState, VerificationState};
    use georep_engine::SelectiveSync;
    use std::fs;

    fn write(root: &std::path::Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn blob_replicates_through_the_store() {
        let sites = TwoSites::new(Layout::Blob, SelectiveSync::All);
        write(&sites.primary_root(), "uploads/1.bin", b"hello");
        resources::add(&sites.primary, 1, "uploads/1.bin", None).unwrap();

        verify(&sites.primary, 1, false).unwrap();
        sync(&sites.secondary, 1).unwrap();
        verify(&sites.secondary, 1, false).unwrap();

        assert_eq!(fs::read(sites.secondary_root().join("uploads/1.bin")).unwrap(), b"hello");
        let workspace = Workspace::open(&sites.secondary).unwrap();
        let row = workspace.replicator.registry().unwrap().get(1).unwrap().unwrap();
        assert_eq!(row.state, SyncState::Synced);
        assert_eq!(row.verification.state, VerificationState::VerificationSucceeded);

        // Events are applied once.
        assert_eq!(replay(&workspace).unwrap(), 0);

        resources::remove(&sites.primary, 1).unwrap();
        sync(&sites.secondary, 1).unwrap();
        assert!(!sites.secondary_root().join("uploads/1.bin").exists());
        assert!(workspace.replicator.registry().unwrap().get(1).unwrap().is_none());
    }

    #[test]
    fn repository_update_is_resynced() {
        let sites = TwoSites::new(Layout::Repository, SelectiveSync::All);
        write(&sites.primary_root(), "repos/1.git/HEAD", b"v1");
        resources::add(&sites.primary, 1, "repos/1.git", None).unwrap();
        verify(&sites.primary, 1, false).unwrap();
        sync(&sites.secondary, 1).unwrap();

        write(&sites.primary_root(), "repos/1.git/HEAD", b"v2");
        resources::update(&sites.primary, 1).unwrap();
        verify(&sites.primary, 1, false).unwrap();
        sync(&sites.secondary, 1).unwrap();
        verify(&sites.secondary, 1, false).unwrap();

        assert_eq!(fs::read(sites.secondary_root().join("repos/1.git/HEAD")).unwrap(), b"v2");
        let workspace = Workspace::open(&sites.secondary).unwrap();
        let status = workspace.replicator.status().unwrap();
        assert_eq!(status.verification.unwrap().verified, 1);
    }

    #[test]
    fn backfill_discovers_unannounced_resources() {
        let sites = TwoSites::new(Layout::Blob, SelectiveSync::scopes(["group-a"]));
        write(&sites.primary_root(), "uploads/1.bin", b"a");
        write(&sites.primary_root(), "uploads/2.bin", b"b");
        resources::add(&sites.primary, 1, "uploads/1.bin", Some("group-a")).unwrap();
        resources::add(&sites.primary, 2, "uploads/2.bin", Some("group-b")).unwrap();

        // Lose the secondary's view of the journal entirely.
        let workspace = Workspace::open(&sites.secondary).unwrap();
        Cursor::open(workspace.store(), "eu", "upload").unwrap().save(u64::MAX).unwrap();

        backfill(&sites.secondary).unwrap();
        sync(&sites.secondary, 1).unwrap();
        assert!(sites.secondary_root().join("uploads/1.bin").exists());
        assert!(!sites.secondary_root().join("uploads/2.bin").exists());
    }

    #[test]
    fn maintenance_commands_run_on_both_roles() {
        let sites = TwoSites::new(Layout::Blob, SelectiveSync::All);
        sweep_timeouts(&sites.primary).unwrap();
        sweep_timeouts(&sites.secondary).unwrap();
        reverify(&sites.primary).unwrap();
        verify(&sites.primary, 1, true).unwrap();
        assert!(sync(&sites.primary, 1).is_err());
    }
}
