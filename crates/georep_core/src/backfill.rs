//! Consistency passes between a resource table and the tables that shadow
//! it: the secondary's registry and the primary's separate verification
//! table.

use crate::clock::Clock;
use crate::error::CoreResult;
use crate::model::{RegistryRecord, Resource, VerificationStateRow};
use georep_storage::{RowKey, Table};
use std::collections::BTreeSet;

/// What one backfill pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Rows created for resources that had none.
    pub created: usize,
    /// Rows removed because their resource is gone.
    pub removed: usize,
}

impl BackfillReport {
    /// Returns true if the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.removed == 0
    }
}

/// Creates pending registry rows for in-scope resources that have none and
/// removes registry rows whose resource no longer exists.
///
/// At most `batch_size` rows are created and at most `batch_size` removed
/// per call; callers repeat until the report is empty. Rows of resources
/// that exist but fall out of scope are kept.
///
/// # Errors
///
/// Returns an error if either store fails.
pub fn backfill_registry(
    resources: &dyn Table<Resource>,
    registry: &dyn Table<RegistryRecord>,
    in_scope: &dyn Fn(&Resource) -> bool,
    batch_size: usize,
    clock: &dyn Clock,
) -> CoreResult<BackfillReport> {
    let existing: BTreeSet<RowKey> = registry.keys()?.into_iter().collect();
    let mut report = BackfillReport::default();

    for id in resources.keys()? {
        if report.created >= batch_size {
            break;
        }
        if existing.contains(&id) {
            continue;
        }
        let Some(resource) = resources.get(id)? else {
            continue;
        };
        if in_scope(&resource) && registry.insert(RegistryRecord::new(id, clock.now()))? {
            report.created += 1;
        }
    }

    report.removed = remove_orphans(resources, existing, batch_size, &|id| registry.delete(id))?;

    if !report.is_empty() {
        tracing::info!(
            table = registry.name(),
            created = report.created,
            removed = report.removed,
            "registry backfill"
        );
    }
    Ok(report)
}

/// Inserts verification rows for resources that have none and deletes
/// rows whose resource no longer exists, `batch_size` of each per call.
///
/// # Errors
///
/// Returns an error if either store fails.
pub fn backfill_verification_state(
    resources: &dyn Table<Resource>,
    states: &dyn Table<VerificationStateRow>,
    batch_size: usize,
) -> CoreResult<BackfillReport> {
    let existing: BTreeSet<RowKey> = states.keys()?.into_iter().collect();
    let mut report = BackfillReport::default();

    for id in resources.keys()? {
        if report.created >= batch_size {
            break;
        }
        if !existing.contains(&id) && states.insert(VerificationStateRow::new(id))? {
            report.created += 1;
        }
    }

    report.removed = remove_orphans(resources, existing, batch_size, &|id| states.delete(id))?;

    if !report.is_empty() {
        tracing::info!(
            table = states.name(),
            created = report.created,
            removed = report.removed,
            "verification state backfill"
        );
    }
    Ok(report)
}

fn remove_orphans(
    resources: &dyn Table<Resource>,
    shadow_keys: BTreeSet<RowKey>,
    batch_size: usize,
    delete: &dyn Fn(RowKey) -> georep_storage::StorageResult<bool>,
) -> CoreResult<usize> {
    let live: BTreeSet<RowKey> = resources.keys()?.into_iter().collect();
    let mut removed = 0;
    for id in shadow_keys.difference(&live) {
        if removed >= batch_size {
            break;
        }
        if delete(*id)? {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::model::SyncState;
    use georep_storage::InMemoryTable;

    fn resources(ids: &[i64]) -> InMemoryTable<Resource> {
        let clock = MockClock::starting_now();
        let table = InMemoryTable::new("uploads");
        for &id in ids {
            let scope = if id % 2 == 0 { "even" } else { "odd" };
            table
                .insert(Resource::new(id, format!("uploads/{id}"), clock.now()).with_scope(scope))
                .unwrap();
        }
        table
    }

    #[test]
    fn registry_backfill_creates_pending_rows() {
        let clock = MockClock::starting_now();
        let resources = resources(&[1, 2, 3]);
        let registry = InMemoryTable::new("upload_registry");

        let report = backfill_registry(&resources, &registry, &|_| true, 100, &clock).unwrap();
        assert_eq!(report, BackfillReport { created: 3, removed: 0 });
        assert!(registry
            .rows()
            .iter()
            .all(|r| r.state == SyncState::Pending));

        let again = backfill_registry(&resources, &registry, &|_| true, 100, &clock).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn registry_backfill_respects_scope_and_batch() {
        let clock = MockClock::starting_now();
        let resources = resources(&[1, 2, 3, 4, 5, 6]);
        let registry = InMemoryTable::new("upload_registry");
        let even = |r: &Resource| r.scope.as_deref() == Some("even");

        let first = backfill_registry(&resources, &registry, &even, 2, &clock).unwrap();
        assert_eq!(first.created, 2);
        let second = backfill_registry(&resources, &registry, &even, 2, &clock).unwrap();
        assert_eq!(second.created, 1);

        let mut keys = registry.keys().unwrap();
        keys.sort_unstable();
        assert_eq!(keys, vec![2, 4, 6]);
    }

    #[test]
    fn registry_backfill_removes_orphans() {
        let clock = MockClock::starting_now();
        let resources = resources(&[1]);
        let registry = InMemoryTable::new("upload_registry");
        for id in [1, 7, 8] {
            registry.insert(RegistryRecord::new(id, clock.now())).unwrap();
        }

        let report = backfill_registry(&resources, &registry, &|_| true, 1, &clock).unwrap();
        assert_eq!(report.removed, 1);
        let report = backfill_registry(&resources, &registry, &|_| true, 1, &clock).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(registry.keys().unwrap(), vec![1]);
    }

    #[test]
    fn verification_state_backfill() {
        let resources = resources(&[1, 2]);
        let states = InMemoryTable::new("upload_states");
        states.insert(VerificationStateRow::new(9)).unwrap();

        let report = backfill_verification_state(&resources, &states, 10).unwrap();
        assert_eq!(report, BackfillReport { created: 2, removed: 1 });
        assert_eq!(states.keys().unwrap(), vec![1, 2]);
    }
}
