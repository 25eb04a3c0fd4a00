//! Cross-crate integration test helpers.
//!
//! A [`ReplicationHarness`] drives a [`TestSites`] pair while tracking the
//! content each resource should end up with on the secondary, and checks
//! that replication converges to it.

use crate::fixtures::TestSites;
use georep_core::{RecordId, SyncState, VerificationState};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Content a resource should have on the secondary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    /// A blob with these bytes.
    Blob(Vec<u8>),
    /// A repository with exactly these files.
    Repository(BTreeMap<String, Vec<u8>>),
    /// Nothing: the resource was deleted.
    Absent,
}

/// A test harness for replication scenarios.
pub struct ReplicationHarness {
    /// The sites under test.
    pub sites: TestSites,
    expected: BTreeMap<RecordId, (String, Expected)>,
}

impl ReplicationHarness {
    /// Wraps `sites`.
    pub fn new(sites: TestSites) -> Self {
        Self {
            sites,
            expected: BTreeMap::new(),
        }
    }

    /// Creates a blob and tracks it.
    pub fn add_blob(&mut self, id: RecordId, content: &[u8]) {
        let locator = self.sites.create_blob(id, content);
        self.expected
            .insert(id, (locator, Expected::Blob(content.to_vec())));
    }

    /// Creates a repository and tracks it.
    pub fn add_repository(&mut self, id: RecordId, files: &[(&str, &[u8])]) {
        let locator = self.sites.create_repository(id, files);
        self.expected.insert(id, (locator, Expected::Repository(to_map(files))));
    }

    /// Replaces a repository's files on the primary and records the update.
    pub fn update_repository(&mut self, id: RecordId, files: &[(&str, &[u8])]) {
        let locator = self.locator(id);
        let root = self.sites.primary_root().join(&locator);
        if root.exists() {
            fs::remove_dir_all(&root).expect("Failed to clear repository");
        }
        for (path, content) in files {
            self.sites.write_primary(&format!("{locator}/{path}"), content);
        }
        self.sites
            .primary
            .update_resource(id)
            .expect("Failed to update resource");
        self.expected.insert(id, (locator, Expected::Repository(to_map(files))));
    }

    /// Deletes a resource on the primary.
    pub fn delete(&mut self, id: RecordId) {
        let locator = self.locator(id);
        self.sites
            .primary
            .destroy_resource(id)
            .expect("Failed to destroy resource");
        self.expected.insert(id, (locator, Expected::Absent));
    }

    fn locator(&self, id: RecordId) -> String {
        self.expected
            .get(&id)
            .map(|(locator, _)| locator.clone())
            .unwrap_or_else(|| panic!("resource {id} is not tracked"))
    }

    /// Lists every way the secondary differs from what is expected.
    pub fn divergences(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (id, (locator, expected)) in &self.expected {
            let path = self.sites.secondary_root().join(locator);
            let row = self.sites.registry_row(*id);
            match expected {
                Expected::Absent => {
                    if path.exists() {
                        problems.push(format!("{id}: deleted resource still on disk"));
                    }
                    if row.is_some() {
                        problems.push(format!("{id}: deleted resource still registered"));
                    }
                    continue;
                }
                Expected::Blob(bytes) => {
                    if fs::read(&path).ok().as_ref() != Some(bytes) {
                        problems.push(format!("{id}: blob content differs"));
                    }
                }
                Expected::Repository(files) => {
                    if &read_tree(&path) != files {
                        problems.push(format!("{id}: repository content differs"));
                    }
                }
            }
            match row {
                None => problems.push(format!("{id}: not registered")),
                Some(row) => {
                    if row.state != SyncState::Synced {
                        problems.push(format!("{id}: sync state {}", row.state));
                    }
                    if row.verification.state != VerificationState::VerificationSucceeded {
                        problems.push(format!("{id}: verification state {}", row.verification.state));
                    }
                    if row.checksum_mismatch {
                        problems.push(format!("{id}: checksum mismatch"));
                    }
                }
            }
        }
        problems
    }

    /// Runs replication rounds until the secondary matches, up to
    /// `max_rounds`. Returns the rounds it took.
    pub fn converge(&self, max_rounds: usize) -> Option<usize> {
        for round in 1..=max_rounds {
            self.sites.replicate_rounds(1);
            if self.divergences().is_empty() {
                return Some(round);
            }
        }
        None
    }

    /// Asserts the secondary matches within `max_rounds` rounds.
    pub fn assert_converges(&self, max_rounds: usize) {
        if self.converge(max_rounds).is_none() {
            panic!("did not converge: {:?}", self.divergences());
        }
    }
}

fn to_map(files: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
    files
        .iter()
        .map(|(path, content)| (path.to_string(), content.to_vec()))
        .collect()
}

fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let (Ok(relative), Ok(content)) = (path.strip_prefix(root), fs::read(&path)) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.insert(key, content);
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use georep_core::{Clock, Resource, VerificationOutcome};
    use georep_engine::SelectiveSync;
    use std::sync::Arc;

    #[test]
    fn test_blobs_converge_after_delete() {
        let mut h = ReplicationHarness::new(TestSites::blob());
        for id in 1..=5 {
            h.add_blob(id, format!("blob {id}").as_bytes());
        }
        h.assert_converges(2);

        h.delete(3);
        h.sites.drain();
        assert!(h.divergences().is_empty(), "{:?}", h.divergences());
    }

    #[test]
    fn test_repository_updates_converge() {
        let mut h = ReplicationHarness::new(TestSites::repository());
        h.add_repository(1, &[("HEAD", b"ref: main"), ("refs/heads/main", b"aaa")]);
        h.assert_converges(2);

        h.update_repository(1, &[("HEAD", b"ref: main"), ("refs/heads/main", b"bbb")]);
        assert!(!h.divergences().is_empty());
        h.assert_converges(3);
    }

    #[test]
    fn test_update_during_transfer_is_not_lost() {
        let mut h = ReplicationHarness::new(TestSites::repository());
        h.add_repository(1, &[("refs/heads/main", b"v1")]);
        h.assert_converges(2);

        h.update_repository(1, &[("refs/heads/main", b"v2")]);
        h.sites.drain();

        // A second update lands after the transfer read v2 from the primary.
        let primary = Arc::clone(&h.sites.primary);
        let dispatcher = Arc::clone(&h.sites.dispatcher);
        let log = Arc::clone(&h.sites.log);
        let main = h.sites.primary_root().join("repos/1.git/refs/heads/main");
        h.sites.transfers.on_next_fetch(move || {
            fs::write(&main, b"v3").unwrap();
            primary.update_resource(1).unwrap();
            dispatcher.drain(&log, 100).unwrap();
        });
        h.expected
            .insert(1, ("repos/1.git".into(), Expected::Repository(to_map(&[("refs/heads/main", b"v3")]))));

        let report = h.sites.secondary.sync_batch().unwrap();
        assert_eq!((report.claimed, report.succeeded), (1, 0));
        assert_eq!(h.sites.registry_row(1).unwrap().state, SyncState::Pending);
        h.assert_converges(3);
    }

    #[test]
    fn test_stale_copy_marked_synced_is_repaired() {
        let mut h = ReplicationHarness::new(TestSites::repository());
        h.add_repository(1, &[("refs/heads/main", b"v1")]);
        h.assert_converges(2);

        // Sync A reads v2. Before it writes, v3 lands and sync B copies v3
        // and marks the row synced; A then overwrites the copy with v2.
        h.update_repository(1, &[("refs/heads/main", b"v2")]);
        h.sites.drain();
        let primary = Arc::clone(&h.sites.primary);
        let secondary = Arc::clone(&h.sites.secondary);
        let dispatcher = Arc::clone(&h.sites.dispatcher);
        let log = Arc::clone(&h.sites.log);
        let main = h.sites.primary_root().join("repos/1.git/refs/heads/main");
        h.sites.transfers.on_next_fetch(move || {
            fs::write(&main, b"v3").unwrap();
            primary.update_resource(1).unwrap();
            dispatcher.drain(&log, 100).unwrap();
            assert!(secondary.sync(1).unwrap());
        });
        h.expected
            .insert(1, ("repos/1.git".into(), Expected::Repository(to_map(&[("refs/heads/main", b"v3")]))));

        assert!(!h.sites.secondary.sync(1).unwrap());
        assert_eq!(h.sites.secondary_content("repos/1.git/refs/heads/main"), Some(b"v2".to_vec()));
        assert_eq!(h.sites.registry_row(1).unwrap().state, SyncState::Synced);

        // The primary's next checksum exposes the stale copy.
        h.sites.primary.verify_batch().unwrap();
        h.sites.drain();
        let outcome = h.sites.secondary.verify(1).unwrap();
        assert!(matches!(outcome, VerificationOutcome::Mismatch { .. }));
        assert_eq!(h.sites.registry_row(1).unwrap().state, SyncState::Failed);

        h.assert_converges(3);
        assert_eq!(h.sites.transfers.fetch_count(), 4);
    }

    #[test]
    fn test_selective_sync_tracks_only_in_scope() {
        let sites = TestSites::builder(Arc::new(georep_engine::BlobStrategy::new("upload")))
            .selective_sync(SelectiveSync::scopes(["group-a"]))
            .build();
        for (id, scope) in [(1, "group-a"), (2, "group-b"), (3, "group-a")] {
            let locator = format!("uploads/{id}.bin");
            sites.write_primary(&locator, b"x");
            sites
                .primary
                .create_resource(Resource::new(id, locator, sites.clock.now()).with_scope(scope))
                .unwrap();
        }
        sites.replicate_rounds(2);

        assert_eq!(sites.registry.len(), 2);
        assert!(sites.registry_row(2).is_none());
        assert_eq!(sites.secondary_content("uploads/2.bin"), None);
        assert_eq!(sites.transfers.fetch_count(), 2);
    }
}
