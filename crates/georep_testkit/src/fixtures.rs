//! Two-site fixtures.
//!
//! A [`TestSites`] wires a primary and a secondary replicator for one
//! resource kind over shared in-memory tables, the way two sites share a
//! database in production. Each site gets its own temporary storage root;
//! transfers go through a [`LocalPrimary`] reading the primary's root.

use georep_core::{
    Clock, MockClock, RecordId, RegistryRecord, ReplicationConfig, Resource, VerificationFields,
};
use georep_engine::{
    BlobStrategy, EventDispatcher, LocalPrimary, PrimaryClient, Replicator, ReplicatorStrategy,
    RepositoryEntry, RepositoryStrategy, RequestSigner, ResourceTables, SelectiveSync,
    SiteContext, SiteRole, SiteSettings, TransferError, TransferRequest,
};
use georep_protocol::EventLog;
use georep_storage::{InMemoryTable, Table};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Shared secret of the fixture sites.
pub const TEST_SECRET: &str = "testkit-secret";

type FetchHook = Box<dyn FnOnce() + Send>;

/// A [`PrimaryClient`] that counts fetches and can run a hook right after
/// the next fetch returns, while the transfer is still in flight.
pub struct InterceptingClient {
    inner: LocalPrimary,
    fetches: AtomicUsize,
    hook: Mutex<Option<FetchHook>>,
}

impl InterceptingClient {
    /// Wraps `inner`.
    pub fn new(inner: LocalPrimary) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Runs `hook` once, after the next fetch has read the primary's
    /// content and before the secondary writes it.
    pub fn on_next_fetch(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().expect("hook poisoned") = Some(Box::new(hook));
    }

    /// Fetches served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn after_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let hook = self.hook.lock().expect("hook poisoned").take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl PrimaryClient for InterceptingClient {
    fn fetch_blob(&self, request: &TransferRequest) -> Result<Vec<u8>, TransferError> {
        let result = self.inner.fetch_blob(request);
        self.after_fetch();
        result
    }

    fn fetch_repository(&self, request: &TransferRequest) -> Result<Vec<RepositoryEntry>, TransferError> {
        let result = self.inner.fetch_repository(request);
        self.after_fetch();
        result
    }
}

/// Builder for [`TestSites`].
pub struct TestSitesBuilder {
    strategy: Arc<dyn ReplicatorStrategy>,
    selective_sync: SelectiveSync,
    config: ReplicationConfig,
    lock_hold: Option<Duration>,
}

impl TestSitesBuilder {
    /// Limits the secondary to the given scopes.
    pub fn selective_sync(mut self, selective_sync: SelectiveSync) -> Self {
        self.selective_sync = selective_sync;
        self
    }

    /// Uses `config` on both sites.
    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Holds row locks in the registry table for `hold` during claims and
    /// conditional updates, to widen race windows.
    pub fn registry_lock_hold(mut self, hold: Duration) -> Self {
        self.lock_hold = Some(hold);
        self
    }

    /// Builds both sites.
    pub fn build(self) -> TestSites {
        let clock = Arc::new(MockClock::starting_now());
        let log = Arc::new(EventLog::new());
        let primary_dir = TempDir::new().expect("Failed to create primary root");
        let secondary_dir = TempDir::new().expect("Failed to create secondary root");
        let resources = Arc::new(InMemoryTable::<Resource>::new("resources"));
        let mut registry = InMemoryTable::<RegistryRecord>::new("registry");
        if let Some(hold) = self.lock_hold {
            registry = registry.with_lock_hold(hold);
        }
        let registry = Arc::new(registry);

        let primary_settings = SiteSettings::new("primary", SiteRole::Primary, primary_dir.path())
            .with_secret(TEST_SECRET)
            .with_config(self.config.clone());
        let primary_context =
            SiteContext::new(primary_settings, clock.clone()).with_publisher(log.clone());
        let primary = Replicator::primary(
            self.strategy.clone(),
            Arc::new(primary_context),
            ResourceTables::co_located(resources.clone()),
        )
        .expect("Failed to build primary replicator");

        let secondary_settings =
            SiteSettings::new("secondary", SiteRole::Secondary, secondary_dir.path())
                .with_secret(TEST_SECRET)
                .with_selective_sync(self.selective_sync)
                .with_config(self.config);
        let transfers = Arc::new(InterceptingClient::new(LocalPrimary::new(
            primary_dir.path(),
            RequestSigner::new(TEST_SECRET.as_bytes().to_vec()),
            clock.clone(),
        )));
        let secondary = Replicator::secondary(
            self.strategy,
            Arc::new(SiteContext::new(secondary_settings, clock.clone())),
            ResourceTables::co_located(resources.clone()),
            registry.clone(),
            transfers.clone(),
        )
        .expect("Failed to build secondary replicator");
        let secondary = Arc::new(secondary);

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(secondary.clone());

        TestSites {
            clock,
            log,
            resources,
            registry,
            primary: Arc::new(primary),
            secondary,
            dispatcher: Arc::new(dispatcher),
            transfers,
            primary_dir,
            secondary_dir,
        }
    }
}

/// A primary and a secondary replicating one resource kind.
pub struct TestSites {
    /// Clock shared by both sites.
    pub clock: Arc<MockClock>,
    /// The primary's event log.
    pub log: Arc<EventLog>,
    /// Resource table, shared by both sites.
    pub resources: Arc<InMemoryTable<Resource>>,
    /// The secondary's registry table.
    pub registry: Arc<InMemoryTable<RegistryRecord>>,
    /// Primary replicator.
    pub primary: Arc<Replicator>,
    /// Secondary replicator.
    pub secondary: Arc<Replicator>,
    /// The secondary's event dispatcher.
    pub dispatcher: Arc<EventDispatcher>,
    /// The secondary's connection to the primary.
    pub transfers: Arc<InterceptingClient>,
    primary_dir: TempDir,
    secondary_dir: TempDir,
}

impl TestSites {
    /// Starts a builder for `strategy`.
    pub fn builder(strategy: Arc<dyn ReplicatorStrategy>) -> TestSitesBuilder {
        TestSitesBuilder {
            strategy,
            selective_sync: SelectiveSync::All,
            config: ReplicationConfig::new(),
            lock_hold: None,
        }
    }

    /// Sites replicating immutable `upload` blobs.
    pub fn blob() -> Self {
        Self::builder(Arc::new(BlobStrategy::new("upload"))).build()
    }

    /// Sites replicating `project_repository` trees.
    pub fn repository() -> Self {
        Self::builder(Arc::new(RepositoryStrategy::new("project_repository", 10))).build()
    }

    /// The primary's storage root.
    pub fn primary_root(&self) -> &Path {
        self.primary_dir.path()
    }

    /// The secondary's storage root.
    pub fn secondary_root(&self) -> &Path {
        self.secondary_dir.path()
    }

    /// Writes a file under the primary's root.
    pub fn write_primary(&self, relative: &str, content: &[u8]) -> PathBuf {
        write_file(self.primary_root(), relative, content)
    }

    /// Writes a file under the secondary's root.
    pub fn write_secondary(&self, relative: &str, content: &[u8]) -> PathBuf {
        write_file(self.secondary_root(), relative, content)
    }

    /// Reads a file under the secondary's root.
    pub fn secondary_content(&self, relative: &str) -> Option<Vec<u8>> {
        fs::read(self.secondary_root().join(relative)).ok()
    }

    /// Stores `content` as `uploads/<id>.bin` on the primary and creates
    /// its resource. Returns the locator.
    pub fn create_blob(&self, id: RecordId, content: &[u8]) -> String {
        let locator = format!("uploads/{id}.bin");
        self.write_primary(&locator, content);
        self.primary
            .create_resource(Resource::new(id, locator.clone(), self.clock.now()))
            .expect("Failed to create resource");
        locator
    }

    /// Writes `files` into `repos/<id>.git` on the primary and creates its
    /// resource. Returns the locator.
    pub fn create_repository(&self, id: RecordId, files: &[(&str, &[u8])]) -> String {
        let locator = format!("repos/{id}.git");
        for (path, content) in files {
            self.write_primary(&format!("{locator}/{path}"), content);
        }
        self.primary
            .create_resource(Resource::new(id, locator.clone(), self.clock.now()))
            .expect("Failed to create resource");
        locator
    }

    /// Delivers every pending event to the secondary.
    pub fn drain(&self) -> usize {
        self.dispatcher
            .drain(&self.log, usize::MAX)
            .expect("Failed to drain events")
    }

    /// Runs one round of every worker on both sites: primary verification,
    /// event delivery, secondary sync and secondary verification.
    pub fn replicate(&self) {
        self.primary.verify_batch().expect("Primary verification failed");
        self.drain();
        self.secondary.sync_batch().expect("Sync batch failed");
        self.drain();
        self.secondary.verify_batch().expect("Secondary verification failed");
    }

    /// Runs [`replicate`](Self::replicate) `rounds` times, advancing the
    /// clock past any retry backoff between rounds.
    pub fn replicate_rounds(&self, rounds: usize) {
        for _ in 0..rounds {
            self.replicate();
            self.clock.advance(chrono::Duration::hours(5));
        }
    }

    /// Returns the registry row for `id`.
    pub fn registry_row(&self, id: RecordId) -> Option<RegistryRecord> {
        self.registry.get(id).expect("Failed to read registry")
    }

    /// Returns the primary's verification columns for `id`.
    pub fn primary_fields(&self, id: RecordId) -> Option<VerificationFields> {
        self.primary
            .primary_verification()
            .fields(id)
            .expect("Failed to read verification state")
    }
}

fn write_file(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create directories");
    }
    fs::write(&path, content).expect("Failed to write file");
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use georep_core::{SyncState, VerificationState};

    #[test]
    fn test_blob_sites_replicate() {
        let sites = TestSites::blob();
        sites.create_blob(1, b"hello");
        sites.replicate();

        assert_eq!(sites.secondary_content("uploads/1.bin"), Some(b"hello".to_vec()));
        assert_eq!(sites.transfers.fetch_count(), 1);
        let row = sites.registry_row(1).unwrap();
        assert_eq!(row.state, SyncState::Synced);
        assert_eq!(row.verification.state, VerificationState::VerificationSucceeded);
    }

    #[test]
    fn test_repository_sites_replicate() {
        let sites = TestSites::repository();
        sites.create_repository(7, &[("HEAD", b"ref: refs/heads/main"), ("objects/ab", b"blob")]);
        sites.replicate();

        assert_eq!(
            sites.secondary_content("repos/7.git/objects/ab"),
            Some(b"blob".to_vec())
        );
        assert_eq!(
            sites.registry_row(7).unwrap().verification.state,
            VerificationState::VerificationSucceeded
        );
    }

    #[test]
    fn test_roots_are_distinct() {
        let sites = TestSites::blob();
        assert_ne!(sites.primary_root(), sites.secondary_root());
        sites.write_primary("a", b"x");
        assert_eq!(sites.secondary_content("a"), None);
    }
}
