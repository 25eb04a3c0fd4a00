//! CLI command implementations.

pub mod init;
pub mod resources;
pub mod status;
pub mod work;

use crate::journal::EventJournal;
use clap::ValueEnum;
use georep_core::{Clock, RegistryRecord, Resource, SystemClock};
use georep_engine::{
    BlobStrategy, LocalPrimary, Replicator, ReplicatorStrategy, RepositoryStrategy, RequestSigner,
    ResourceTables, SiteContext, SiteRole, SiteSettings,
};
use georep_storage::{FileTable, Table};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a kind's content is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Layout {
    /// One immutable file per resource.
    Blob,
    /// A directory tree per resource.
    Repository,
}

/// Where a command runs.
#[derive(Debug, Clone)]
pub struct Target {
    /// Shared store directory.
    pub store: PathBuf,
    /// Site settings file.
    pub site: PathBuf,
    /// Resource kind.
    pub kind: String,
    /// Content layout of the kind.
    pub layout: Layout,
    /// The primary's storage root, read by a secondary's transfers.
    pub primary_root: Option<PathBuf>,
}

/// A replicator opened over the store directory.
pub struct Workspace {
    /// Settings of this site.
    pub settings: SiteSettings,
    /// The event journal.
    pub journal: Arc<EventJournal>,
    /// Replicator for the target kind.
    pub replicator: Arc<Replicator>,
    store: PathBuf,
}

impl Workspace {
    /// Opens the target's site.
    pub fn open(target: &Target) -> Result<Self, Box<dyn Error>> {
        let settings = SiteSettings::load(&target.site)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let journal = Arc::new(EventJournal::open(&target.store)?);

        let strategy: Arc<dyn ReplicatorStrategy> = match target.layout {
            Layout::Blob => Arc::new(BlobStrategy::new(target.kind.as_str())),
            Layout::Repository => Arc::new(RepositoryStrategy::new(
                target.kind.as_str(),
                settings.config.repository_maintenance_interval,
            )),
        };
        let resources: Arc<dyn Table<Resource>> = Arc::new(FileTable::open(
            &target.store,
            format!("{}_resources", target.kind),
        )?);
        let tables = ResourceTables::co_located(resources);

        let replicator = match settings.role {
            SiteRole::Primary => {
                let context =
                    SiteContext::new(settings.clone(), clock).with_publisher(journal.clone());
                Replicator::primary(strategy, Arc::new(context), tables)?
            }
            SiteRole::Secondary => {
                let primary_root = target
                    .primary_root
                    .as_deref()
                    .ok_or("--primary-root is required on a secondary site")?;
                let registry: Arc<dyn Table<RegistryRecord>> = Arc::new(FileTable::open(
                    &target.store,
                    format!("{}_registry_{}", target.kind, settings.name),
                )?);
                let client = LocalPrimary::new(
                    primary_root,
                    RequestSigner::new(settings.secret.clone().into_bytes()),
                    Arc::clone(&clock),
                );
                let context = SiteContext::new(settings.clone(), clock);
                Replicator::secondary(strategy, Arc::new(context), tables, registry, Arc::new(client))?
            }
        };

        tracing::debug!(
            site = %settings.name,
            role = %settings.role,
            kind = %target.kind,
            "opened workspace"
        );
        Ok(Self {
            settings,
            journal,
            replicator: Arc::new(replicator),
            store: target.store.clone(),
        })
    }

    /// The store directory.
    pub fn store(&self) -> &Path {
        &self.store
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use georep_engine::SelectiveSync;
    use tempfile::TempDir;

    /// A primary and a secondary sharing one store directory.
    pub struct TwoSites {
        pub dir: TempDir,
        pub primary: Target,
        pub secondary: Target,
    }

    impl TwoSites {
        pub fn new(layout: Layout, selective_sync: SelectiveSync) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = dir.path().join("store");
            let primary_root = dir.path().join("primary");
            let primary_site = dir.path().join("primary.json");
            let secondary_site = dir.path().join("secondary.json");

            SiteSettings::new("primary", SiteRole::Primary, &primary_root)
                .with_secret("s3cret")
                .save(&primary_site)
                .unwrap();
            SiteSettings::new("eu", SiteRole::Secondary, dir.path().join("secondary"))
                .with_secret("s3cret")
                .with_selective_sync(selective_sync)
                .save(&secondary_site)
                .unwrap();

            let kind = match layout {
                Layout::Blob => "upload",
                Layout::Repository => "project_repository",
            };
            let target = |site: PathBuf| Target {
                store: store.clone(),
                site,
                kind: kind.to_string(),
                layout,
                primary_root: Some(primary_root.clone()),
            };
            Self {
                primary: target(primary_site),
                secondary: target(secondary_site),
                dir,
            }
        }

        pub fn primary_root(&self) -> PathBuf {
            self.dir.path().join("primary")
        }

        pub fn secondary_root(&self) -> PathBuf {
            self.dir.path().join("secondary")
        }
    }

    #[test]
    fn secondary_requires_primary_root() {
        let sites = TwoSites::new(Layout::Blob, SelectiveSync::All);
        let mut target = sites.secondary.clone();
        target.primary_root = None;
        assert!(Workspace::open(&target).is_err());
    }

    #[test]
    fn sites_open_with_their_roles() {
        let sites = TwoSites::new(Layout::Repository, SelectiveSync::All);
        let primary = Workspace::open(&sites.primary).unwrap();
        let secondary = Workspace::open(&sites.secondary).unwrap();
        assert!(primary.replicator.registry().is_err());
        assert!(secondary.replicator.registry().is_ok());
        assert_eq!(secondary.replicator.kind(), "project_repository");
    }
}
