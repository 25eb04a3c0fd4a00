//! Per-kind replication behavior.
//!
//! A [`ReplicatorStrategy`] knows how one kind of resource is stored: how
//! to checksum the local copy, how to fetch it from the primary, and how to
//! remove it. Two structural variants cover every kind: [`BlobStrategy`]
//! for single files and [`RepositoryStrategy`] for directory trees.

use crate::error::{ChecksumError, TransferError};
use crate::transport::{resolve, PrimaryClient, RepositoryEntry, TransferRequest};
use georep_core::{Checksum, Resource};
use georep_protocol::EventParams;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Event parameter naming a deleted blob's storage path.
pub const PATH_PARAM: &str = "path";
/// Event parameter naming a deleted repository's disk path.
pub const DISK_PATH_PARAM: &str = "disk_path";

/// Storage behavior of one resource kind.
pub trait ReplicatorStrategy: Send + Sync {
    /// Resource kind carried in events, e.g. `upload`.
    fn kind(&self) -> &str;

    /// Whether content never changes after creation.
    fn immutable(&self) -> bool;

    /// Whether the resource's content is present under `root`.
    fn checksummable(&self, root: &Path, resource: &Resource) -> bool;

    /// Computes the checksum of the copy under `root`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChecksumError`] if the content is absent or unreadable.
    fn calculate_checksum(&self, root: &Path, resource: &Resource) -> Result<Checksum, ChecksumError>;

    /// Fetches the resource from the primary into `root`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] if the fetch or the local write fails.
    fn transfer(
        &self,
        client: &dyn PrimaryClient,
        request: &TransferRequest,
        root: &Path,
    ) -> Result<(), TransferError>;

    /// Parameters a `deleted` event needs to remove the local copy once
    /// the primary's row is gone.
    fn deleted_params(&self, resource: &Resource) -> EventParams;

    /// Removes the local copy named by a `deleted` event's parameters.
    /// Returns false if there was nothing to remove.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    fn remove(&self, root: &Path, params: &EventParams) -> io::Result<bool>;

    /// Called after each successful sync.
    fn after_sync(&self) {}

    /// Whether maintenance is due.
    fn needs_maintenance(&self) -> bool {
        false
    }

    /// Runs maintenance on the copy under `root`, returning the number of
    /// items cleaned up.
    ///
    /// # Errors
    ///
    /// Returns an error if maintenance fails.
    fn maintenance(&self, _root: &Path, _resource: &Resource) -> io::Result<usize> {
        Ok(0)
    }
}

/// A single file at the resource's storage path.
#[derive(Debug, Clone)]
pub struct BlobStrategy {
    kind: String,
    immutable: bool,
}

impl BlobStrategy {
    /// Creates an immutable blob strategy.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            immutable: true,
        }
    }

    /// Marks the kind as mutable, so update events re-verify it.
    pub fn mutable(mut self) -> Self {
        self.immutable = false;
        self
    }
}

fn locate(root: &Path, locator: &str) -> io::Result<PathBuf> {
    resolve(root, locator).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e.to_string()))
}

impl ReplicatorStrategy for BlobStrategy {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn immutable(&self) -> bool {
        self.immutable
    }

    fn checksummable(&self, root: &Path, resource: &Resource) -> bool {
        locate(root, &resource.locator).is_ok_and(|p| p.is_file())
    }

    fn calculate_checksum(&self, root: &Path, resource: &Resource) -> Result<Checksum, ChecksumError> {
        let path = locate(root, &resource.locator)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ChecksumError::NotChecksummable(resource.locator.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(Checksum::from_bytes(hasher.finalize().into()))
    }

    fn transfer(
        &self,
        client: &dyn PrimaryClient,
        request: &TransferRequest,
        root: &Path,
    ) -> Result<(), TransferError> {
        let bytes = client.fetch_blob(request)?;
        let target = resolve(root, &request.locator)?;
        write_atomically(&target, &bytes)?;
        Ok(())
    }

    fn deleted_params(&self, resource: &Resource) -> EventParams {
        EventParams::new().with(PATH_PARAM, resource.locator.clone())
    }

    fn remove(&self, root: &Path, params: &EventParams) -> io::Result<bool> {
        let Some(locator) = params.get(PATH_PARAM) else {
            return Ok(false);
        };
        match fs::remove_file(locate(root, locator)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A directory tree at the resource's disk path.
///
/// The checksum covers every file's relative path and content, so it
/// changes whenever any ref or object changes.
#[derive(Debug)]
pub struct RepositoryStrategy {
    kind: String,
    maintenance_interval: u32,
    syncs_since_maintenance: AtomicU32,
}

impl RepositoryStrategy {
    /// Creates a repository strategy that wants maintenance every
    /// `maintenance_interval` syncs.
    pub fn new(kind: impl Into<String>, maintenance_interval: u32) -> Self {
        Self {
            kind: kind.into(),
            maintenance_interval: maintenance_interval.max(1),
            syncs_since_maintenance: AtomicU32::new(0),
        }
    }

    /// Syncs since maintenance last ran.
    pub fn syncs_since_maintenance(&self) -> u32 {
        self.syncs_since_maintenance.load(Ordering::SeqCst)
    }
}

impl ReplicatorStrategy for RepositoryStrategy {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn immutable(&self) -> bool {
        false
    }

    fn checksummable(&self, root: &Path, resource: &Resource) -> bool {
        locate(root, &resource.locator).is_ok_and(|p| p.is_dir())
    }

    fn calculate_checksum(&self, root: &Path, resource: &Resource) -> Result<Checksum, ChecksumError> {
        let path = locate(root, &resource.locator)?;
        if !path.is_dir() {
            return Err(ChecksumError::NoRepository(resource.locator.clone()));
        }

        let mut files = Vec::new();
        crate::transport::collect_files(&path, &path, &mut files)?;
        let mut hasher = Sha256::new();
        for file in &files {
            hasher.update(file.path.as_bytes());
            hasher.update([0u8]);
            hasher.update(Sha256::digest(&file.content));
        }
        Ok(Checksum::from_bytes(hasher.finalize().into()))
    }

    fn transfer(
        &self,
        client: &dyn PrimaryClient,
        request: &TransferRequest,
        root: &Path,
    ) -> Result<(), TransferError> {
        let files = client.fetch_repository(request)?;
        let target = resolve(root, &request.locator)?;
        replace_tree(&target, &files)?;
        Ok(())
    }

    fn deleted_params(&self, resource: &Resource) -> EventParams {
        EventParams::new().with(DISK_PATH_PARAM, resource.locator.clone())
    }

    fn remove(&self, root: &Path, params: &EventParams) -> io::Result<bool> {
        let Some(locator) = params.get(DISK_PATH_PARAM) else {
            return Ok(false);
        };
        match fs::remove_dir_all(locate(root, locator)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn after_sync(&self) {
        self.syncs_since_maintenance.fetch_add(1, Ordering::SeqCst);
    }

    fn needs_maintenance(&self) -> bool {
        self.syncs_since_maintenance() >= self.maintenance_interval
    }

    fn maintenance(&self, root: &Path, resource: &Resource) -> io::Result<usize> {
        let path = locate(root, &resource.locator)?;
        let pruned = if path.is_dir() { prune_empty_dirs(&path)? } else { 0 };
        self.syncs_since_maintenance.store(0, Ordering::SeqCst);
        tracing::info!(kind = %self.kind, locator = %resource.locator, pruned, "repository maintenance");
        Ok(pruned)
    }
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()))
}

fn write_atomically(target: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(target);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, target)
}

fn replace_tree(target: &Path, files: &[RepositoryEntry]) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = temp_sibling(target);
    fs::create_dir_all(&staging)?;
    for entry in files {
        let path = locate(&staging, &entry.path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &entry.content)?;
    }

    match fs::remove_dir_all(target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::rename(&staging, target)
}

/// Removes empty directories below `dir`, returning how many were removed.
fn prune_empty_dirs(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let path = entry.path();
            removed += prune_empty_dirs(&path)?;
            if fs::read_dir(&path)?.next().is_none() {
                fs::remove_dir(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}
