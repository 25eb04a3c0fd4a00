//! Boundary to the primary site's content.
//!
//! The engine never moves bytes across the network itself. A
//! [`PrimaryClient`] fetches one resource's content per call; how it
//! reaches the primary is up to the implementation.

use crate::auth::{RequestSigner, TransferToken};
use crate::error::TransferError;
use georep_core::{Clock, RecordId};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// A request for one resource's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Resource kind, e.g. `upload`.
    pub kind: String,
    /// Record on the primary.
    pub model_record_id: RecordId,
    /// Storage path or repository disk path on the primary.
    pub locator: String,
    /// Authorization.
    pub token: TransferToken,
}

/// One file of a repository snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    /// File content.
    pub content: Vec<u8>,
}

/// Fetches resource content from the primary.
pub trait PrimaryClient: Send + Sync {
    /// Fetches a blob's bytes.
    fn fetch_blob(&self, request: &TransferRequest) -> Result<Vec<u8>, TransferError>;

    /// Fetches every file of a repository.
    fn fetch_repository(&self, request: &TransferRequest) -> Result<Vec<RepositoryEntry>, TransferError>;
}

/// A primary whose content lives in a local directory.
///
/// Used when both sites share a filesystem, and by tests. Requests are
/// authorized exactly as a remote primary would authorize them.
#[derive(Debug)]
pub struct LocalPrimary {
    root: PathBuf,
    signer: RequestSigner,
    clock: Arc<dyn Clock>,
}

impl LocalPrimary {
    /// Serves content under `root`.
    pub fn new(root: impl Into<PathBuf>, signer: RequestSigner, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            signer,
            clock,
        }
    }

    fn authorize(&self, request: &TransferRequest) -> Result<PathBuf, TransferError> {
        self.signer
            .validate(&request.token, request.model_record_id, self.clock.now())?;
        resolve(&self.root, &request.locator)
    }
}

impl PrimaryClient for LocalPrimary {
    fn fetch_blob(&self, request: &TransferRequest) -> Result<Vec<u8>, TransferError> {
        let path = self.authorize(request)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(TransferError::MissingOnPrimary(request.locator.clone()))
            }
            Err(e) => Err(TransferError::Remote(format!("{}: {e}", request.locator))),
        }
    }

    fn fetch_repository(&self, request: &TransferRequest) -> Result<Vec<RepositoryEntry>, TransferError> {
        let path = self.authorize(request)?;
        if !path.is_dir() {
            return Err(TransferError::MissingOnPrimary(request.locator.clone()));
        }
        let mut files = Vec::new();
        collect_files(&path, &path, &mut files)
            .map_err(|e| TransferError::Remote(format!("{}: {e}", request.locator)))?;
        Ok(files)
    }
}

/// Joins a relative locator onto `root`, rejecting paths that escape it.
///
/// # Errors
///
/// Returns [`TransferError::Remote`] for absolute locators and locators
/// containing `..`.
pub fn resolve(root: &Path, locator: &str) -> Result<PathBuf, TransferError> {
    let relative = Path::new(locator);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if locator.is_empty() || escapes {
        return Err(TransferError::Remote(format!("invalid locator: {locator}")));
    }
    Ok(root.join(relative))
}

/// Lists every file under `dir` with its content, sorted by path.
pub(crate) fn collect_files(
    base: &Path,
    dir: &Path,
    out: &mut Vec<RepositoryEntry>,
) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(base, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(base)
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(RepositoryEntry {
                path: name,
                content: fs::read(&path)?,
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(())
}
