//! Site identity and settings handed to every replicator.

use crate::error::{EngineError, EngineResult};
use georep_core::{Clock, ReplicationConfig};
use georep_protocol::{EventPublisher, ProtocolResult, ReplicationEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Whether a site owns resources or replicates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteRole {
    /// Holds the authoritative copies and publishes events.
    Primary,
    /// Replicates from the primary and verifies its copies.
    Secondary,
}

impl fmt::Display for SiteRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteRole::Primary => f.write_str("primary"),
            SiteRole::Secondary => f.write_str("secondary"),
        }
    }
}

/// Which resources a secondary replicates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectiveSync {
    /// Every resource.
    #[default]
    All,
    /// Only resources whose scope is listed.
    Scopes(BTreeSet<String>),
}

impl SelectiveSync {
    /// Restricts replication to `scopes`.
    pub fn scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SelectiveSync::Scopes(scopes.into_iter().map(Into::into).collect())
    }

    /// Returns true if a resource in `scope` is replicated.
    pub fn includes(&self, scope: Option<&str>) -> bool {
        match self {
            SelectiveSync::All => true,
            SelectiveSync::Scopes(scopes) => scope.is_some_and(|s| scopes.contains(s)),
        }
    }
}

/// Serializable settings of one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSettings {
    /// Site name, used when signing transfer requests.
    pub name: String,
    /// Site role.
    pub role: SiteRole,
    /// Directory holding this site's copies of resource content.
    pub storage_root: PathBuf,
    /// Shared secret for transfer request signing.
    #[serde(default)]
    pub secret: String,
    /// Selective-sync scope of a secondary.
    #[serde(default)]
    pub selective_sync: SelectiveSync,
    /// Replication settings.
    #[serde(default)]
    pub config: ReplicationConfig,
}

impl SiteSettings {
    /// Creates settings with the default configuration.
    pub fn new(name: impl Into<String>, role: SiteRole, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            role,
            storage_root: storage_root.into(),
            secret: String::new(),
            selective_sync: SelectiveSync::All,
            config: ReplicationConfig::default(),
        }
    }

    /// Sets the signing secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Sets the selective-sync scope.
    pub fn with_selective_sync(mut self, selective_sync: SelectiveSync) -> Self {
        self.selective_sync = selective_sync;
        self
    }

    /// Sets the replication configuration.
    pub fn with_config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads settings from a JSON file and validates them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// configuration is invalid.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let settings: SiteSettings = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        settings.config.validate()?;
        Ok(settings)
    }

    /// Writes settings to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        fs::write(path, text).map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }
}

/// Everything a replicator needs to know about the site it runs on.
pub struct SiteContext {
    settings: SiteSettings,
    clock: Arc<dyn Clock>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl SiteContext {
    /// Creates a context.
    pub fn new(settings: SiteSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            publisher: None,
        }
    }

    /// Sets the publisher that receives this primary's events.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Returns the settings.
    pub fn settings(&self) -> &SiteSettings {
        &self.settings
    }

    /// Returns the replication configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.settings.config
    }

    /// Returns the site role.
    pub fn role(&self) -> SiteRole {
        self.settings.role
    }

    /// Returns true on the primary.
    pub fn is_primary(&self) -> bool {
        self.settings.role == SiteRole::Primary
    }

    /// Returns the site's storage root.
    pub fn storage_root(&self) -> &Path {
        &self.settings.storage_root
    }

    /// Returns the clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Publishes an event. Returns the sequence number, or `None` when no
    /// publisher is attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the publisher failed to record the event.
    pub fn publish(&self, event: ReplicationEvent) -> ProtocolResult<Option<u64>> {
        self.publisher.as_ref().map(|p| p.publish(event)).transpose()
    }
}

impl fmt::Debug for SiteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteContext")
            .field("name", &self.settings.name)
            .field("role", &self.settings.role)
            .field("storage_root", &self.settings.storage_root)
            .field("publisher", &self.publisher.is_some())
            .finish()
    }
}
