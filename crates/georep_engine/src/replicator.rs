//! The replicator for one resource kind on one site.
//!
//! A [`Replicator`] bridges a [`ReplicatorStrategy`] to the state machines
//! in `georep_core`. On the primary it publishes events and verifies the
//! authoritative copies; on a secondary it consumes events, transfers
//! content and verifies its copies against the primary's checksums.

use crate::auth::RequestSigner;
use crate::context::SiteContext;
use crate::error::{ChecksumError, EngineError, EngineResult, TransferError};
use crate::strategy::ReplicatorStrategy;
use crate::transport::{PrimaryClient, TransferRequest};
use georep_core::{
    Checksum, RecordId, RegistryRecord, Resource, SyncRegistry, SyncState,
    TableVerificationStore, VerificationOutcome, VerificationState, VerificationStateRow,
    VerificationStore, VerificationTracker,
};
use georep_protocol::{EventType, ReplicationEvent};
use georep_storage::Table;
use std::sync::Arc;

/// Where the primary keeps a kind's verification columns.
#[derive(Clone)]
pub enum VerificationStorage {
    /// On the resource rows themselves.
    CoLocated,
    /// In a separate table keyed by resource id.
    Separate(Arc<dyn Table<VerificationStateRow>>),
}

/// The primary's tables for one kind, as seen by every site.
#[derive(Clone)]
pub struct ResourceTables {
    /// Resource rows.
    pub resources: Arc<dyn Table<Resource>>,
    /// Verification column storage.
    pub verification: VerificationStorage,
}

impl ResourceTables {
    /// Tables with verification columns on the resource rows.
    pub fn co_located(resources: Arc<dyn Table<Resource>>) -> Self {
        Self {
            resources,
            verification: VerificationStorage::CoLocated,
        }
    }

    /// Tables with a separate verification table.
    pub fn separate(
        resources: Arc<dyn Table<Resource>>,
        states: Arc<dyn Table<VerificationStateRow>>,
    ) -> Self {
        Self {
            resources,
            verification: VerificationStorage::Separate(states),
        }
    }
}

struct SecondaryParts {
    registry: SyncRegistry,
    verification: TableVerificationStore<RegistryRecord>,
    client: Arc<dyn PrimaryClient>,
    signer: RequestSigner,
}

/// Replication behavior for one resource kind on one site.
pub struct Replicator {
    pub(crate) strategy: Arc<dyn ReplicatorStrategy>,
    pub(crate) context: Arc<SiteContext>,
    pub(crate) tables: ResourceTables,
    primary_verification: Arc<dyn VerificationStore>,
    secondary: Option<SecondaryParts>,
}

impl Replicator {
    /// Creates the primary's replicator.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WrongRole`] if `context` is not a primary.
    pub fn primary(
        strategy: Arc<dyn ReplicatorStrategy>,
        context: Arc<SiteContext>,
        tables: ResourceTables,
    ) -> EngineResult<Self> {
        if !context.is_primary() {
            return Err(EngineError::WrongRole {
                operation: "primary replicator",
                role: context.role().to_string(),
            });
        }
        let primary_verification = primary_store(&context, &tables);
        Ok(Self {
            strategy,
            context,
            tables,
            primary_verification,
            secondary: None,
        })
    }

    /// Creates a secondary's replicator.
    ///
    /// `tables` is the secondary's read view of the primary's tables;
    /// `registry` is the secondary's own registry table for the kind.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WrongRole`] if `context` is a primary.
    pub fn secondary(
        strategy: Arc<dyn ReplicatorStrategy>,
        context: Arc<SiteContext>,
        tables: ResourceTables,
        registry: Arc<dyn Table<RegistryRecord>>,
        client: Arc<dyn PrimaryClient>,
    ) -> EngineResult<Self> {
        if context.is_primary() {
            return Err(EngineError::WrongRole {
                operation: "secondary replicator",
                role: context.role().to_string(),
            });
        }
        let primary_verification = primary_store(&context, &tables);
        let clock = Arc::clone(context.clock());
        let retry = context.config().retry.clone();
        let secondary = SecondaryParts {
            registry: SyncRegistry::new(Arc::clone(&registry), Arc::clone(&clock), retry.clone()),
            verification: TableVerificationStore::new(registry, clock, retry),
            client,
            signer: RequestSigner::new(context.settings().secret.clone().into_bytes()),
        };
        Ok(Self {
            strategy,
            context,
            tables,
            primary_verification,
            secondary: Some(secondary),
        })
    }

    /// Returns the resource kind.
    pub fn kind(&self) -> &str {
        self.strategy.kind()
    }

    /// Returns the strategy.
    pub fn strategy(&self) -> &Arc<dyn ReplicatorStrategy> {
        &self.strategy
    }

    /// Returns the site context.
    pub fn context(&self) -> &Arc<SiteContext> {
        &self.context
    }

    /// Returns the resource table.
    pub fn resources(&self) -> &Arc<dyn Table<Resource>> {
        &self.tables.resources
    }

    /// Returns the primary's verification store for this kind.
    pub fn primary_verification(&self) -> &dyn VerificationStore {
        self.primary_verification.as_ref()
    }

    /// Returns the verification store this site writes to: the primary's
    /// on the primary, the registry on a secondary.
    pub fn verification_store(&self) -> &dyn VerificationStore {
        match &self.secondary {
            Some(parts) => &parts.verification,
            None => self.primary_verification.as_ref(),
        }
    }

    fn secondary_parts(&self, operation: &'static str) -> EngineResult<&SecondaryParts> {
        self.secondary.as_ref().ok_or_else(|| EngineError::WrongRole {
            operation,
            role: self.context.role().to_string(),
        })
    }

    fn require_primary(&self, operation: &'static str) -> EngineResult<()> {
        if self.context.is_primary() {
            Ok(())
        } else {
            Err(EngineError::WrongRole {
                operation,
                role: self.context.role().to_string(),
            })
        }
    }

    /// Returns the secondary's sync registry.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WrongRole`] on the primary.
    pub fn registry(&self) -> EngineResult<&SyncRegistry> {
        Ok(&self.secondary_parts("registry")?.registry)
    }

    /// Returns the primary's checksum if its verification succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn primary_checksum(&self, id: RecordId) -> EngineResult<Option<Checksum>> {
        Ok(self
            .primary_verification
            .fields(id)?
            .filter(|f| f.state == VerificationState::VerificationSucceeded)
            .and_then(|f| f.checksum))
    }

    /// Returns true if `checksum` equals the primary's verified checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn matches_checksum(&self, id: RecordId, checksum: Checksum) -> EngineResult<bool> {
        Ok(self.primary_checksum(id)? == Some(checksum))
    }

    /// Returns false for immutable kinds that already have a checksum,
    /// whose content cannot have changed since it was computed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn should_verify_after_save(&self, id: RecordId) -> EngineResult<bool> {
        if !self.strategy.immutable() {
            return Ok(true);
        }
        let checksummed = self
            .primary_verification
            .fields(id)?
            .is_some_and(|f| f.checksum.is_some());
        Ok(!checksummed)
    }

    /// Returns true if the site's copy of `id` can be verified now.
    ///
    /// On the primary the content must be present. On a secondary the
    /// copy must be synced and the primary's checksum known.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn ready_to_verify(&self, id: RecordId) -> EngineResult<bool> {
        match &self.secondary {
            None => Ok(self
                .tables
                .resources
                .get(id)?
                .is_some_and(|r| self.strategy.checksummable(self.context.storage_root(), &r))),
            Some(parts) => {
                let synced = parts
                    .registry
                    .get(id)?
                    .is_some_and(|row| row.state == SyncState::Synced);
                Ok(synced && self.primary_checksum(id)?.is_some())
            }
        }
    }

    // Primary-side model callbacks.

    /// Records a new resource on the primary and announces it.
    ///
    /// If the `created` event cannot be published the row is removed
    /// again, so the call can be retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the publisher fails, or if this is
    /// not the primary.
    pub fn create_resource(&self, resource: Resource) -> EngineResult<bool> {
        self.require_primary("create_resource")?;
        let id = resource.id;
        if !self.tables.resources.insert(resource)? {
            return Ok(false);
        }
        if let Err(error) = self.handle_after_create(id) {
            self.tables.resources.delete(id)?;
            if let VerificationStorage::Separate(states) = &self.tables.verification {
                states.delete(id)?;
            }
            return Err(error);
        }
        Ok(true)
    }

    /// Marks a resource's content as changed and announces it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the publisher fails, or if this is
    /// not the primary.
    pub fn update_resource(&self, id: RecordId) -> EngineResult<bool> {
        self.require_primary("update_resource")?;
        let now = self.context.clock().now();
        if !self
            .tables
            .resources
            .update_if(id, &|_| true, &mut |r| r.updated_at = now)?
        {
            return Ok(false);
        }
        self.handle_after_update(id)?;
        Ok(true)
    }

    /// Deletes a resource on the primary and announces it.
    ///
    /// If the `deleted` event cannot be published the row is restored:
    /// secondaries would otherwise keep their copies forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the publisher fails, or if this is
    /// not the primary.
    pub fn destroy_resource(&self, id: RecordId) -> EngineResult<bool> {
        self.require_primary("destroy_resource")?;
        let Some(resource) = self.tables.resources.get(id)? else {
            return Ok(false);
        };
        self.tables.resources.delete(id)?;
        if let Err(error) = self.handle_after_destroy(&resource) {
            self.tables.resources.insert(resource)?;
            return Err(error);
        }
        Ok(true)
    }

    /// Publishes `created` for a new resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the publisher fails.
    pub fn handle_after_create(&self, id: RecordId) -> EngineResult<()> {
        if let VerificationStorage::Separate(states) = &self.tables.verification {
            states.insert(VerificationStateRow::new(id))?;
        }
        self.context.publish(ReplicationEvent::created(self.kind(), id))?;
        Ok(())
    }

    /// Publishes `updated` and, where needed, queues re-verification.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the publisher fails.
    pub fn handle_after_update(&self, id: RecordId) -> EngineResult<()> {
        if self.should_verify_after_save(id)? {
            self.primary_verification.reset(id)?;
        }
        self.context.publish(ReplicationEvent::updated(self.kind(), id))?;
        Ok(())
    }

    /// Publishes `deleted` with what secondaries need to remove their copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the publisher fails.
    pub fn handle_after_destroy(&self, resource: &Resource) -> EngineResult<()> {
        let params = self.strategy.deleted_params(resource);
        self.context
            .publish(ReplicationEvent::deleted(self.kind(), resource.id, params))?;
        if let VerificationStorage::Separate(states) = &self.tables.verification {
            states.delete(resource.id)?;
        }
        Ok(())
    }

    // Secondary-side event consumption.

    fn in_scope(&self, id: RecordId) -> EngineResult<bool> {
        let selective = &self.context.settings().selective_sync;
        Ok(self
            .tables
            .resources
            .get(id)?
            .is_some_and(|r| selective.includes(r.scope.as_deref())))
    }

    /// Applies an event from the primary to this secondary.
    ///
    /// `created` and `updated` move the registry row to `pending` (creating
    /// it if needed) for in-scope resources; the transfer happens in the
    /// next sync batch. `deleted` removes the local copy and the row
    /// regardless of scope. `checksum_succeeded` queues verification of a
    /// synced copy against the new checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or local removal fails, or if this is
    /// the primary.
    pub fn consume(&self, event: &ReplicationEvent) -> EngineResult<()> {
        let parts = self.secondary_parts("consume")?;
        let id = event.model_record_id;

        match event.event_type {
            EventType::Created | EventType::Updated => {
                if !self.in_scope(id)? {
                    tracing::debug!(kind = self.kind(), model_record_id = id, "skipping out-of-scope event");
                    return Ok(());
                }
                parts.registry.find_or_initialize(id)?;
                if event.event_type == EventType::Updated {
                    if self.strategy.immutable() {
                        parts.registry.resync(id)?;
                    } else {
                        parts.registry.reschedule_on_update_event(id)?;
                    }
                }
            }
            EventType::Deleted => {
                let removed = self.strategy.remove(self.context.storage_root(), &event.params)?;
                parts.registry.delete(id)?;
                tracing::info!(kind = self.kind(), model_record_id = id, removed, "deleted local copy");
            }
            EventType::ChecksumSucceeded => {
                let synced = parts
                    .registry
                    .get(id)?
                    .is_some_and(|row| row.state == SyncState::Synced);
                if synced {
                    parts.verification.reset(id)?;
                }
            }
        }
        Ok(())
    }

    // Work on one record.

    /// Transfers `id` from the primary and records the result.
    ///
    /// Returns true if the row ended `synced`. Transfer failures are
    /// recorded on the row and return false.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails, or if this is the primary.
    pub fn sync(&self, id: RecordId) -> EngineResult<bool> {
        let parts = self.secondary_parts("sync")?;
        let row = parts.registry.find_or_initialize(id)?;
        if row.state != SyncState::Started {
            parts.registry.start_sync(id)?;
        }

        let result = match self.tables.resources.get(id)? {
            Some(resource) => self.transfer(parts, &resource).map(|()| resource),
            None => Err(TransferError::MissingOnPrimary(format!("{} {id}", self.kind()))),
        };

        match result {
            Ok(resource) => {
                let ready = self.primary_checksum(id)?.is_some();
                let synced = parts.registry.mark_synced(id, ready)?;
                if synced {
                    self.strategy.after_sync();
                    if self.strategy.needs_maintenance() {
                        // The row is already synced; a failed maintenance
                        // stays due and runs again after the next sync.
                        if let Err(error) = self
                            .strategy
                            .maintenance(self.context.storage_root(), &resource)
                        {
                            tracing::warn!(
                                kind = self.kind(),
                                model_record_id = id,
                                error = %error,
                                "maintenance failed"
                            );
                        }
                    }
                }
                Ok(synced)
            }
            Err(error) => {
                parts.registry.mark_failed(
                    id,
                    "Sync failed",
                    Some(&error),
                    error.is_missing_on_primary(),
                )?;
                Ok(false)
            }
        }
    }

    fn transfer(&self, parts: &SecondaryParts, resource: &Resource) -> Result<(), TransferError> {
        let token = parts.signer.sign(
            &self.context.settings().name,
            resource.id,
            self.context.clock().now(),
        )?;
        let request = TransferRequest {
            kind: self.kind().to_string(),
            model_record_id: resource.id,
            locator: resource.locator.clone(),
            token,
        };
        self.strategy
            .transfer(parts.client.as_ref(), &request, self.context.storage_root())
    }

    /// Computes and records the checksum of this site's copy of `id`.
    ///
    /// On the primary a successful verification publishes
    /// `checksum_succeeded`. On a secondary the checksum is compared with
    /// the primary's, and a repository missing locally matches a primary
    /// checksum of all zeros.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub fn verify(&self, id: RecordId) -> EngineResult<VerificationOutcome> {
        let root = self.context.storage_root();
        let resource = self.tables.resources.get(id)?;

        let outcome = match &self.secondary {
            None => {
                let Some(resource) = resource else {
                    return Ok(VerificationOutcome::Missing);
                };
                let ready = self.strategy.checksummable(root, &resource);
                let tracker = VerificationTracker::new(self.primary_verification.as_ref());
                let outcome = tracker.track_checksum_attempt(id, ready, None, || {
                    self.strategy.calculate_checksum(root, &resource)
                })?;
                if outcome.succeeded() {
                    // The checksum is recorded; the next reverification
                    // announces it again.
                    if let Err(error) = self
                        .context
                        .publish(ReplicationEvent::checksum_succeeded(self.kind(), id))
                    {
                        tracing::error!(
                            kind = self.kind(),
                            model_record_id = id,
                            error = %error,
                            "failed to publish checksum"
                        );
                    }
                }
                outcome
            }
            Some(parts) => {
                let primary = self.primary_checksum(id)?;
                let ready = self.ready_to_verify(id)?;
                let tracker = VerificationTracker::new(&parts.verification);
                tracker.track_checksum_attempt(id, ready, primary, || {
                    let resource = resource
                        .as_ref()
                        .ok_or_else(|| ChecksumError::NotChecksummable(format!("{} {id}", self.kind())))?;
                    match self.strategy.calculate_checksum(root, resource) {
                        Err(ChecksumError::NoRepository(_)) if primary == Some(Checksum::ZERO) => {
                            Ok(Checksum::ZERO)
                        }
                        other => other,
                    }
                })?
            }
        };
        Ok(outcome)
    }
}

fn primary_store(context: &SiteContext, tables: &ResourceTables) -> Arc<dyn VerificationStore> {
    let clock = Arc::clone(context.clock());
    let retry = context.config().retry.clone();
    match &tables.verification {
        VerificationStorage::CoLocated => Arc::new(TableVerificationStore::new(
            Arc::clone(&tables.resources),
            clock,
            retry,
        )),
        VerificationStorage::Separate(states) => {
            Arc::new(TableVerificationStore::new(Arc::clone(states), clock, retry))
        }
    }
}
