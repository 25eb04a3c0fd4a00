//! # georep Engine
//!
//! Replication engine for georep.
//!
//! This crate provides:
//! - Replicator strategies for blob-like and repository-like resources
//! - The `Replicator`, bridging a strategy to the sync and verification
//!   state machines on a primary or a secondary site
//! - The primary transport boundary and HMAC request signing
//! - Event dispatch from the primary's event log to a secondary
//! - Batch workers and status reporting
//!
//! ## Architecture
//!
//! ```text
//! primary                               secondary
//! -------                               ---------
//! create/update/destroy                 EventDispatcher::drain
//!   -> Replicator::handle_after_*         -> Replicator::consume (registry -> pending)
//!   -> EventLog::publish  ------------>  sync_batch
//! verify_batch                            -> claim -> transfer -> mark_synced/failed
//!   -> checksum_succeeded ------------>  verify_batch
//!                                         -> claim -> checksum -> compare with primary
//! ```
//!
//! Workers never talk to each other. Every entry point claims a bounded
//! batch from the shared tables, works it, and returns.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod context;
mod dispatch;
mod error;
mod replicator;
mod status;
mod strategy;
mod transport;
mod worker;

pub use auth::{RequestSigner, TransferToken};
pub use context::{SelectiveSync, SiteContext, SiteRole, SiteSettings};
pub use dispatch::EventDispatcher;
pub use error::{ChecksumError, EngineError, EngineResult, TransferError};
pub use replicator::{Replicator, ResourceTables, VerificationStorage};
pub use status::{RegistryStatus, ReplicationStatus, VerificationStatus};
pub use strategy::{
    BlobStrategy, ReplicatorStrategy, RepositoryStrategy, DISK_PATH_PARAM, PATH_PARAM,
};
pub use transport::{resolve, LocalPrimary, PrimaryClient, RepositoryEntry, TransferRequest};
pub use worker::BatchReport;
