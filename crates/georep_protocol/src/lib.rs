//! # georep Protocol
//!
//! The event contract between a primary site and its secondaries.
//!
//! This crate provides:
//! - `ReplicationEvent` with its `EventType` and opaque `EventParams`
//! - CBOR encoding/decoding of events
//! - `EventLog`, an ordered, pollable event feed implementing
//!   `EventPublisher`
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod log;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{EventParams, EventType, ReplicationEvent};
pub use log::{EventLog, EventPublisher, EventRecord};
