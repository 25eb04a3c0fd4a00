//! # georep Storage
//!
//! Table abstraction for the store shared by every replication worker.
//!
//! This crate provides the lowest-level storage abstraction for georep.
//! Tables are **keyed row stores** - they do not interpret the rows they
//! hold beyond their primary key. All replication semantics (states,
//! retry bookkeeping, claim queries) live in `georep_core` and reach the
//! table as predicates, orderings and mutations.
//!
//! ## Design Principles
//!
//! - Every mutation is a single atomic operation on the table: a
//!   conditional update, a filtered update, or a claim
//! - A claim locks the rows it selects and **skips rows already locked** by
//!   a concurrent claimant, so parallel workers never receive overlapping
//!   batches and never block each other indefinitely
//! - No read-modify-write across calls: callers express compare-and-swap
//!   through `update_if`
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Tables
//!
//! - [`InMemoryTable`] - Row-lock simulation for tests and single-process use
//! - [`FileTable`] - Persistent JSON table serialized across processes by an
//!   advisory file lock
//!
//! ## Example
//!
//! ```rust
//! use georep_storage::{InMemoryTable, Row, Selection, Table};
//!
//! #[derive(Clone)]
//! struct Job { id: i64, done: bool }
//!
//! impl Row for Job {
//!     fn key(&self) -> i64 { self.id }
//! }
//!
//! let table = InMemoryTable::new("jobs");
//! table.insert(Job { id: 1, done: false }).unwrap();
//! table.insert(Job { id: 2, done: false }).unwrap();
//!
//! let claimed = table
//!     .claim(Selection::new(&|j: &Job| !j.done, &|a: &Job, b: &Job| a.id.cmp(&b.id), 1), &mut |j| j.done = true)
//!     .unwrap();
//! assert_eq!(claimed, vec![1]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod table;

pub use error::{StorageError, StorageResult};
pub use file::FileTable;
pub use memory::InMemoryTable;
pub use table::{Row, RowKey, Selection, Table};
