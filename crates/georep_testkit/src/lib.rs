//! # georep Testkit
//!
//! Test utilities for georep.
//!
//! This crate provides:
//! - A two-site fixture: a primary and a secondary sharing in-memory
//!   tables, with temporary storage roots and a mock clock
//! - Property-based test generators using proptest
//! - A convergence harness for cross-crate scenarios
//! - Concurrent claim stress tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use georep_testkit::prelude::*;
//!
//! #[test]
//! fn blob_reaches_secondary() {
//!     let sites = TestSites::blob();
//!     sites.create_blob(1, b"hello");
//!     sites.replicate();
//!     assert_eq!(sites.secondary_content("uploads/1.bin"), Some(b"hello".to_vec()));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
