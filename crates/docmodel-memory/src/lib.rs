//! In-memory driver for DocModel.
//!
//! This crate provides [`MemoryStore`], a `DocumentStore` implementation that
//! keeps collections in process memory. It is the reference driver used by
//! the DocModel test suites and is handy for prototyping.
//!
//! # Features
//!
//! - Shared handles: clones see the same collections
//! - 24-hex-digit identities for records inserted without `_id`
//! - Field projections, dotted paths, `$in`/`$regex`/range operators
//! - Operation log for asserting write order in tests
//!
//! # Example
//!
//! ```rust,ignore
//! use docmodel_memory::MemoryStore;
//! use docmodel_core::{DocumentStore, store::match_all};
//!
//! let store = MemoryStore::new();
//! let id = store.insert("books", record)?;
//! let all = store.find("books", &match_all(), None)?;
//! ```

pub mod matcher;
pub mod store;

pub use matcher::matches;
pub use store::{MemoryConfig, MemoryStore, Operation, OperationKind};
