//! Persistence layer for reference dictionaries.
//!
//! # Responsibility
//! - Generic soft-delete-aware CRUD with a staged unit of work.
//! - Per-dictionary table mappings.
//! - Cross-connection exclusivity for bulk imports.
//!
//! # Invariants
//! - SQL never leaks out of this module.
//! - Missing rows are reported as `None` on reads and `NotFound` on writes.

pub mod dictionary_table;
pub mod generic_repo;
pub mod sync_lease;
