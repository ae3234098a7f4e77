//! Domain model for reference dictionaries.
//!
//! # Responsibility
//! - Define the metadata every dictionary row carries (`record`).
//! - Define concrete dictionary entities (`dictionary`).
//!
//! # Invariants
//! - Deletion is a tombstone state, never a physical removal on normal paths.

pub mod dictionary;
pub mod record;
