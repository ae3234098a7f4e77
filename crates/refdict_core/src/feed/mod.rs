//! External snapshot feeds.
//!
//! # Responsibility
//! - Describe feed element names (`layout`).
//! - Turn snapshot bytes into candidate dictionary entries (`parser`).
//!
//! # Invariants
//! - Parsing is pure: no storage access, no partial results on failure.

pub mod layout;
pub mod parser;
