//! Bulk dictionary synchronization.
//!
//! # Responsibility
//! - Replace a dictionary from a full snapshot in two committed phases.
//!
//! # See also
//! - `repo::sync_lease` for cross-connection exclusivity.

pub mod pipeline;
