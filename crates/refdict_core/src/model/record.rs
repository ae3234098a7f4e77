//! Metadata shared by every dictionary-shaped record.
//!
//! # Responsibility
//! - Carry identity, audit timestamps and soft-delete state for any entity.
//! - Expose the `Record` capability that generic persistence is written against.
//!
//! # Invariants
//! - `id` never changes once a record has been assigned one.
//! - A record moves `Live -> Tombstoned` at most once; `deleted_at` is never
//!   re-stamped.
//! - `edited_at >= created_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Record identity. `UNASSIGNED_ID` until storage or an import supplies one.
pub type RecordId = i64;

/// Acting user recorded on soft delete.
pub type UserId = i64;

/// Id value meaning "let storage assign the next key".
pub const UNASSIGNED_ID: RecordId = 0;

/// Unattributed deletions, e.g. tombstones written by a bulk import.
pub const SYSTEM_USER_ID: UserId = 0;

/// Soft-delete state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Live,
    Tombstoned {
        deleted_at: DateTime<Utc>,
        deleted_by_user_id: Option<UserId>,
    },
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    AlreadyTombstoned {
        id: RecordId,
        deleted_at: DateTime<Utc>,
    },
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyTombstoned { id, deleted_at } => {
                write!(f, "record {id} was already deleted at {deleted_at}")
            }
        }
    }
}

impl Error for LifecycleError {}

/// Identity, audit and lifecycle columns common to all dictionaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    id: RecordId,
    created_at: DateTime<Utc>,
    edited_at: DateTime<Utc>,
    lifecycle: Lifecycle,
}

impl RecordMeta {
    /// Fresh live metadata. Pass `UNASSIGNED_ID` to let storage pick the key.
    pub fn new(id: RecordId) -> Self {
        let now = utc_now();
        Self {
            id,
            created_at: now,
            edited_at: now,
            lifecycle: Lifecycle::Live,
        }
    }

    /// Rebuilds metadata from persisted columns.
    ///
    /// `edited_at` is clamped to `created_at` so a clock step backwards on the
    /// writer cannot produce an edit that predates creation.
    pub fn restore(
        id: RecordId,
        created_at: DateTime<Utc>,
        edited_at: DateTime<Utc>,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            id,
            created_at,
            edited_at: edited_at.max(created_at),
            lifecycle,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Sets the id of a record that has none yet.
    ///
    /// Returns false and leaves the id alone when one is already assigned.
    pub fn assign_id(&mut self, id: RecordId) -> bool {
        if self.id != UNASSIGNED_ID {
            return false;
        }
        self.id = id;
        true
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn edited_at(&self) -> DateTime<Utc> {
        self.edited_at
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Tombstoned { .. })
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self.lifecycle {
            Lifecycle::Live => None,
            Lifecycle::Tombstoned { deleted_at, .. } => Some(deleted_at),
        }
    }

    pub fn deleted_by_user_id(&self) -> Option<UserId> {
        match self.lifecycle {
            Lifecycle::Live => None,
            Lifecycle::Tombstoned {
                deleted_by_user_id, ..
            } => deleted_by_user_id,
        }
    }

    /// Refreshes `edited_at` after a field mutation.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.edited_at = now.max(self.created_at);
    }

    /// Transitions `Live -> Tombstoned`, stamping `deleted_at` and `edited_at`.
    ///
    /// # Errors
    /// - `LifecycleError::AlreadyTombstoned` on a second attempt; the first
    ///   deletion stamp is left untouched.
    pub fn tombstone(
        &mut self,
        acting_user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        if let Lifecycle::Tombstoned { deleted_at, .. } = self.lifecycle {
            return Err(LifecycleError::AlreadyTombstoned {
                id: self.id,
                deleted_at,
            });
        }

        self.touch(now);
        self.lifecycle = Lifecycle::Tombstoned {
            deleted_at: self.edited_at,
            deleted_by_user_id: Some(acting_user_id),
        };
        Ok(())
    }
}

/// Capability every dictionary-shaped entity exposes to generic persistence.
pub trait Record: Clone {
    fn meta(&self) -> &RecordMeta;
    fn meta_mut(&mut self) -> &mut RecordMeta;

    fn id(&self) -> RecordId {
        self.meta().id()
    }

    fn is_deleted(&self) -> bool {
        self.meta().is_deleted()
    }
}

/// Current UTC time truncated to the millisecond precision used in storage.
pub fn utc_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
