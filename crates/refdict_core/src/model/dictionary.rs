//! Medical care form dictionary entry.
//!
//! # Invariants
//! - `name` is non-empty once validated.
//! - `begin_date <= end_date` is expected; only `validate()` reports it,
//!   bulk imports store whatever the feed carries.
//! - `end_date == OPEN_ENDED` means the entry has no expiry.

use crate::model::record::{Record, RecordId, RecordMeta, UNASSIGNED_ID};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Placeholder stored when a feed entry has no usable name.
pub const UNKNOWN_NAME: &str = "unknown";

/// Earliest representable validity date; used for a missing begin date.
pub const EARLIEST_DATE: NaiveDate = match NaiveDate::from_ymd_opt(1, 1, 1) {
    Some(date) => date,
    None => panic!("0001-01-01 is a valid calendar date"),
};

/// Latest representable validity date; encodes open-ended validity.
pub const OPEN_ENDED: NaiveDate = match NaiveDate::from_ymd_opt(9999, 12, 31) {
    Some(date) => date,
    None => panic!("9999-12-31 is a valid calendar date"),
};

/// Validation failure for single-entry writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValidationError {
    EmptyName,
    InvertedValidity {
        begin_date: NaiveDate,
        end_date: NaiveDate,
    },
}

impl Display for EntryValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => f.write_str("name must not be empty"),
            Self::InvertedValidity {
                begin_date,
                end_date,
            } => write!(
                f,
                "begin date {begin_date} is after end date {end_date}"
            ),
        }
    }
}

impl Error for EntryValidationError {}

/// One row of the medical care form lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Business key from the external feed; may repeat across imports.
    pub code: i32,
    pub name: String,
    pub begin_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl DictionaryEntry {
    /// New entry whose id storage will assign on insert.
    pub fn new(code: i32, name: impl Into<String>, begin_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self::with_id(UNASSIGNED_ID, code, name, begin_date, end_date)
    }

    /// New entry carrying an externally supplied id (bulk import path).
    pub fn with_id(
        id: RecordId,
        code: i32,
        name: impl Into<String>,
        begin_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            meta: RecordMeta::new(id),
            code,
            name: name.into(),
            begin_date,
            end_date,
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end_date == OPEN_ENDED
    }

    /// Whether `date` falls inside the validity interval (inclusive).
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.begin_date <= date && date <= self.end_date
    }

    /// Checks the fields a caller controls on create/update.
    pub fn validate(&self) -> Result<(), EntryValidationError> {
        if self.name.trim().is_empty() {
            return Err(EntryValidationError::EmptyName);
        }
        if self.begin_date > self.end_date {
            return Err(EntryValidationError::InvertedValidity {
                begin_date: self.begin_date,
                end_date: self.end_date,
            });
        }
        Ok(())
    }

    /// True when code, name and validity match, ignoring identity and audit.
    pub fn same_content(&self, other: &Self) -> bool {
        self.code == other.code
            && self.name == other.name
            && self.begin_date == other.begin_date
            && self.end_date == other.end_date
    }
}

impl Record for DictionaryEntry {
    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
}
