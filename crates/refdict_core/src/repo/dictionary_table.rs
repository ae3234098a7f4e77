//! `medical_care_forms` table mapping for `DictionaryEntry`.
//!
//! Validity dates are stored as ISO `YYYY-MM-DD` text so the sentinel bounds
//! (`0001-01-01`, `9999-12-31`) stay readable in the database.

use crate::model::dictionary::DictionaryEntry;
use crate::model::record::RecordMeta;
use crate::repo::generic_repo::{RepoError, RepoResult, SqliteRepository, TableRecord};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::Row;

const DATE_COLUMN_FORMAT: &str = "%Y-%m-%d";

/// Repository over the medical care form dictionary.
pub type DictionaryRepository<'conn> = SqliteRepository<'conn, DictionaryEntry>;

impl TableRecord for DictionaryEntry {
    const TABLE: &'static str = "medical_care_forms";
    const COLUMNS: &'static [&'static str] = &["code", "name", "begin_date", "end_date"];

    fn column_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(i64::from(self.code)),
            Value::Text(self.name.clone()),
            Value::Text(self.begin_date.format(DATE_COLUMN_FORMAT).to_string()),
            Value::Text(self.end_date.format(DATE_COLUMN_FORMAT).to_string()),
        ]
    }

    fn from_row(meta: RecordMeta, row: &Row<'_>) -> RepoResult<Self> {
        Ok(Self {
            meta,
            code: row.get("code")?,
            name: row.get("name")?,
            begin_date: parse_date_column(row, "begin_date")?,
            end_date: parse_date_column(row, "end_date")?,
        })
    }
}

fn parse_date_column(row: &Row<'_>, column: &'static str) -> RepoResult<NaiveDate> {
    let text: String = row.get(column)?;
    NaiveDate::parse_from_str(&text, DATE_COLUMN_FORMAT).map_err(|_| {
        RepoError::InvalidData(format!(
            "invalid date `{text}` in {}.{column}",
            DictionaryEntry::TABLE
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::DATE_COLUMN_FORMAT;
    use crate::model::dictionary::{EARLIEST_DATE, OPEN_ENDED};
    use chrono::NaiveDate;

    #[test]
    fn sentinel_dates_survive_text_encoding() {
        for date in [EARLIEST_DATE, OPEN_ENDED] {
            let text = date.format(DATE_COLUMN_FORMAT).to_string();
            assert_eq!(NaiveDate::parse_from_str(&text, DATE_COLUMN_FORMAT).unwrap(), date);
        }
        assert_eq!(EARLIEST_DATE.format(DATE_COLUMN_FORMAT).to_string(), "0001-01-01");
    }
}
