//! Generic soft-delete-aware repository with a staged unit of work.
//!
//! # Responsibility
//! - Provide get/add/update/delete/virtual-delete for any `TableRecord`.
//! - Stage writes in memory and commit them as one SQLite transaction.
//!
//! # Invariants
//! - Reads never see staged, uncommitted writes.
//! - `save_changes` is all-or-nothing; the staged queue is drained either way.
//! - At most one live row exists per `id`; tombstoned rows keep their `id`.
//! - Auto-assigned ids never reuse an id present in history.

use crate::db::DbError;
use crate::model::record::{
    utc_now, Lifecycle, LifecycleError, Record, RecordId, RecordMeta, UserId, UNASSIGNED_ID,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Columns every dictionary table shares, in select order.
const META_COLUMNS: [&str; 6] = [
    "id",
    "is_deleted",
    "created_at",
    "edited_at",
    "deleted_at",
    "deleted_by_user_id",
];

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for dictionary persistence.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    /// A staged update or tombstone matched no live row.
    NotFound(RecordId),
    /// Soft delete requested for a record that is already tombstoned.
    AlreadyDeleted(RecordId),
    /// A stored row could not be decoded.
    InvalidData(String),
    MissingRequiredTable(&'static str),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::AlreadyDeleted(id) => write!(f, "record already deleted: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::MissingRequiredTable(table) => write!(f, "missing required table `{table}`"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<LifecycleError> for RepoError {
    fn from(value: LifecycleError) -> Self {
        match value {
            LifecycleError::AlreadyTombstoned { id, .. } => Self::AlreadyDeleted(id),
        }
    }
}

/// Maps an entity onto a dictionary table.
///
/// Implementors describe only their own payload columns; identity, audit and
/// lifecycle columns are handled here once for every dictionary.
pub trait TableRecord: Record + Sized {
    /// Table name. Must be a trusted identifier, it is spliced into SQL.
    const TABLE: &'static str;
    /// Payload columns in the order `column_values` yields them.
    const COLUMNS: &'static [&'static str];

    fn column_values(&self) -> Vec<Value>;

    /// Decodes payload columns; `meta` is already decoded.
    fn from_row(meta: RecordMeta, row: &Row<'_>) -> RepoResult<Self>;
}

/// Outcome of one committed unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Rows inserted, updated or removed.
    pub affected_rows: usize,
    /// Ids of inserted rows, in staging order.
    pub inserted_ids: Vec<RecordId>,
}

/// Persistence contract shared by every dictionary.
pub trait Repository<E: TableRecord> {
    /// Live rows ordered by id.
    fn get_all(&self) -> RepoResult<Vec<E>>;
    /// Row by id regardless of soft-delete state; the live row wins, then the
    /// newest tombstone.
    fn get_by_key(&self, id: RecordId) -> RepoResult<Option<E>>;
    /// Every row including tombstones, ordered by id then insertion.
    fn list_with_deleted(&self) -> RepoResult<Vec<E>>;
    /// Highest id in history including tombstones; `0` for an empty table.
    fn max_id(&self) -> RepoResult<RecordId>;
    /// Stages an insert. `UNASSIGNED_ID` asks storage for the next id.
    fn add(&mut self, entity: E);
    /// Stages a field overwrite of the live row with the entity's id.
    fn update(&mut self, entity: E);
    /// Stages physical removal of every row with the entity's id.
    fn delete(&mut self, entity: &E);
    /// Tombstones the entity and stages the state change.
    fn virtual_delete(&mut self, entity: E, acting_user_id: UserId) -> RepoResult<()>;
    fn pending_changes(&self) -> usize;
    /// Drops staged work without touching storage; returns how much was dropped.
    fn discard_changes(&mut self) -> usize;
    /// Commits staged work atomically.
    fn save_changes(&mut self) -> RepoResult<SaveReport>;
}

#[derive(Debug)]
enum PendingOp<E> {
    Insert(E),
    Update(E),
    Tombstone(E),
    Remove(RecordId),
}

/// SQLite-backed generic repository.
pub struct SqliteRepository<'conn, E: TableRecord> {
    conn: &'conn Connection,
    pending: Vec<PendingOp<E>>,
}

impl<'conn, E: TableRecord> SqliteRepository<'conn, E> {
    /// Builds a repository over a migrated connection.
    ///
    /// # Errors
    /// - `RepoError::MissingRequiredTable` when `E::TABLE` is absent.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        if !table_exists(conn, E::TABLE)? {
            return Err(RepoError::MissingRequiredTable(E::TABLE));
        }
        Ok(Self {
            conn,
            pending: Vec::new(),
        })
    }

    fn select_sql(filter: &str) -> String {
        format!(
            "SELECT {}, {} FROM {} {filter}",
            META_COLUMNS.join(", "),
            E::COLUMNS.join(", "),
            E::TABLE
        )
    }

    fn query_many(&self, filter: &str, params: Vec<Value>) -> RepoResult<Vec<E>> {
        let mut stmt = self.conn.prepare(&Self::select_sql(filter))?;
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(parse_row::<E>(row)?);
        }
        Ok(entities)
    }

    fn commit(&self, ops: &[PendingOp<E>]) -> RepoResult<SaveReport> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut report = SaveReport::default();
        for op in ops {
            self.apply(&tx, op, &mut report)?;
        }
        tx.commit()?;
        Ok(report)
    }

    fn apply(&self, tx: &Transaction<'_>, op: &PendingOp<E>, report: &mut SaveReport) -> RepoResult<()> {
        match op {
            PendingOp::Insert(entity) => {
                let id = match entity.id() {
                    UNASSIGNED_ID => next_id(tx, E::TABLE)?,
                    explicit => explicit,
                };
                insert_row(tx, id, entity)?;
                report.affected_rows += 1;
                report.inserted_ids.push(id);
            }
            PendingOp::Update(entity) => {
                let changed = update_row(tx, entity)?;
                if changed == 0 {
                    return Err(RepoError::NotFound(entity.id()));
                }
                report.affected_rows += changed;
            }
            PendingOp::Tombstone(entity) => {
                let meta = entity.meta();
                let changed = tx.execute(
                    &format!(
                        "UPDATE {}
                         SET
                            is_deleted = 1,
                            deleted_at = ?2,
                            deleted_by_user_id = ?3,
                            edited_at = ?4
                         WHERE id = ?1
                           AND is_deleted = 0;",
                        E::TABLE
                    ),
                    rusqlite::params![
                        meta.id(),
                        meta.deleted_at().map(to_millis),
                        meta.deleted_by_user_id(),
                        to_millis(meta.edited_at()),
                    ],
                )?;
                if changed == 0 {
                    return Err(RepoError::NotFound(meta.id()));
                }
                report.affected_rows += changed;
            }
            PendingOp::Remove(id) => {
                report.affected_rows += tx.execute(
                    &format!("DELETE FROM {} WHERE id = ?1;", E::TABLE),
                    [id],
                )?;
            }
        }
        Ok(())
    }
}

impl<E: TableRecord> Repository<E> for SqliteRepository<'_, E> {
    fn get_all(&self) -> RepoResult<Vec<E>> {
        self.query_many("WHERE is_deleted = 0 ORDER BY id ASC", Vec::new())
    }

    fn get_by_key(&self, id: RecordId) -> RepoResult<Option<E>> {
        let mut found = self.query_many(
            "WHERE id = ?1 ORDER BY is_deleted ASC, row_id DESC LIMIT 1",
            vec![Value::Integer(id)],
        )?;
        Ok(found.pop())
    }

    fn list_with_deleted(&self) -> RepoResult<Vec<E>> {
        self.query_many("ORDER BY id ASC, row_id ASC", Vec::new())
    }

    fn max_id(&self) -> RepoResult<RecordId> {
        max_id(self.conn, E::TABLE)
    }

    fn add(&mut self, entity: E) {
        self.pending.push(PendingOp::Insert(entity));
    }

    fn update(&mut self, mut entity: E) {
        entity.meta_mut().touch(utc_now());
        self.pending.push(PendingOp::Update(entity));
    }

    fn delete(&mut self, entity: &E) {
        self.pending.push(PendingOp::Remove(entity.id()));
    }

    fn virtual_delete(&mut self, mut entity: E, acting_user_id: UserId) -> RepoResult<()> {
        entity.meta_mut().tombstone(acting_user_id, utc_now())?;
        self.pending.push(PendingOp::Tombstone(entity));
        Ok(())
    }

    fn pending_changes(&self) -> usize {
        self.pending.len()
    }

    fn discard_changes(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    fn save_changes(&mut self) -> RepoResult<SaveReport> {
        let ops = std::mem::take(&mut self.pending);
        if ops.is_empty() {
            return Ok(SaveReport::default());
        }

        let started_at = Instant::now();
        let staged = ops.len();
        let result = self.commit(&ops);

        match &result {
            Ok(report) => info!(
                "event=save_changes module=repo status=ok table={} staged={staged} affected={} duration_ms={}",
                E::TABLE,
                report.affected_rows,
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=save_changes module=repo status=error table={} staged={staged} duration_ms={} error={err}",
                E::TABLE,
                started_at.elapsed().as_millis()
            ),
        }
        result
    }
}

fn parse_row<E: TableRecord>(row: &Row<'_>) -> RepoResult<E> {
    let id: RecordId = row.get("id")?;
    let lifecycle = match row.get::<_, i64>("is_deleted")? {
        0 => Lifecycle::Live,
        1 => {
            let deleted_at = row.get::<_, Option<i64>>("deleted_at")?.ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "row with id {id} in {} is deleted but has no deleted_at",
                    E::TABLE
                ))
            })?;
            Lifecycle::Tombstoned {
                deleted_at: from_millis(deleted_at, "deleted_at")?,
                deleted_by_user_id: row.get("deleted_by_user_id")?,
            }
        }
        other => {
            return Err(RepoError::InvalidData(format!(
                "invalid is_deleted value `{other}` in {}.is_deleted",
                E::TABLE
            )));
        }
    };

    let meta = RecordMeta::restore(
        id,
        from_millis(row.get("created_at")?, "created_at")?,
        from_millis(row.get("edited_at")?, "edited_at")?,
        lifecycle,
    );
    E::from_row(meta, row)
}

fn insert_row<E: TableRecord>(tx: &Transaction<'_>, id: RecordId, entity: &E) -> RepoResult<()> {
    let meta = entity.meta();
    let mut values = vec![
        Value::Integer(id),
        Value::Integer(i64::from(meta.is_deleted())),
        Value::Integer(to_millis(meta.created_at())),
        Value::Integer(to_millis(meta.edited_at())),
        meta.deleted_at()
            .map_or(Value::Null, |at| Value::Integer(to_millis(at))),
        meta.deleted_by_user_id().map_or(Value::Null, Value::Integer),
    ];
    values.extend(entity.column_values());

    let placeholders = vec!["?"; values.len()].join(", ");
    tx.execute(
        &format!(
            "INSERT INTO {} ({}, {}) VALUES ({placeholders});",
            E::TABLE,
            META_COLUMNS.join(", "),
            E::COLUMNS.join(", ")
        ),
        params_from_iter(values),
    )?;
    debug!("event=row_insert module=repo table={} id={id}", E::TABLE);
    Ok(())
}

fn update_row<E: TableRecord>(tx: &Transaction<'_>, entity: &E) -> RepoResult<usize> {
    let assignments = E::COLUMNS
        .iter()
        .map(|column| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut values = vec![Value::Integer(to_millis(entity.meta().edited_at()))];
    values.extend(entity.column_values());
    values.push(Value::Integer(entity.id()));

    let changed = tx.execute(
        &format!(
            "UPDATE {} SET edited_at = ?, {assignments} WHERE id = ? AND is_deleted = 0;",
            E::TABLE
        ),
        params_from_iter(values),
    )?;
    Ok(changed)
}

fn next_id(tx: &Transaction<'_>, table: &str) -> RepoResult<RecordId> {
    Ok(max_id(tx, table)? + 1)
}

fn max_id(conn: &Connection, table: &str) -> RepoResult<RecordId> {
    let id = conn.query_row(
        &format!("SELECT COALESCE(MAX(id), 0) FROM {table};"),
        [],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

pub(crate) fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub(crate) fn from_millis(value: i64, column: &str) -> RepoResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value).ok_or_else(|| {
        RepoError::InvalidData(format!("timestamp `{value}` out of range in column {column}"))
    })
}
