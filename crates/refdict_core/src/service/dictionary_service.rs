//! Request handlers for the medical care form dictionary.
//!
//! # Responsibility
//! - Translate request payloads into repository and pipeline calls.
//! - Shape results as DTOs; map absence to `NotFound` and bad input to
//!   `Rejected` instead of failing the process.
//!
//! # Invariants
//! - Reads and single-entity writes only ever touch live rows.
//! - Deletes are soft, attributed to the system user.
//! - Writes that change the dictionary answer with the refreshed live list.

use crate::config::ServiceConfig;
use crate::feed::parser::FeedParser;
use crate::model::dictionary::{DictionaryEntry, EntryValidationError};
use crate::model::record::{Record, RecordId, SYSTEM_USER_ID};
use crate::repo::generic_repo::{RepoError, RepoResult, Repository, SqliteRepository};
use crate::repo::sync_lease::{SqliteSyncLease, SyncLock};
use crate::sync::pipeline::{import_feed, SyncError};
use chrono::NaiveDate;
use log::{info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Confirmation text returned after a successful delete.
pub const DELETE_SUCCESS_MESSAGE: &str = "Успешно удалено";

/// Wire shape of one dictionary row.
///
/// `id` is ignored on create and update; the path id or storage decides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryDto {
    #[serde(default)]
    pub id: RecordId,
    pub code: i32,
    pub name: String,
    pub begin_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl From<&DictionaryEntry> for DictionaryDto {
    fn from(entry: &DictionaryEntry) -> Self {
        Self {
            id: entry.id(),
            code: entry.code,
            name: entry.name.clone(),
            begin_date: entry.begin_date,
            end_date: entry.end_date,
        }
    }
}

/// Response body of a successful delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub message: String,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Handler outcome other than success.
#[derive(Debug)]
pub enum ServiceError {
    /// No live record with this id.
    NotFound(RecordId),
    /// The request was refused; carries the underlying reason.
    Rejected(String),
    /// Bulk import failed; see `SyncError::dictionary_emptied`.
    Sync(SyncError),
    /// Storage failure on a read path.
    Repo(RepoError),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "dictionary entry not found: {id}"),
            Self::Rejected(message) => write!(f, "request rejected: {message}"),
            Self::Sync(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sync(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::NotFound(_) | Self::Rejected(_) => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(id) => Self::NotFound(id),
            other => Self::Repo(other),
        }
    }
}

impl From<SyncError> for ServiceError {
    fn from(value: SyncError) -> Self {
        Self::Sync(value)
    }
}

impl From<EntryValidationError> for ServiceError {
    fn from(value: EntryValidationError) -> Self {
        Self::Rejected(value.to_string())
    }
}

/// Dictionary request handlers over any repository and import lock.
pub struct DictionaryService<R, L> {
    repo: R,
    lock: L,
    parser: FeedParser,
}

/// Handlers wired to SQLite storage.
pub type SqliteDictionaryService<'conn> =
    DictionaryService<SqliteRepository<'conn, DictionaryEntry>, SqliteSyncLease<'conn>>;

impl<'conn> SqliteDictionaryService<'conn> {
    /// Builds handlers over a migrated connection using `config` for the
    /// feed layout and lease timeout.
    pub fn open(conn: &'conn Connection, config: &ServiceConfig) -> RepoResult<Self> {
        Ok(DictionaryService::new(
            SqliteRepository::try_new(conn)?,
            SqliteSyncLease::new(conn, config.sync_lease_timeout()),
            FeedParser::new(config.feed_layout.clone()),
        ))
    }
}

impl<R, L> DictionaryService<R, L>
where
    R: Repository<DictionaryEntry>,
    L: SyncLock,
{
    pub fn new(repo: R, lock: L, parser: FeedParser) -> Self {
        Self { repo, lock, parser }
    }

    /// Live entries ordered by id.
    pub fn get_all(&self) -> ServiceResult<Vec<DictionaryDto>> {
        Ok(self.repo.get_all()?.iter().map(DictionaryDto::from).collect())
    }

    /// One live entry.
    pub fn get(&self, id: RecordId) -> ServiceResult<DictionaryDto> {
        self.find_live(id).map(|entry| DictionaryDto::from(&entry))
    }

    /// Full history including tombstones, ordered by id then insertion.
    pub fn history(&self) -> ServiceResult<Vec<DictionaryEntry>> {
        Ok(self.repo.list_with_deleted()?)
    }

    /// Creates one entry with a storage-assigned id.
    pub fn create(&mut self, dto: &DictionaryDto) -> ServiceResult<Vec<DictionaryDto>> {
        let entry = DictionaryEntry::new(dto.code, dto.name.trim(), dto.begin_date, dto.end_date);
        entry.validate()?;

        self.repo.add(entry);
        let report = self.commit("create")?;
        info!(
            "event=dictionary_create module=service status=ok id={}",
            report.inserted_ids.first().copied().unwrap_or_default()
        );
        self.get_all()
    }

    /// Overwrites code, name and validity of a live entry.
    pub fn update(&mut self, id: RecordId, dto: &DictionaryDto) -> ServiceResult<Vec<DictionaryDto>> {
        let mut entry = self.find_live(id)?;
        entry.code = dto.code;
        entry.name = dto.name.trim().to_string();
        entry.begin_date = dto.begin_date;
        entry.end_date = dto.end_date;
        entry.validate()?;

        self.repo.update(entry);
        self.commit("update")?;
        info!("event=dictionary_update module=service status=ok id={id}");
        self.get_all()
    }

    /// Soft-deletes a live entry.
    pub fn delete(&mut self, id: RecordId) -> ServiceResult<DeleteResponse> {
        let entry = self.find_live(id)?;
        self.repo.virtual_delete(entry, SYSTEM_USER_ID)?;
        self.commit("delete")?;
        info!("event=dictionary_delete module=service status=ok id={id}");
        Ok(DeleteResponse {
            message: DELETE_SUCCESS_MESSAGE.to_string(),
        })
    }

    /// Replaces the whole dictionary from an uploaded snapshot.
    pub fn upload(&mut self, bytes: &[u8]) -> ServiceResult<Vec<DictionaryDto>> {
        let report = import_feed(&mut self.repo, &self.lock, &self.parser, bytes)?;
        Ok(report.live.iter().map(DictionaryDto::from).collect())
    }

    fn find_live(&self, id: RecordId) -> ServiceResult<DictionaryEntry> {
        match self.repo.get_by_key(id)? {
            Some(entry) if !entry.is_deleted() => Ok(entry),
            _ => Err(ServiceError::NotFound(id)),
        }
    }

    /// Commits staged work, turning storage refusals into `Rejected`.
    fn commit(&mut self, action: &str) -> ServiceResult<crate::repo::generic_repo::SaveReport> {
        self.repo.save_changes().map_err(|err| match err {
            RepoError::NotFound(id) => ServiceError::NotFound(id),
            other => {
                warn!("event=dictionary_{action} module=service status=rejected error={other}");
                ServiceError::Rejected(other.to_string())
            }
        })
    }
}
