//! Replace an entire dictionary from a snapshot.
//!
//! # Responsibility
//! - Tombstone the current live set, then insert the snapshot with its own ids.
//! - Report failures so callers can tell "nothing changed" from
//!   "dictionary left empty".
//!
//! # Invariants
//! - Phase 1 (tombstones) commits before phase 2 (inserts) starts, so a
//!   reused id never collides with the live row it replaces.
//! - Phase 1 is never rolled back automatically after phase 2 fails.
//! - One replace-all per table at a time; the lease is released on every exit.
//! - Candidates are validated for duplicate ids before anything is written.
//! - Candidates without an id are numbered before phase 1, above every id in
//!   history and every explicit id in the snapshot.

use crate::feed::parser::{FeedError, FeedParser};
use crate::model::dictionary::DictionaryEntry;
use crate::model::record::{Record, RecordId, SYSTEM_USER_ID, UNASSIGNED_ID};
use crate::repo::generic_repo::{RepoError, Repository, TableRecord};
use crate::repo::sync_lease::{LeaseToken, SyncLock};
use log::{error, info, warn};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

pub type SyncResult<T> = Result<T, SyncError>;

/// Replace-all failure.
#[derive(Debug)]
pub enum SyncError {
    /// Snapshot rejected by the parser; nothing changed.
    Feed(FeedError),
    /// Two candidates carry the same id; nothing changed.
    DuplicateId(RecordId),
    /// The repository already holds staged work; nothing changed.
    UnsavedChanges(usize),
    /// Another replace-all holds the lease for this table; nothing changed.
    AlreadyRunning { scope: &'static str },
    /// Reading the live set or taking the lease failed; nothing changed.
    Snapshot(RepoError),
    /// Tombstoning the live set failed; nothing changed.
    TombstonePhase(RepoError),
    /// Inserting the snapshot failed after the old rows were tombstoned.
    /// The dictionary is empty until the import is re-run.
    InsertPhase { tombstoned: usize, source: RepoError },
    /// Both phases committed but the live set could not be re-read.
    Refresh(RepoError),
}

impl SyncError {
    /// True when the live dictionary was emptied and not refilled.
    pub fn dictionary_emptied(&self) -> bool {
        matches!(self, Self::InsertPhase { .. })
    }

    /// True when storage is exactly as it was before the call.
    pub fn changed_nothing(&self) -> bool {
        !matches!(self, Self::InsertPhase { .. } | Self::Refresh(_))
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feed(err) => write!(f, "snapshot rejected: {err}"),
            Self::DuplicateId(id) => write!(f, "snapshot rejected: id {id} appears more than once"),
            Self::UnsavedChanges(count) => {
                write!(f, "repository has {count} unsaved change(s); refusing to replace")
            }
            Self::AlreadyRunning { scope } => {
                write!(f, "a replace-all import for `{scope}` is already running")
            }
            Self::Snapshot(err) => write!(f, "failed to read current dictionary: {err}"),
            Self::TombstonePhase(err) => {
                write!(f, "failed to retire current dictionary, nothing changed: {err}")
            }
            Self::InsertPhase { tombstoned, source } => write!(
                f,
                "retired {tombstoned} record(s) but failed to insert the snapshot; dictionary is empty, re-run the import: {source}"
            ),
            Self::Refresh(err) => write!(f, "import committed but re-reading failed: {err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Feed(err) => Some(err),
            Self::Snapshot(err) | Self::TombstonePhase(err) | Self::Refresh(err) => Some(err),
            Self::InsertPhase { source, .. } => Some(source),
            Self::DuplicateId(_) | Self::UnsavedChanges(_) | Self::AlreadyRunning { .. } => None,
        }
    }
}

impl From<FeedError> for SyncError {
    fn from(value: FeedError) -> Self {
        Self::Feed(value)
    }
}

/// Successful replace-all outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport<E> {
    /// Lease generation this run held.
    pub generation: i64,
    /// Previously live rows that were tombstoned.
    pub tombstoned: usize,
    /// Snapshot rows inserted.
    pub inserted: usize,
    /// Live set after the import.
    pub live: Vec<E>,
}

/// Parses `bytes` and replaces the dictionary with the result.
pub fn import_feed<R, L>(
    repo: &mut R,
    lock: &L,
    parser: &FeedParser,
    bytes: &[u8],
) -> SyncResult<SyncReport<DictionaryEntry>>
where
    R: Repository<DictionaryEntry>,
    L: SyncLock,
{
    let candidates = parser.parse_entries(bytes)?;
    replace_all(repo, lock, candidates)
}

/// Replaces every live row of `E`'s table with `candidates`.
///
/// Candidate ids are kept verbatim; `UNASSIGNED_ID` candidates are numbered
/// in document order starting above the highest id in history or snapshot.
pub fn replace_all<E, R, L>(repo: &mut R, lock: &L, candidates: Vec<E>) -> SyncResult<SyncReport<E>>
where
    E: TableRecord,
    R: Repository<E>,
    L: SyncLock,
{
    ensure_unique_ids(&candidates)?;
    let pending = repo.pending_changes();
    if pending > 0 {
        return Err(SyncError::UnsavedChanges(pending));
    }

    let token = lock
        .try_acquire(E::TABLE)
        .map_err(SyncError::Snapshot)?
        .ok_or(SyncError::AlreadyRunning { scope: E::TABLE })?;

    let started_at = Instant::now();
    let result = run_phases(repo, &token, candidates);

    if let Err(err) = lock.release(&token) {
        warn!(
            "event=sync_replace module=sync status=lease_release_failed scope={} generation={} error={err}",
            token.scope, token.generation
        );
    }

    match &result {
        Ok(report) => info!(
            "event=sync_replace module=sync status=ok scope={} generation={} tombstoned={} inserted={} duration_ms={}",
            token.scope,
            token.generation,
            report.tombstoned,
            report.inserted,
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=sync_replace module=sync status=error scope={} generation={} dictionary_emptied={} duration_ms={} error={err}",
            token.scope,
            token.generation,
            err.dictionary_emptied(),
            started_at.elapsed().as_millis()
        ),
    }
    result
}

fn run_phases<E, R>(repo: &mut R, token: &LeaseToken, mut candidates: Vec<E>) -> SyncResult<SyncReport<E>>
where
    E: TableRecord,
    R: Repository<E>,
{
    let history_max = repo.max_id().map_err(SyncError::Snapshot)?;
    assign_missing_ids(&mut candidates, history_max);

    if let Err(err) = stage_tombstones(repo, token) {
        repo.discard_changes();
        return Err(err);
    }

    let tombstoned = match repo.save_changes() {
        Ok(report) => report.affected_rows,
        Err(err) => return Err(SyncError::TombstonePhase(err)),
    };

    let staged = candidates.len();
    for candidate in candidates {
        repo.add(candidate);
    }
    let inserted = match repo.save_changes() {
        Ok(report) => report.inserted_ids.len(),
        Err(source) => return Err(SyncError::InsertPhase { tombstoned, source }),
    };
    debug_assert_eq!(inserted, staged);

    let live = repo.get_all().map_err(SyncError::Refresh)?;
    Ok(SyncReport {
        generation: token.generation,
        tombstoned,
        inserted,
        live,
    })
}

fn stage_tombstones<E, R>(repo: &mut R, token: &LeaseToken) -> SyncResult<()>
where
    E: TableRecord,
    R: Repository<E>,
{
    let live = repo.get_all().map_err(SyncError::Snapshot)?;
    for record in live {
        // Re-read so a row retired since the listing is not tombstoned twice.
        let current = repo
            .get_by_key(record.id())
            .map_err(SyncError::Snapshot)?;
        match current {
            Some(current) if !current.is_deleted() => repo
                .virtual_delete(current, SYSTEM_USER_ID)
                .map_err(SyncError::TombstonePhase)?,
            _ => warn!(
                "event=sync_replace module=sync status=skip_retired scope={} id={}",
                token.scope,
                record.id()
            ),
        }
    }
    Ok(())
}

fn assign_missing_ids<E: Record>(candidates: &mut [E], history_max: RecordId) {
    let mut next = candidates
        .iter()
        .map(Record::id)
        .fold(history_max, RecordId::max)
        + 1;
    for candidate in candidates.iter_mut() {
        if candidate.meta_mut().assign_id(next) {
            next += 1;
        }
    }
}

fn ensure_unique_ids<E: Record>(candidates: &[E]) -> SyncResult<()> {
    let mut seen = HashSet::with_capacity(candidates.len());
    for candidate in candidates {
        let id = candidate.id();
        if id != UNASSIGNED_ID && !seen.insert(id) {
            return Err(SyncError::DuplicateId(id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::assign_missing_ids;
    use crate::model::dictionary::{DictionaryEntry, EARLIEST_DATE, OPEN_ENDED};
    use crate::model::record::{Record, UNASSIGNED_ID};

    fn candidate(id: i64) -> DictionaryEntry {
        DictionaryEntry::with_id(id, 0, "x", EARLIEST_DATE, OPEN_ENDED)
    }

    #[test]
    fn missing_ids_start_above_history_and_snapshot() {
        let mut candidates = vec![
            candidate(UNASSIGNED_ID),
            candidate(4),
            candidate(UNASSIGNED_ID),
        ];
        assign_missing_ids(&mut candidates, 2);
        let ids = candidates.iter().map(Record::id).collect::<Vec<_>>();
        assert_eq!(ids, vec![5, 4, 6]);

        let mut candidates = vec![candidate(UNASSIGNED_ID), candidate(1)];
        assign_missing_ids(&mut candidates, 9);
        let ids = candidates.iter().map(Record::id).collect::<Vec<_>>();
        assert_eq!(ids, vec![10, 1]);
    }
}
