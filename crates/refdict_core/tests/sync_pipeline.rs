use chrono::NaiveDate;
use refdict_core::db::open_db_in_memory;
use refdict_core::{
    import_feed, replace_all, DictionaryEntry, DictionaryRepository, FeedParser, Record,
    RecordId, RepoError, RepoResult, Repository, SaveReport, SqliteSyncLease, SyncError,
    SyncLock, UserId, OPEN_ENDED,
};
use rusqlite::Connection;
use std::cell::Cell;
use std::time::Duration;

const TABLE: &str = "medical_care_forms";
const LEASE_TIMEOUT: Duration = Duration::from_secs(600);

const THREE_FORMS: &str = "<packet>
  <zap><IDFRMMP>1</IDFRMMP><FRMMPNAME>Экстренная</FRMMPNAME><DATEBEG>01.01.2013</DATEBEG></zap>
  <zap><IDFRMMP>2</IDFRMMP><FRMMPNAME>Неотложная</FRMMPNAME><DATEBEG>01.01.2013</DATEBEG></zap>
  <zap><IDFRMMP>3</IDFRMMP><FRMMPNAME>Плановая</FRMMPNAME><DATEBEG>01.01.2013</DATEBEG></zap>
</packet>";

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

fn live_names(repo: &DictionaryRepository<'_>) -> Vec<String> {
    repo.get_all()
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect()
}

#[test]
fn import_into_empty_store_inserts_snapshot() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    let report = import_feed(&mut repo, &lease, &FeedParser::default(), THREE_FORMS.as_bytes())
        .unwrap();

    assert_eq!(report.tombstoned, 0);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.generation, 1);
    let ids = report.live.iter().map(Record::id).collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(live_names(&repo), vec!["Экстренная", "Неотложная", "Плановая"]);
    assert!(report.live.iter().all(|e| e.begin_date == date(2013, 1, 1)));
}

#[test]
fn rerun_tombstones_previous_rows_and_keeps_ids() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let parser = FeedParser::default();

    import_feed(&mut repo, &lease, &parser, THREE_FORMS.as_bytes()).unwrap();
    let report = import_feed(&mut repo, &lease, &parser, THREE_FORMS.as_bytes()).unwrap();

    assert_eq!(report.tombstoned, 3);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.generation, 2);
    assert_eq!(repo.get_all().unwrap().len(), 3);

    let history = repo.list_with_deleted().unwrap();
    assert_eq!(history.len(), 6);
    let tombstones = history.iter().filter(|e| e.is_deleted()).collect::<Vec<_>>();
    assert_eq!(tombstones.len(), 3);
    assert!(tombstones
        .iter()
        .all(|e| e.meta.deleted_by_user_id() == Some(0) && e.meta.deleted_at().is_some()));

    for id in 1..=3 {
        let current = repo.get_by_key(id).unwrap().unwrap();
        assert!(!current.is_deleted());
    }
}

#[test]
fn snapshot_without_some_entries_retires_them() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let parser = FeedParser::default();

    import_feed(&mut repo, &lease, &parser, THREE_FORMS.as_bytes()).unwrap();
    let smaller = "<packet><zap><IDFRMMP>3</IDFRMMP><FRMMPNAME>Плановая</FRMMPNAME></zap></packet>";
    import_feed(&mut repo, &lease, &parser, smaller.as_bytes()).unwrap();

    assert_eq!(live_names(&repo), vec!["Плановая"]);
    assert!(repo.get_by_key(1).unwrap().unwrap().is_deleted());
}

#[test]
fn empty_snapshot_empties_the_dictionary() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    import_feed(&mut repo, &lease, &FeedParser::default(), THREE_FORMS.as_bytes()).unwrap();
    let report = replace_all(&mut repo, &lease, Vec::<DictionaryEntry>::new()).unwrap();

    assert_eq!(report.tombstoned, 3);
    assert_eq!(report.inserted, 0);
    assert!(report.live.is_empty());
}

#[test]
fn parse_failure_changes_nothing() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let parser = FeedParser::default();

    import_feed(&mut repo, &lease, &parser, THREE_FORMS.as_bytes()).unwrap();
    let err = import_feed(&mut repo, &lease, &parser, b"<packet><zap><IDFRMMP>x</IDFRMMP></zap></packet>")
        .unwrap_err();

    assert!(matches!(err, SyncError::Feed(_)));
    assert!(err.changed_nothing());
    assert_eq!(repo.list_with_deleted().unwrap().len(), 3);
    assert_eq!(lease.generation(TABLE).unwrap(), 1);
}

#[test]
fn duplicate_candidate_ids_are_rejected_before_writing() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    let candidates = vec![
        DictionaryEntry::with_id(1, 1, "Экстренная", date(2013, 1, 1), OPEN_ENDED),
        DictionaryEntry::with_id(1, 1, "Экстренная", date(2013, 1, 1), OPEN_ENDED),
    ];
    let err = replace_all(&mut repo, &lease, candidates).unwrap_err();

    assert!(matches!(err, SyncError::DuplicateId(1)));
    assert!(err.changed_nothing());
    assert_eq!(lease.generation(TABLE).unwrap(), 0);
}

#[test]
fn unassigned_candidates_get_fresh_ids() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    let candidates = vec![
        DictionaryEntry::new(0, "без кода", date(2013, 1, 1), OPEN_ENDED),
        DictionaryEntry::new(0, "тоже без кода", date(2013, 1, 1), OPEN_ENDED),
    ];
    let report = replace_all(&mut repo, &lease, candidates).unwrap();

    let ids = report.live.iter().map(Record::id).collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn insert_phase_failure_leaves_dictionary_empty() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    import_feed(&mut repo, &lease, &FeedParser::default(), THREE_FORMS.as_bytes()).unwrap();

    let candidates = vec![
        DictionaryEntry::with_id(1, 1, "Экстренная", date(2013, 1, 1), OPEN_ENDED),
        DictionaryEntry::with_id(2, 2, "", date(2013, 1, 1), OPEN_ENDED),
    ];
    let err = replace_all(&mut repo, &lease, candidates).unwrap_err();

    match &err {
        SyncError::InsertPhase { tombstoned, .. } => assert_eq!(*tombstoned, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.dictionary_emptied());
    assert!(!err.changed_nothing());
    assert!(repo.get_all().unwrap().is_empty());
    assert_eq!(repo.pending_changes(), 0);

    // The lease was released, so a corrected re-run goes through.
    let report = import_feed(&mut repo, &lease, &FeedParser::default(), THREE_FORMS.as_bytes())
        .unwrap();
    assert_eq!(report.tombstoned, 0);
    assert_eq!(report.live.len(), 3);
}

#[test]
fn unsaved_changes_block_replace_all() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    repo.add(DictionaryEntry::with_id(9, 9, "черновик", date(2013, 1, 1), OPEN_ENDED));
    let err = import_feed(&mut repo, &lease, &FeedParser::default(), THREE_FORMS.as_bytes())
        .unwrap_err();

    assert!(matches!(err, SyncError::UnsavedChanges(1)));
    assert_eq!(repo.pending_changes(), 1);
    assert!(repo.get_all().unwrap().is_empty());
}

#[test]
fn concurrent_replace_all_is_refused_while_lease_is_held() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let other_run = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    let held = other_run.try_acquire(TABLE).unwrap().unwrap();
    let err = import_feed(&mut repo, &lease, &FeedParser::default(), THREE_FORMS.as_bytes())
        .unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning { scope } if scope == TABLE));
    assert!(err.changed_nothing());
    assert!(repo.list_with_deleted().unwrap().is_empty());

    other_run.release(&held).unwrap();
    let report = import_feed(&mut repo, &lease, &FeedParser::default(), THREE_FORMS.as_bytes())
        .unwrap();
    assert_eq!(report.generation, held.generation + 1);
}

#[test]
fn abandoned_lease_is_taken_over_after_timeout() {
    let conn = open_db_in_memory().unwrap();
    let crashed = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let abandoned = crashed.try_acquire(TABLE).unwrap().unwrap();
    age_lease(&conn, TABLE);

    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let token = lease.try_acquire(TABLE).unwrap().unwrap();
    assert_eq!(token.generation, abandoned.generation + 1);

    // The old holder can no longer clear the new lease.
    crashed.release(&abandoned).unwrap();
    assert!(lease.try_acquire(TABLE).unwrap().is_none());

    lease.release(&token).unwrap();
    assert!(lease.try_acquire(TABLE).unwrap().is_some());
}

#[test]
fn leases_are_scoped_per_table() {
    let conn = open_db_in_memory().unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    let first = lease.try_acquire(TABLE).unwrap().unwrap();
    let other = lease.try_acquire("another_dictionary").unwrap().unwrap();
    assert_eq!(first.generation, 1);
    assert_eq!(other.generation, 1);
}

const UNCODED_FIRST: &str = "<packet>
  <zap><FRMMPNAME>без кода</FRMMPNAME></zap>
  <zap><IDFRMMP>1</IDFRMMP><FRMMPNAME>Экстренная</FRMMPNAME></zap>
  <zap><IDFRMMP>2</IDFRMMP><FRMMPNAME>Неотложная</FRMMPNAME></zap>
</packet>";

#[test]
fn uncoded_entry_before_coded_ones_gets_id_above_snapshot() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);

    let report = import_feed(&mut repo, &lease, &FeedParser::default(), UNCODED_FIRST.as_bytes())
        .unwrap();

    assert_eq!(report.inserted, 3);
    let uncoded = report.live.iter().find(|e| e.code == 0).unwrap();
    assert_eq!(uncoded.id(), 3);
    assert_eq!(uncoded.name, "без кода");
    let ids = report.live.iter().map(Record::id).collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn uncoded_entry_skips_ids_used_in_history_and_snapshot() {
    let conn = open_db_in_memory().unwrap();
    let mut repo = DictionaryRepository::try_new(&conn).unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let parser = FeedParser::default();

    import_feed(&mut repo, &lease, &parser, THREE_FORMS.as_bytes()).unwrap();
    // Code 4 is max(history) + 1, the id storage would have handed out first.
    let feed = "<packet>
      <zap><FRMMPNAME>без кода</FRMMPNAME></zap>
      <zap><IDFRMMP>4</IDFRMMP><FRMMPNAME>Паллиативная</FRMMPNAME></zap>
      <zap><IDFRMMP>1</IDFRMMP><FRMMPNAME>Экстренная</FRMMPNAME></zap>
    </packet>";
    let report = import_feed(&mut repo, &lease, &parser, feed.as_bytes()).unwrap();

    assert_eq!(report.tombstoned, 3);
    let ids = report.live.iter().map(Record::id).collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 4, 5]);
    assert_eq!(repo.get_by_key(5).unwrap().unwrap().name, "без кода");
}

/// Delegates to a real repository but fails chosen calls.
struct FlakyRepo<'conn> {
    inner: DictionaryRepository<'conn>,
    fail_save_call: Option<usize>,
    fail_get_all_call: Option<usize>,
    saves: usize,
    get_all_calls: Cell<usize>,
    adds: usize,
}

impl<'conn> FlakyRepo<'conn> {
    fn new(conn: &'conn Connection) -> Self {
        Self {
            inner: DictionaryRepository::try_new(conn).unwrap(),
            fail_save_call: None,
            fail_get_all_call: None,
            saves: 0,
            get_all_calls: Cell::new(0),
            adds: 0,
        }
    }
}

impl Repository<DictionaryEntry> for FlakyRepo<'_> {
    fn get_all(&self) -> RepoResult<Vec<DictionaryEntry>> {
        let call = self.get_all_calls.get() + 1;
        self.get_all_calls.set(call);
        if self.fail_get_all_call == Some(call) {
            return Err(RepoError::InvalidData("read failed".to_string()));
        }
        self.inner.get_all()
    }

    fn get_by_key(&self, id: RecordId) -> RepoResult<Option<DictionaryEntry>> {
        self.inner.get_by_key(id)
    }

    fn list_with_deleted(&self) -> RepoResult<Vec<DictionaryEntry>> {
        self.inner.list_with_deleted()
    }

    fn max_id(&self) -> RepoResult<RecordId> {
        self.inner.max_id()
    }

    fn add(&mut self, entity: DictionaryEntry) {
        self.adds += 1;
        self.inner.add(entity);
    }

    fn update(&mut self, entity: DictionaryEntry) {
        self.inner.update(entity);
    }

    fn delete(&mut self, entity: &DictionaryEntry) {
        self.inner.delete(entity);
    }

    fn virtual_delete(&mut self, entity: DictionaryEntry, acting_user_id: UserId) -> RepoResult<()> {
        self.inner.virtual_delete(entity, acting_user_id)
    }

    fn pending_changes(&self) -> usize {
        self.inner.pending_changes()
    }

    fn discard_changes(&mut self) -> usize {
        self.inner.discard_changes()
    }

    fn save_changes(&mut self) -> RepoResult<SaveReport> {
        self.saves += 1;
        if self.fail_save_call == Some(self.saves) {
            self.inner.discard_changes();
            return Err(RepoError::InvalidData("commit failed".to_string()));
        }
        self.inner.save_changes()
    }
}

fn three_forms() -> Vec<DictionaryEntry> {
    FeedParser::default()
        .parse_entries(THREE_FORMS.as_bytes())
        .unwrap()
}

#[test]
fn tombstone_phase_failure_changes_nothing_and_skips_inserts() {
    let conn = open_db_in_memory().unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let mut repo = FlakyRepo::new(&conn);
    replace_all(&mut repo, &lease, three_forms()).unwrap();
    let before = repo.get_all().unwrap();
    let adds_before = repo.adds;

    repo.saves = 0;
    repo.fail_save_call = Some(1);
    let err = replace_all(&mut repo, &lease, three_forms()).unwrap_err();

    assert!(matches!(err, SyncError::TombstonePhase(_)));
    assert!(err.changed_nothing());
    assert!(!err.dictionary_emptied());
    assert_eq!(repo.saves, 1);
    assert_eq!(repo.adds, adds_before);
    assert_eq!(repo.pending_changes(), 0);
    assert_eq!(repo.get_all().unwrap(), before);
    assert_eq!(repo.list_with_deleted().unwrap().len(), 3);

    let token = lease.try_acquire(TABLE).unwrap();
    assert!(token.is_some(), "lease must be released after a failed run");
}

#[test]
fn refresh_failure_is_reported_after_both_phases_commit() {
    let conn = open_db_in_memory().unwrap();
    let lease = SqliteSyncLease::new(&conn, LEASE_TIMEOUT);
    let mut repo = FlakyRepo::new(&conn);
    // First get_all lists the live set for tombstoning, the second re-reads it.
    repo.fail_get_all_call = Some(2);

    let err = replace_all(&mut repo, &lease, three_forms()).unwrap_err();

    assert!(matches!(err, SyncError::Refresh(_)));
    assert!(!err.changed_nothing());
    assert!(!err.dictionary_emptied());
    assert_eq!(repo.inner.get_all().unwrap().len(), 3);
    assert!(lease.try_acquire(TABLE).unwrap().is_some());
}

fn age_lease(conn: &Connection, scope: &str) {
    conn.execute(
        "UPDATE sync_leases SET acquired_at = 0 WHERE table_name = ?1;",
        [scope],
    )
    .unwrap();
}
