//! Core of the medical care form reference dictionary.
//! Owns storage, feed parsing and the replace-all import; outer layers only
//! call into `service`.

pub mod config;
pub mod db;
pub mod feed;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod sync;

pub use config::{ConfigError, ServiceConfig};
pub use db::{open_db, open_db_in_memory, open_store, DbError, StoreTarget};
pub use feed::layout::FeedLayout;
pub use feed::parser::{parse_feed_date, FeedError, FeedHeader, FeedParser, FeedSnapshot};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::dictionary::{
    DictionaryEntry, EntryValidationError, EARLIEST_DATE, OPEN_ENDED, UNKNOWN_NAME,
};
pub use model::record::{
    Lifecycle, Record, RecordId, RecordMeta, UserId, SYSTEM_USER_ID, UNASSIGNED_ID,
};
pub use repo::dictionary_table::DictionaryRepository;
pub use repo::generic_repo::{
    RepoError, RepoResult, Repository, SaveReport, SqliteRepository, TableRecord,
};
pub use repo::sync_lease::{LeaseToken, SqliteSyncLease, SyncLock};
pub use service::dictionary_service::{
    DeleteResponse, DictionaryDto, DictionaryService, ServiceError, SqliteDictionaryService,
    DELETE_SUCCESS_MESSAGE,
};
pub use sync::pipeline::{import_feed, replace_all, SyncError, SyncReport};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
