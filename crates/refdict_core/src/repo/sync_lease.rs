//! Replace-all exclusivity backed by the `sync_leases` table.
//!
//! # Responsibility
//! - Let at most one bulk import per dictionary table run at a time, across
//!   every connection that shares the database file.
//!
//! # Invariants
//! - Acquire is a compare-and-swap on `in_flight`; each success bumps
//!   `generation`.
//! - A lease older than the configured timeout counts as abandoned.
//! - Release only clears a lease whose generation still matches.

use crate::model::record::utc_now;
use crate::repo::generic_repo::{to_millis, RepoResult};
use chrono::Duration as ChronoDuration;
use log::{info, warn};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::time::Duration;

/// Default age after which an unreleased lease may be taken over.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Proof of a held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub scope: &'static str,
    pub generation: i64,
}

/// Mutual exclusion for replace-all runs, keyed by dictionary table.
pub trait SyncLock {
    /// Returns `None` when another run holds an unexpired lease on `scope`.
    fn try_acquire(&self, scope: &'static str) -> RepoResult<Option<LeaseToken>>;
    fn release(&self, token: &LeaseToken) -> RepoResult<()>;
}

/// SQLite lease row implementation of `SyncLock`.
pub struct SqliteSyncLease<'conn> {
    conn: &'conn Connection,
    timeout: Duration,
}

impl<'conn> SqliteSyncLease<'conn> {
    pub fn new(conn: &'conn Connection, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    /// Current generation for `scope`; `0` before the first import.
    pub fn generation(&self, scope: &str) -> RepoResult<i64> {
        let generation = self
            .conn
            .query_row(
                "SELECT generation FROM sync_leases WHERE table_name = ?1;",
                [scope],
                |row| row.get(0),
            )
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(0),
                other => Err(other),
            })?;
        Ok(generation)
    }
}

impl SyncLock for SqliteSyncLease<'_> {
    fn try_acquire(&self, scope: &'static str) -> RepoResult<Option<LeaseToken>> {
        let now = utc_now();
        let timeout = ChronoDuration::from_std(self.timeout).unwrap_or(ChronoDuration::MAX);
        let stale_before = now.checked_sub_signed(timeout).map_or(i64::MIN, to_millis);

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO sync_leases (table_name) VALUES (?1);",
            [scope],
        )?;
        let stale = tx.query_row(
            "SELECT in_flight = 1 AND acquired_at IS NOT NULL AND acquired_at < ?2
             FROM sync_leases
             WHERE table_name = ?1;",
            params![scope, stale_before],
            |row| row.get::<_, bool>(0),
        )?;
        let changed = tx.execute(
            "UPDATE sync_leases
             SET
                in_flight = 1,
                generation = generation + 1,
                acquired_at = ?2
             WHERE table_name = ?1
               AND (in_flight = 0 OR acquired_at IS NULL OR acquired_at < ?3);",
            params![scope, to_millis(now), stale_before],
        )?;
        if changed == 0 {
            tx.commit()?;
            info!("event=sync_lease module=repo status=busy scope={scope}");
            return Ok(None);
        }

        let generation: i64 = tx.query_row(
            "SELECT generation FROM sync_leases WHERE table_name = ?1;",
            [scope],
            |row| row.get(0),
        )?;
        tx.commit()?;

        if stale {
            warn!("event=sync_lease module=repo status=takeover scope={scope} generation={generation}");
        }
        info!("event=sync_lease module=repo status=acquired scope={scope} generation={generation}");
        Ok(Some(LeaseToken { scope, generation }))
    }

    fn release(&self, token: &LeaseToken) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE sync_leases
             SET in_flight = 0, acquired_at = NULL
             WHERE table_name = ?1
               AND generation = ?2;",
            params![token.scope, token.generation],
        )?;
        if changed == 0 {
            warn!(
                "event=sync_lease module=repo status=lost scope={} generation={}",
                token.scope, token.generation
            );
        }
        Ok(())
    }
}
