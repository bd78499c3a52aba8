//! Per-connection cache of compiled statements, indexed by kind.
//!
//! Handles live in rusqlite's prepared-statement cache, sized so that one
//! handle per [`StatementKind`] always fits: once compiled, a kind is never
//! evicted or recompiled until [`StatementCache::dispose_all`].

use rusqlite::{CachedStatement, Connection};
use tracing::{trace, warn};

/// Every statement the executor runs repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    InsertTweet,
    UpdateTweetDyn,
    UpdateTweetFlags,
    SelectTweet,
    InsertUser,
    InsertAccount,
    DeleteAccount,
    UpdateAccountIdLists,
    Begin,
    Commit,
}

impl StatementKind {
    pub const ALL: [Self; 10] = [
        Self::InsertTweet,
        Self::UpdateTweetDyn,
        Self::UpdateTweetFlags,
        Self::SelectTweet,
        Self::InsertUser,
        Self::InsertAccount,
        Self::DeleteAccount,
        Self::UpdateAccountIdLists,
        Self::Begin,
        Self::Commit,
    ];

    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::InsertTweet => {
                "INSERT INTO tweets (id, statics, dynamic, author_id, recipient_id, flags, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            }
            Self::UpdateTweetDyn => "UPDATE tweets SET dynamic = ?1, flags = ?2 WHERE id = ?3",
            Self::UpdateTweetFlags => {
                "UPDATE tweets SET flags = ((flags | ?1) & ~?2) WHERE id = ?3"
            }
            Self::SelectTweet => {
                "SELECT statics, dynamic, author_id, recipient_id, flags, timestamp \
                 FROM tweets WHERE id = ?1"
            }
            Self::InsertUser => {
                "INSERT OR REPLACE INTO users (id, json, cached_img_url, created_time, last_update) \
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            }
            Self::InsertAccount => "INSERT INTO accounts (name) VALUES (?1)",
            Self::DeleteAccount => "DELETE FROM accounts WHERE id = ?1",
            Self::UpdateAccountIdLists => {
                "UPDATE accounts SET tweet_ids = ?1, dm_ids = ?2 WHERE id = ?3"
            }
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Statement handles plus transaction nesting depth for one connection.
#[derive(Debug, Default)]
pub struct StatementCache {
    prepared: [bool; StatementKind::ALL.len()],
    txn_depth: u32,
}

impl StatementCache {
    /// Size `conn`'s statement cache so no kind is ever evicted.
    #[must_use]
    pub fn new(conn: &Connection) -> Self {
        conn.set_prepared_statement_cache_capacity(StatementKind::ALL.len() + 4);
        Self::default()
    }

    /// The compiled handle for `kind`, compiling on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails to compile.
    pub fn get<'c>(
        &mut self,
        conn: &'c Connection,
        kind: StatementKind,
    ) -> rusqlite::Result<CachedStatement<'c>> {
        let stmt = conn.prepare_cached(kind.sql())?;
        if !self.prepared[kind.index()] {
            trace!(?kind, "prepared statement");
            self.prepared[kind.index()] = true;
        }
        Ok(stmt)
    }

    /// Run a parameterless statement. The handle is reset on return.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation or execution fails.
    pub fn exec_and_reset(&mut self, conn: &Connection, kind: StatementKind) -> rusqlite::Result<()> {
        self.get(conn, kind)?.execute([])?;
        Ok(())
    }

    /// Whether `kind` has been compiled on this connection.
    #[must_use]
    pub fn is_prepared(&self, kind: StatementKind) -> bool {
        self.prepared[kind.index()]
    }

    #[must_use]
    pub fn prepared_count(&self) -> usize {
        self.prepared.iter().filter(|p| **p).count()
    }

    /// Drop every compiled handle. Safe to call repeatedly.
    pub fn dispose_all(&mut self, conn: &Connection) {
        conn.flush_prepared_statement_cache();
        self.prepared = [false; StatementKind::ALL.len()];
    }

    /// Open a transaction unless one is already open through this cache.
    ///
    /// # Errors
    ///
    /// Returns an error if `BEGIN` fails; the depth is left unchanged.
    pub fn begin(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        if self.txn_depth == 0 {
            self.exec_and_reset(conn, StatementKind::Begin)?;
        }
        self.txn_depth += 1;
        Ok(())
    }

    /// Close one level of nesting, committing when the outermost closes.
    ///
    /// # Errors
    ///
    /// Returns an error if `COMMIT` fails. The depth is kept, so the call can
    /// be retried or followed by [`rollback`](Self::rollback).
    pub fn commit(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        match self.txn_depth {
            0 => {
                warn!("commit without matching begin");
                Ok(())
            }
            1 => {
                self.exec_and_reset(conn, StatementKind::Commit)?;
                self.txn_depth = 0;
                Ok(())
            }
            _ => {
                self.txn_depth -= 1;
                Ok(())
            }
        }
    }

    /// Abandon the open transaction, whatever its depth.
    ///
    /// # Errors
    ///
    /// Returns an error if `ROLLBACK` fails.
    pub fn rollback(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        self.txn_depth = 0;
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")
    }

    #[must_use]
    pub const fn transaction_depth(&self) -> u32 {
        self.txn_depth
    }
}
