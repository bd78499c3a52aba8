//! `SQLite` storage for tweets, users and accounts.
//!
//! A [`Storage`] owns one connection and the [`StatementCache`] compiled
//! against it. The same type serves the background worker and the
//! front door's synchronous connection; [`Storage::execute`] is the single
//! dispatch both of them use.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, Dictionary};
use crate::config::{BusyPolicy, StoreConfig};
use crate::error::{Result, ResultExt, StoreError, is_busy};
use crate::message::{BatchList, Message, MessageKind, SelectRequest};
use crate::model::{Account, AccountRow, StoreCounts, TweetRecord, TweetRow, UserRecord, UserRow};
use crate::reply::{BatchOutcome, Reply, ReplyAddress};
use crate::statement::{StatementCache, StatementKind};

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tweets (
        id INTEGER PRIMARY KEY,
        statics BLOB,
        dynamic BLOB,
        author_id INTEGER,
        recipient_id INTEGER,
        flags INTEGER,
        timestamp INTEGER
    );

    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        json BLOB,
        cached_img_url BLOB,
        created_time INTEGER,
        last_update INTEGER
    );

    -- json is reserved; nothing writes it yet.
    CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT,
        json BLOB,
        tweet_ids BLOB,
        dm_ids BLOB
    );
";

/// Whether the executor should keep going after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Continue,
    Stop,
}

/// Running totals kept by whoever drives [`Storage::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStats {
    /// Messages dequeued, batches counted once.
    pub messages: u64,
    /// Commands whose statement failed and was skipped.
    pub failed: u64,
    /// Subset of `failed` abandoned after the busy retry budget.
    pub busy_abandoned: u64,
    /// Replies handed to a reply target.
    pub replies: u64,
}

/// `SQLite` storage manager
pub struct Storage {
    conn: Connection,
    cache: StatementCache,
    busy: BusyPolicy,
    path: PathBuf,
}

// Ids and flags are unsigned on the wire but SQLite integers are signed;
// the casts keep every bit.
#[allow(clippy::cast_possible_wrap)]
const fn to_sql_int(value: u64) -> i64 {
    value as i64
}

#[allow(clippy::cast_sign_loss)]
const fn from_sql_int(value: i64) -> u64 {
    value as u64
}

/// Run `op`, retrying `SQLITE_BUSY`/`SQLITE_LOCKED` with exponential
/// backoff until `policy` is spent.
///
/// # Errors
///
/// Returns [`StoreError::Busy`] with the number of attempts made once the
/// budget is exhausted, or the first non-busy error.
pub fn with_busy_retry<T>(
    policy: &BusyPolicy,
    mut op: impl FnMut() -> rusqlite::Result<T>,
) -> Result<T> {
    let mut retry = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) => {
                let Some(delay) = policy.delay_for(retry) else {
                    let attempts = retry + 1;
                    warn!(attempts, "store stayed busy; giving up on statement");
                    return Err(StoreError::Busy { attempts });
                };
                debug!(retry, delay_ms = delay.as_millis(), "store busy; backing off");
                thread::sleep(delay);
                retry += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn int_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(from_sql_int(row.get::<_, Option<i64>>(idx)?.unwrap_or_default()))
}

fn text_column(row: &Row<'_>, idx: usize, field: &str) -> rusqlite::Result<String> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => codec::decompress_text(bytes, field),
        ValueRef::Null => String::new(),
        ValueRef::Integer(_) | ValueRef::Real(_) => {
            error!(field, "expected a blob column; treating as empty");
            String::new()
        }
    })
}

fn id_set_column(row: &Row<'_>, idx: usize, field: &str) -> rusqlite::Result<BTreeSet<u64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => codec::decompress_id_set(bytes)
            .unwrap_or_else(|e| {
                error!(field, error = %e, "discarding corrupt id set");
                BTreeSet::new()
            }),
        _ => BTreeSet::new(),
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: int_column(row, 0)?,
        json: text_column(row, 1, "users.json")?,
        cached_img_url: text_column(row, 2, "users.cached_img_url")?,
        created_time: row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
        last_update: int_column(row, 4)?,
    })
}

fn read_tweet(
    conn: &Connection,
    cache: &mut StatementCache,
    id: u64,
) -> rusqlite::Result<Option<TweetRow>> {
    cache
        .get(conn, StatementKind::SelectTweet)?
        .query_row([to_sql_int(id)], |row| {
            Ok(TweetRow {
                id,
                statics_json: text_column(row, 0, "tweets.statics")?,
                dyn_json: text_column(row, 1, "tweets.dynamic")?,
                author_id: int_column(row, 2)?,
                recipient_id: int_column(row, 3)?,
                flags: int_column(row, 4)?,
                timestamp: int_column(row, 5)?,
            })
        })
        .optional()
}

impl Storage {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, the schema cannot be
    /// created, or the store was written by a newer schema.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::path_error("create", parent, e))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;

        // Contention is handled by `with_busy_retry`, not by SQLite sleeping.
        conn.busy_handler(None)?;

        if config.wal {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let cache = StatementCache::new(&conn);
        let storage = Self {
            conn,
            cache,
            busy: config.busy_policy(),
            path: path.to_path_buf(),
        };
        storage.migrate()?;
        debug!(path = %path.display(), "store opened");
        Ok(storage)
    }

    /// Open an existing store without modifying it.
    ///
    /// No schema is created, no version is written and the journal mode is
    /// left as found. Every write through the returned `Storage` fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_read_only(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open store at {} read-only", path.display()))?;
        conn.busy_handler(None)?;

        let cache = StatementCache::new(&conn);
        debug!(path = %path.display(), "store opened read-only");
        Ok(Self {
            conn,
            cache,
            busy: config.busy_policy(),
            path: path.to_path_buf(),
        })
    }

    fn migrate(&self) -> Result<()> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: current,
            });
        }

        with_busy_retry(&self.busy, || self.conn.execute_batch(SCHEMA))?;
        if current < SCHEMA_VERSION {
            info!("Initializing store schema version {SCHEMA_VERSION}");
            with_busy_retry(&self.busy, || {
                self.conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)",
                    params![SCHEMA_VERSION.to_string()],
                )
            })?;
        }
        Ok(())
    }

    /// Stored schema version, 0 for a fresh file without a `meta` table.
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be read (busy store, I/O
    /// failure) or the stored value is not a number.
    pub fn schema_version(&self) -> Result<i32> {
        let has_meta: bool = with_busy_retry(&self.busy, || {
            self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meta')",
                [],
                |row| row.get(0),
            )
        })?;
        if !has_meta {
            return Ok(0);
        }

        let value: Option<String> = with_busy_retry(&self.busy, || {
            self.conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'schema_version'",
                    [],
                    |row| row.get(0),
                )
                .optional()
        })?;
        value.map_or(Ok(0), |v| {
            v.parse().map_err(|e| {
                StoreError::with_context(format!("invalid schema_version '{v}' in meta table"), e)
            })
        })
    }

    /// Whether the linked `SQLite` library may be used from several threads.
    #[must_use]
    pub fn library_is_threadsafe(&self) -> bool {
        self.conn
            .query_row(
                "SELECT sqlite_compileoption_used('THREADSAFE=0')",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|single_threaded| single_threaded == 0)
            .unwrap_or(false)
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn statements(&self) -> &StatementCache {
        &self.cache
    }

    #[must_use]
    pub const fn busy_policy(&self) -> BusyPolicy {
        self.busy
    }

    // =========================================================================
    // Message dispatch
    // =========================================================================

    /// Execute one message.
    ///
    /// Failed statements are logged, counted in `stats` and skipped.
    /// Returns [`ExecOutcome::Stop`] for `Quit`.
    pub fn execute(&mut self, message: Message, stats: &mut ExecStats) -> ExecOutcome {
        stats.messages += 1;
        let kind = message.kind();
        trace!(%kind, "executing");

        match self.run_command(message, stats) {
            Ok(flow) => flow,
            Err(e) => {
                note_failure(kind, &e, stats);
                ExecOutcome::Continue
            }
        }
    }

    fn run_command(&mut self, message: Message, stats: &mut ExecStats) -> Result<ExecOutcome> {
        match message {
            Message::InsertTweet(tweet) => self.insert_tweet(&tweet)?,
            Message::UpdateTweetDyn {
                id,
                dyn_json,
                flags,
            } => self.update_tweet_dyn(id, &dyn_json, flags)?,
            Message::UpdateTweetFlags {
                ids,
                set_mask,
                unset_mask,
            } => self.update_tweet_flags(&ids, set_mask, unset_mask)?,
            Message::SelectTweets(request) => self.select_tweets(request, stats)?,
            Message::InsertUser(user) => self.insert_user(&user)?,
            Message::InsertAccount { name, reply_to } => {
                let id = self.insert_account_sync(&name)?;
                if let Some(reply_to) = reply_to {
                    reply_to.send(Reply::AccountInserted { name, id });
                    stats.replies += 1;
                }
            }
            Message::DeleteAccount { id } => self.delete_account(id)?,
            Message::UpdateAccountIdLists {
                id,
                tweet_ids,
                dm_ids,
            } => self.update_account_id_lists(id, &tweet_ids, &dm_ids)?,
            Message::Batch(batch) => return Ok(self.run_batch(batch, stats).1),
            Message::Function(f) => f(self),
            Message::Quit => return Ok(ExecOutcome::Stop),
        }
        Ok(ExecOutcome::Continue)
    }

    /// Run a batch inside one transaction. Nested batches share the
    /// outermost transaction.
    fn run_batch(&mut self, batch: BatchList, stats: &mut ExecStats) -> (BatchOutcome, ExecOutcome) {
        let BatchList { messages, ack } = batch;
        let mut outcome = BatchOutcome::default();
        let mut flow = ExecOutcome::Continue;

        if let Err(e) = self.begin() {
            note_failure(MessageKind::Batch, &e, stats);
            outcome.failed = messages.len();
            outcome.first_error = Some(e.to_string());
            send_ack(ack, outcome.clone(), stats);
            return (outcome, flow);
        }

        for message in messages {
            let kind = message.kind();
            if let Message::Batch(inner) = message {
                let (nested, nested_flow) = self.run_batch(inner, stats);
                outcome.executed += nested.executed;
                outcome.failed += nested.failed;
                if outcome.first_error.is_none() {
                    outcome.first_error = nested.first_error;
                }
                if nested_flow == ExecOutcome::Stop {
                    flow = ExecOutcome::Stop;
                    break;
                }
                continue;
            }
            match self.run_command(message, stats) {
                Ok(ExecOutcome::Continue) => outcome.executed += 1,
                Ok(ExecOutcome::Stop) => {
                    flow = ExecOutcome::Stop;
                    break;
                }
                Err(e) => {
                    note_failure(kind, &e, stats);
                    outcome.record_failure(format!("{kind}: {e}"));
                }
            }
        }

        if let Err(e) = self.commit() {
            note_failure(MessageKind::Batch, &e, stats);
            outcome.failed += outcome.executed;
            outcome.executed = 0;
            outcome.first_error = Some(e.to_string());
        }

        send_ack(ack, outcome.clone(), stats);
        (outcome, flow)
    }

    fn begin(&mut self) -> Result<()> {
        let (conn, cache) = (&self.conn, &mut self.cache);
        with_busy_retry(&self.busy, || cache.begin(conn))
    }

    /// Commit, rolling back if the commit cannot complete.
    fn commit(&mut self) -> Result<()> {
        let (conn, cache) = (&self.conn, &mut self.cache);
        match with_busy_retry(&self.busy, || cache.commit(conn)) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(rb) = cache.rollback(conn) {
                    error!(error = %rb, "rollback after failed commit also failed");
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// # Errors
    ///
    /// Returns an error if the row cannot be written (e.g. duplicate id).
    pub fn insert_tweet(&mut self, tweet: &TweetRecord) -> Result<()> {
        let statics = codec::compress(tweet.statics_json.as_bytes(), Dictionary::Json)?;
        let dynamic = codec::compress(tweet.dyn_json.as_bytes(), Dictionary::Json)?;
        let (conn, cache) = (&self.conn, &mut self.cache);
        with_busy_retry(&self.busy, || {
            cache.get(conn, StatementKind::InsertTweet)?.execute(params![
                to_sql_int(tweet.id),
                &statics,
                &dynamic,
                to_sql_int(tweet.author_id),
                to_sql_int(tweet.recipient_id),
                to_sql_int(tweet.flags),
                to_sql_int(tweet.timestamp),
            ])
        })?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn update_tweet_dyn(&mut self, id: u64, dyn_json: &str, flags: u64) -> Result<()> {
        let dynamic = codec::compress(dyn_json.as_bytes(), Dictionary::Json)?;
        let (conn, cache) = (&self.conn, &mut self.cache);
        with_busy_retry(&self.busy, || {
            cache.get(conn, StatementKind::UpdateTweetDyn)?.execute(params![
                &dynamic,
                to_sql_int(flags),
                to_sql_int(id)
            ])
        })?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the first failing update; earlier ids stay updated.
    pub fn update_tweet_flags(
        &mut self,
        ids: &BTreeSet<u64>,
        set_mask: u64,
        unset_mask: u64,
    ) -> Result<()> {
        let (conn, cache) = (&self.conn, &mut self.cache);
        for &id in ids {
            with_busy_retry(&self.busy, || {
                cache.get(conn, StatementKind::UpdateTweetFlags)?.execute(params![
                    to_sql_int(set_mask),
                    to_sql_int(unset_mask),
                    to_sql_int(id)
                ])
            })?;
        }
        Ok(())
    }

    /// Look up every requested id and reply with the rows found.
    ///
    /// Nothing is sent when no row matched unless the request asks for an
    /// empty reply. A failing lookup is reported after the reply goes out.
    fn select_tweets(&mut self, request: SelectRequest, stats: &mut ExecStats) -> Result<()> {
        let SelectRequest {
            ids,
            reply_to,
            reply_when_empty,
        } = request;

        let mut rows = Vec::with_capacity(ids.len());
        let mut first_error = None;
        for id in ids {
            let (conn, cache) = (&self.conn, &mut self.cache);
            match with_busy_retry(&self.busy, || read_tweet(conn, cache, id)) {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(e) => {
                    warn!(id, error = %e, "tweet lookup failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if rows.is_empty() && !reply_when_empty {
            trace!(tag = reply_to.tag(), "select matched nothing; no reply");
        } else {
            reply_to.send(Reply::Tweets(rows));
            stats.replies += 1;
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Insert or replace a user row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn insert_user(&mut self, user: &UserRecord) -> Result<()> {
        let json = codec::compress(user.json.as_bytes(), Dictionary::Json)?;
        let img = codec::compress(user.cached_img_url.as_bytes(), Dictionary::ProfileImage)?;
        let (conn, cache) = (&self.conn, &mut self.cache);
        with_busy_retry(&self.busy, || {
            cache.get(conn, StatementKind::InsertUser)?.execute(params![
                to_sql_int(user.id),
                &json,
                &img,
                user.created_time,
                to_sql_int(user.last_update),
            ])
        })?;
        Ok(())
    }

    /// Insert an account row, returning the id the store assigned.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert_account_sync(&mut self, name: &str) -> Result<i64> {
        let (conn, cache) = (&self.conn, &mut self.cache);
        with_busy_retry(&self.busy, || {
            cache.get(conn, StatementKind::InsertAccount)?.execute([name])?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_account(&mut self, id: i64) -> Result<()> {
        let (conn, cache) = (&self.conn, &mut self.cache);
        with_busy_retry(&self.busy, || {
            cache.get(conn, StatementKind::DeleteAccount)?.execute([id])
        })?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn update_account_id_lists(
        &mut self,
        id: i64,
        tweet_ids: &BTreeSet<u64>,
        dm_ids: &BTreeSet<u64>,
    ) -> Result<()> {
        let tweets = codec::compress_id_set(tweet_ids)?;
        let dms = codec::compress_id_set(dm_ids)?;
        let (conn, cache) = (&self.conn, &mut self.cache);
        with_busy_retry(&self.busy, || {
            cache
                .get(conn, StatementKind::UpdateAccountIdLists)?
                .execute(params![&tweets, &dms, id])
        })?;
        Ok(())
    }

    // =========================================================================
    // Synchronous helpers (startup, shutdown, inspection)
    // =========================================================================

    /// Every stored user row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails. Corrupt blobs load as empty
    /// fields.
    pub fn load_users(&self) -> Result<Vec<UserRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, json, cached_img_url, created_time, last_update FROM users")?;
        let rows = stmt
            .query_map([], user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(count = rows.len(), "loaded users");
        Ok(rows)
    }

    /// Every stored account row, id sets decoded.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn load_accounts(&self) -> Result<Vec<AccountRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, tweet_ids, dm_ids FROM accounts ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AccountRow {
                    id: row.get(0)?,
                    name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    tweet_ids: id_set_column(row, 2, "accounts.tweet_ids")?,
                    dm_ids: id_set_column(row, 3, "accounts.dm_ids")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Upsert `users` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the transaction is rolled back.
    pub fn write_back_users(&mut self, users: &[UserRecord]) -> Result<usize> {
        if users.is_empty() {
            return Ok(0);
        }
        self.begin()?;
        for user in users {
            if let Err(e) = self.insert_user(user) {
                self.abandon_transaction();
                return Err(e);
            }
        }
        self.commit()?;
        Ok(users.len())
    }

    /// Write the id sets of every account that has a row, in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the transaction is rolled back.
    pub fn write_account_id_lists<'a>(
        &mut self,
        accounts: impl IntoIterator<Item = &'a Account>,
    ) -> Result<usize> {
        self.begin()?;
        let mut written = 0;
        for account in accounts {
            let Some(id) = account.db_index else {
                continue;
            };
            if let Err(e) = self.update_account_id_lists(id, &account.tweet_ids, &account.dm_ids) {
                self.abandon_transaction();
                return Err(e);
            }
            written += 1;
        }
        self.commit()?;
        Ok(written)
    }

    fn abandon_transaction(&mut self) {
        if let Err(e) = self.cache.rollback(&self.conn) {
            error!(error = %e, "rollback failed");
        }
    }

    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn get_tweet(&mut self, id: u64) -> Result<Option<TweetRow>> {
        let (conn, cache) = (&self.conn, &mut self.cache);
        with_busy_retry(&self.busy, || read_tweet(conn, cache, id))
    }

    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn get_user(&self, id: u64) -> Result<Option<UserRow>> {
        with_busy_retry(&self.busy, || {
            self.conn
                .query_row(
                    "SELECT id, json, cached_img_url, created_time, last_update \
                     FROM users WHERE id = ?1",
                    [to_sql_int(id)],
                    user_from_row,
                )
                .optional()
        })
    }

    /// Row counts per table.
    ///
    /// # Errors
    ///
    /// Returns an error if any count fails.
    pub fn counts(&self) -> Result<StoreCounts> {
        let count = |table: &str| -> Result<i64> {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            with_busy_retry(&self.busy, || self.conn.query_row(&sql, [], |row| row.get(0)))
        };
        Ok(StoreCounts {
            tweets: count("tweets")?,
            users: count("users")?,
            accounts: count("accounts")?,
        })
    }

    /// Dispose every statement and close the connection.
    ///
    /// Dropping a `Storage` also releases everything, but swallows close
    /// errors.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` refuses to close the connection.
    pub fn close(self) -> Result<()> {
        let Self {
            conn,
            mut cache,
            path,
            ..
        } = self;
        if cache.transaction_depth() > 0 {
            warn!("closing store with an open transaction; rolling back");
            if let Err(e) = cache.rollback(&conn) {
                error!(error = %e, "rollback on close failed");
            }
        }
        cache.dispose_all(&conn);
        conn.close().map_err(|(_, e)| StoreError::from(e))?;
        debug!(path = %path.display(), "store closed");
        Ok(())
    }
}

fn note_failure(kind: MessageKind, err: &StoreError, stats: &mut ExecStats) {
    stats.failed += 1;
    if matches!(err, StoreError::Busy { .. }) {
        stats.busy_abandoned += 1;
    }
    error!(message = %kind, error = %err, "store command failed; skipped");
}

fn send_ack(ack: Option<ReplyAddress>, outcome: BatchOutcome, stats: &mut ExecStats) {
    if let Some(ack) = ack {
        ack.send(Reply::BatchAck(outcome));
        stats.replies += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ReplyQueue;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("store.sqlite3"), &StoreConfig::default()).unwrap();
        (dir, storage)
    }

    fn tweet(id: u64) -> TweetRecord {
        TweetRecord {
            id,
            statics_json: format!(r#"{{"text":"tweet number {id}","source":"web"}}"#),
            dyn_json: r#"{"favorited":false}"#.repeat(8),
            author_id: 100 + id,
            recipient_id: 0,
            flags: 1,
            timestamp: 1_300_000_000 + id,
        }
    }

    #[test]
    fn test_open_creates_schema_once() {
        let (dir, storage) = open_temp();
        assert_eq!(storage.schema_version().unwrap(), SCHEMA_VERSION);
        storage.close().unwrap();

        let again = Storage::open(dir.path().join("store.sqlite3"), &StoreConfig::default()).unwrap();
        assert_eq!(again.counts().unwrap(), StoreCounts::default());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let (dir, storage) = open_temp();
        storage
            .connection()
            .execute("UPDATE meta SET value = '99' WHERE key = 'schema_version'", [])
            .unwrap();
        storage.close().unwrap();

        let result = Storage::open(dir.path().join("store.sqlite3"), &StoreConfig::default());
        assert!(matches!(
            result,
            Err(StoreError::SchemaMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn test_unreadable_version_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.sqlite3");
        let config = StoreConfig {
            busy_initial_delay_ms: 1,
            busy_max_retries: 3,
            busy_max_delay_ms: 1,
            wal: false,
            ..StoreConfig::default()
        };
        let storage = Storage::open(&path, &config).unwrap();
        storage
            .connection()
            .execute("UPDATE meta SET value = '99' WHERE key = 'schema_version'", [])
            .unwrap();
        storage.close().unwrap();

        // Rollback journal: an exclusive lock blocks readers too.
        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let result = Storage::open(&path, &config);
        assert!(matches!(result, Err(StoreError::Busy { attempts: 4 })));
        other.execute_batch("ROLLBACK").unwrap();

        let result = Storage::open(&path, &config);
        assert!(matches!(
            result,
            Err(StoreError::SchemaMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn test_garbage_version_is_an_error() {
        let (_dir, storage) = open_temp();
        storage
            .connection()
            .execute("UPDATE meta SET value = 'v2' WHERE key = 'schema_version'", [])
            .unwrap();
        assert!(matches!(
            storage.schema_version(),
            Err(StoreError::WithContext { .. })
        ));
    }

    #[test]
    fn test_read_only_open_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foreign.sqlite3");
        let foreign = Connection::open(&path).unwrap();
        foreign
            .execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);")
            .unwrap();
        drop(foreign);

        let mut storage = Storage::open_read_only(&path, &StoreConfig::default()).unwrap();
        assert_eq!(storage.schema_version().unwrap(), 0);
        assert!(storage.insert_account_sync("main").is_err());
        storage.close().unwrap();

        let check = Connection::open(&path).unwrap();
        let tables: Vec<String> = check
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(tables, vec!["notes".to_string()]);
        let mode: String = check
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "delete");
    }

    #[test]
    fn test_bundled_library_is_threadsafe() {
        let (_dir, storage) = open_temp();
        assert!(storage.library_is_threadsafe());
    }

    #[test]
    fn test_insert_then_select_replies_with_row() {
        let (_dir, mut storage) = open_temp();
        let (queue, inbox) = ReplyQueue::new();
        let mut stats = ExecStats::default();

        storage.execute(Message::InsertTweet(tweet(42)), &mut stats);
        storage.execute(
            Message::SelectTweets(SelectRequest::new([42, 43], queue.address(7))),
            &mut stats,
        );

        let delivery = inbox.try_recv().unwrap();
        assert_eq!(delivery.tag, 7);
        assert_eq!(delivery.reply, Reply::Tweets(vec![tweet(42)]));
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.replies, 1);
    }

    #[test]
    fn test_empty_select_is_silent_unless_asked() {
        let (_dir, mut storage) = open_temp();
        let (queue, inbox) = ReplyQueue::new();
        let mut stats = ExecStats::default();

        storage.execute(
            Message::SelectTweets(SelectRequest::new([1], queue.address(1))),
            &mut stats,
        );
        assert!(inbox.try_recv().is_none());

        storage.execute(
            Message::SelectTweets(SelectRequest::new([1], queue.address(2)).reply_when_empty(true)),
            &mut stats,
        );
        let delivery = inbox.try_recv().unwrap();
        assert_eq!(delivery.tag, 2);
        assert_eq!(delivery.reply, Reply::Tweets(Vec::new()));
    }

    #[test]
    fn test_updates_touch_only_mutable_part() {
        let (_dir, mut storage) = open_temp();
        let mut stats = ExecStats::default();
        storage.execute(Message::InsertTweet(tweet(5)), &mut stats);
        storage.execute(
            Message::UpdateTweetDyn {
                id: 5,
                dyn_json: r#"{"favorited":true}"#.to_string(),
                flags: 6,
            },
            &mut stats,
        );
        storage.execute(
            Message::UpdateTweetFlags {
                ids: [5, 999].into_iter().collect(),
                set_mask: 1,
                unset_mask: 4,
            },
            &mut stats,
        );

        let row = storage.get_tweet(5).unwrap().unwrap();
        assert_eq!(row.statics_json, tweet(5).statics_json);
        assert_eq!(row.dyn_json, r#"{"favorited":true}"#);
        assert_eq!(row.flags, 3);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_duplicate_insert_is_counted_and_skipped() {
        let (_dir, mut storage) = open_temp();
        let mut stats = ExecStats::default();
        storage.execute(Message::InsertTweet(tweet(1)), &mut stats);
        let outcome = storage.execute(Message::InsertTweet(tweet(1)), &mut stats);
        assert_eq!(outcome, ExecOutcome::Continue);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.busy_abandoned, 0);
        assert_eq!(storage.counts().unwrap().tweets, 1);
    }

    #[test]
    fn test_large_ids_keep_every_bit() {
        let (_dir, mut storage) = open_temp();
        let record = TweetRecord {
            id: u64::MAX,
            statics_json: r#"{"text":"top of the range"}"#.to_string(),
            dyn_json: "{}".to_string(),
            author_id: u64::MAX - 1,
            recipient_id: u64::MAX,
            flags: 1 << 63,
            timestamp: u64::MAX,
        };
        storage.insert_tweet(&record).unwrap();
        assert_eq!(storage.get_tweet(u64::MAX).unwrap(), Some(record));
    }

    #[test]
    fn test_user_upsert_replaces_row() {
        let (_dir, mut storage) = open_temp();
        let mut user = UserRecord {
            id: 9,
            json: r#"{"screen_name":"nine"}"#.to_string(),
            cached_img_url: "https://si0.twimg.com/profile_images/9/normal.png".to_string(),
            created_time: 1_200_000_000,
            last_update: 10,
        };
        storage.insert_user(&user).unwrap();
        user.last_update = 11;
        storage.insert_user(&user).unwrap();

        assert_eq!(storage.counts().unwrap().users, 1);
        assert_eq!(storage.get_user(9).unwrap(), Some(user.clone()));
        assert_eq!(storage.load_users().unwrap(), vec![user]);
    }

    #[test]
    fn test_account_lifecycle() {
        let (_dir, mut storage) = open_temp();
        let (queue, inbox) = ReplyQueue::new();
        let mut stats = ExecStats::default();

        storage.execute(
            Message::InsertAccount {
                name: "main".to_string(),
                reply_to: Some(queue.address(3)),
            },
            &mut stats,
        );
        let Reply::AccountInserted { name, id } = inbox.try_recv().unwrap().reply else {
            panic!("expected account reply");
        };
        assert_eq!(name, "main");

        let tweet_ids: BTreeSet<u64> = [18_446_744_073_709_551_615, 300, 5].into_iter().collect();
        storage.execute(
            Message::UpdateAccountIdLists {
                id,
                tweet_ids: tweet_ids.clone(),
                dm_ids: BTreeSet::new(),
            },
            &mut stats,
        );
        let rows = storage.load_accounts().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tweet_ids, tweet_ids);
        assert!(rows[0].dm_ids.is_empty());

        storage.execute(Message::DeleteAccount { id }, &mut stats);
        assert!(storage.load_accounts().unwrap().is_empty());
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_batch_commits_and_acks() {
        let (_dir, mut storage) = open_temp();
        let (queue, inbox) = ReplyQueue::new();
        let mut stats = ExecStats::default();

        let mut batch = BatchList::new().with_ack(queue.address(11));
        batch.push(Message::InsertTweet(tweet(1)));
        batch.push(Message::InsertTweet(tweet(2)));
        storage.execute(batch.into(), &mut stats);

        assert!(storage.connection().is_autocommit());
        assert_eq!(storage.counts().unwrap().tweets, 2);
        let delivery = inbox.try_recv().unwrap();
        assert_eq!(delivery.tag, 11);
        assert_eq!(
            delivery.reply,
            Reply::BatchAck(BatchOutcome {
                executed: 2,
                failed: 0,
                first_error: None
            })
        );
    }

    #[test]
    fn test_uncommitted_batch_leaves_nothing() {
        let (dir, mut storage) = open_temp();
        let mut stats = ExecStats::default();

        storage.begin().unwrap();
        storage.execute(Message::InsertTweet(tweet(1)), &mut stats);
        storage.execute(Message::InsertTweet(tweet(2)), &mut stats);
        // Connection goes away mid-transaction.
        drop(storage);

        let mut reopened =
            Storage::open(dir.path().join("store.sqlite3"), &StoreConfig::default()).unwrap();
        assert!(reopened.get_tweet(1).unwrap().is_none());
        assert!(reopened.get_tweet(2).unwrap().is_none());
    }

    #[test]
    fn test_batch_failure_does_not_roll_back() {
        let (_dir, mut storage) = open_temp();
        let (queue, inbox) = ReplyQueue::new();
        let mut stats = ExecStats::default();

        let mut batch = BatchList::new().with_ack(queue.address(1));
        batch.push(Message::InsertTweet(tweet(1)));
        batch.push(Message::InsertTweet(tweet(1)));
        batch.push(Message::InsertTweet(tweet(2)));
        storage.execute(batch.into(), &mut stats);

        assert_eq!(storage.counts().unwrap().tweets, 2);
        assert_eq!(stats.failed, 1);
        let Reply::BatchAck(outcome) = inbox.try_recv().unwrap().reply else {
            panic!("expected batch ack");
        };
        assert_eq!(outcome.executed, 2);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.first_error.unwrap().starts_with("insert_tweet"));
    }

    #[test]
    fn test_nested_batches_share_one_transaction() {
        let (_dir, mut storage) = open_temp();
        let mut stats = ExecStats::default();
        let saw_depth = Arc::new(AtomicBool::new(false));
        let probe = Arc::clone(&saw_depth);

        let mut inner = BatchList::new();
        inner.push(Message::InsertTweet(tweet(2)));
        inner.push(Message::function(move |s: &mut Storage| {
            probe.store(
                s.statements().transaction_depth() == 2 && !s.connection().is_autocommit(),
                Ordering::SeqCst,
            );
        }));
        let mut outer = BatchList::new();
        outer.push(Message::InsertTweet(tweet(1)));
        outer.push(inner.into());
        storage.execute(outer.into(), &mut stats);

        assert!(saw_depth.load(Ordering::SeqCst));
        assert!(storage.connection().is_autocommit());
        assert_eq!(storage.counts().unwrap().tweets, 2);
    }

    #[test]
    fn test_quit_stops_and_quit_inside_batch_still_commits() {
        let (_dir, mut storage) = open_temp();
        let mut stats = ExecStats::default();
        assert_eq!(storage.execute(Message::Quit, &mut stats), ExecOutcome::Stop);

        let mut batch = BatchList::new();
        batch.push(Message::InsertTweet(tweet(1)));
        batch.push(Message::Quit);
        batch.push(Message::InsertTweet(tweet(2)));
        assert_eq!(storage.execute(batch.into(), &mut stats), ExecOutcome::Stop);
        assert_eq!(storage.counts().unwrap().tweets, 1);
        assert!(storage.connection().is_autocommit());
    }

    #[test]
    fn test_corrupt_column_reads_as_empty() {
        let (_dir, mut storage) = open_temp();
        storage.insert_tweet(&tweet(3)).unwrap();
        storage
            .connection()
            .execute("UPDATE tweets SET statics = X'5800010203' WHERE id = 3", [])
            .unwrap();
        let row = storage.get_tweet(3).unwrap().unwrap();
        assert_eq!(row.statics_json, "");
        assert_eq!(row.dyn_json, tweet(3).dyn_json);
    }

    #[test]
    fn test_busy_retry_gives_up_after_budget() {
        let (dir, storage) = open_temp();
        let other = Connection::open(dir.path().join("store.sqlite3")).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let policy = BusyPolicy {
            initial: Duration::from_millis(1),
            max_retries: 20,
            max_delay: Duration::from_millis(2),
        };
        let mut calls = 0;
        let result = with_busy_retry(&policy, || {
            calls += 1;
            storage
                .connection()
                .execute("INSERT INTO meta (key, value) VALUES ('k', 'v')", [])
        });

        assert!(matches!(result, Err(StoreError::Busy { attempts: 21 })));
        assert_eq!(calls, 21);
        other.execute_batch("ROLLBACK").unwrap();
    }

    #[test]
    fn test_close_surfaces_nothing_on_clean_store() {
        let (_dir, mut storage) = open_temp();
        storage.insert_tweet(&tweet(1)).unwrap();
        assert!(storage.statements().prepared_count() > 0);
        storage.close().unwrap();
    }
}
