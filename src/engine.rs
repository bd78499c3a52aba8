//! The front door: the one object the application talks to.
//!
//! [`Engine::init`] opens the store, loads users and accounts on the calling
//! thread, and starts the background worker when the linked `SQLite` library
//! is thread-safe. Every later call either enqueues a [`Message`] or, in
//! synchronous mode, executes it immediately on the front door's own
//! connection. [`Engine::shutdown`] stops the worker and writes the
//! in-memory state back.
//!
//! ```rust,no_run
//! use tweetstore::{Config, Engine, ReplyQueue, SelectRequest};
//!
//! let config = Config::for_path("/tmp/tweets.sqlite3");
//! let mut engine = Engine::init(&config, &["main".to_string()])?;
//! let (queue, inbox) = ReplyQueue::new();
//! engine.select_tweets(SelectRequest::new([42], queue.address(1)))?;
//! engine.shutdown()?;
//! # Ok::<(), tweetstore::StoreError>(())
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::channel::{ChannelSender, MessageSender, channel};
use crate::config::{Config, ThreadingMode};
use crate::error::{Result, StoreError};
use crate::logging::OperationGuard;
use crate::message::{BatchList, Message, SelectRequest};
use crate::model::{Account, TweetRecord, UserProfile, UserRecord};
use crate::reply::ReplyAddress;
use crate::storage::{ExecStats, Storage};
use crate::worker::{Worker, WorkerState, WorkerStats};

/// What [`Engine::shutdown`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Final worker totals, `None` in synchronous mode.
    pub worker: Option<WorkerStats>,
    /// Dirty user profiles written back.
    pub users_written: usize,
    /// Accounts whose id sets were written back.
    pub accounts_written: usize,
}

/// Connection facade owning the in-memory users and accounts.
pub struct Engine {
    path: PathBuf,
    /// Front door connection. `None` once shut down.
    store: Option<Storage>,
    sender: Option<ChannelSender>,
    worker: Option<Worker>,
    sync_stats: ExecStats,
    users: HashMap<u64, UserProfile>,
    accounts: Vec<Account>,
    pending: BatchList,
}

impl Engine {
    /// Open the store and start the engine.
    ///
    /// `account_names` are the configured accounts; any without a stored
    /// row get one now.
    ///
    /// # Errors
    ///
    /// Any failure here aborts startup: the store cannot be opened, the
    /// schema is newer than this build, the initial load fails, or the
    /// worker cannot be started.
    pub fn init(config: &Config, account_names: &[String]) -> Result<Self> {
        let guard = OperationGuard::new("store init");
        match Self::start(config, account_names) {
            Ok(engine) => {
                guard.complete();
                Ok(engine)
            }
            Err(e) => {
                guard.fail(&e);
                Err(e)
            }
        }
    }

    fn start(config: &Config, account_names: &[String]) -> Result<Self> {
        let path = config.db_path();
        let mut store = Storage::open(&path, &config.store)?;

        let users: HashMap<u64, UserProfile> = store
            .load_users()?
            .into_iter()
            .map(|row| (row.id, UserProfile::from_row(row)))
            .collect();
        let accounts = reconcile_accounts(&mut store, account_names)?;

        let threadsafe = store.library_is_threadsafe();
        if !threadsafe {
            warn!("SQLite library is not thread-safe; store commands will run synchronously");
        }
        let threaded = threadsafe && config.store.threading == ThreadingMode::Auto;

        let (sender, worker) = if threaded {
            let worker_store = Storage::open(&path, &config.store)?;
            let (tx, rx) = channel();
            let worker = Worker::spawn(worker_store, rx, &config.worker.thread_name)?;
            (Some(tx), Some(worker))
        } else {
            (None, None)
        };

        info!(
            path = %path.display(),
            users = users.len(),
            accounts = accounts.len(),
            threaded,
            "store ready"
        );

        Ok(Self {
            path,
            store: Some(store),
            sender,
            worker,
            sync_stats: ExecStats::default(),
            users,
            accounts,
            pending: BatchList::new(),
        })
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Whether commands go through the background worker.
    #[must_use]
    pub const fn is_threaded(&self) -> bool {
        self.worker.is_some()
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Totals for whichever side executes commands.
    #[must_use]
    pub fn worker_stats(&self) -> WorkerStats {
        self.worker
            .as_ref()
            .map_or(self.sync_stats, Worker::stats)
    }

    #[must_use]
    pub fn worker_state(&self) -> Option<WorkerState> {
        self.worker.as_ref().map(Worker::state)
    }

    #[must_use]
    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    #[must_use]
    pub fn account(&self, name: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.name == name)
    }

    pub fn account_mut(&mut self, name: &str) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.name == name)
    }

    #[must_use]
    pub const fn users(&self) -> &HashMap<u64, UserProfile> {
        &self.users
    }

    #[must_use]
    pub fn user(&self, id: u64) -> Option<&UserProfile> {
        self.users.get(&id)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Hand a message to the worker, or run it now in synchronous mode.
    ///
    /// Sending [`Message::Quit`] stops the worker early; use
    /// [`shutdown`](Self::shutdown) instead.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotReady`] after shutdown and
    /// [`StoreError::ChannelClosed`] if the worker is gone.
    pub fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        if let Some(sender) = &self.sender {
            return sender.send(message);
        }
        let store = self.store.as_mut().ok_or(StoreError::NotReady)?;
        store.execute(message, &mut self.sync_stats);
        Ok(())
    }

    /// Append to `batch` when one is given, send otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn send_or_batch(&mut self, message: Message, batch: Option<&mut BatchList>) -> Result<()> {
        match batch {
            Some(batch) => {
                batch.push(message);
                Ok(())
            }
            None => self.send(message),
        }
    }

    /// Queue `message` on the engine's own pending batch.
    pub fn send_batched(&mut self, message: Message) {
        self.pending.push(message);
    }

    /// Send the pending batch as one message. Returns how many messages it
    /// held.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn flush_batched(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.pending);
        let len = batch.len();
        self.send(batch)?;
        Ok(len)
    }

    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn insert_tweet(&mut self, tweet: TweetRecord, batch: Option<&mut BatchList>) -> Result<()> {
        self.send_or_batch(Message::InsertTweet(tweet), batch)
    }

    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn update_tweet_dyn(
        &mut self,
        id: u64,
        dyn_json: impl Into<String>,
        flags: u64,
        batch: Option<&mut BatchList>,
    ) -> Result<()> {
        let message = Message::UpdateTweetDyn {
            id,
            dyn_json: dyn_json.into(),
            flags,
        };
        self.send_or_batch(message, batch)
    }

    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn update_tweet_flags(
        &mut self,
        ids: BTreeSet<u64>,
        set_mask: u64,
        unset_mask: u64,
        batch: Option<&mut BatchList>,
    ) -> Result<()> {
        let message = Message::UpdateTweetFlags {
            ids,
            set_mask,
            unset_mask,
        };
        self.send_or_batch(message, batch)
    }

    /// Look up tweets; rows arrive at `request.reply_to`.
    ///
    /// The reply is delivered through the address even in synchronous mode.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn select_tweets(&mut self, request: SelectRequest) -> Result<()> {
        self.send(Message::SelectTweets(request))
    }

    /// Store `profile` unless the store already holds the same content.
    ///
    /// Returns whether an upsert was issued. The in-memory copy is
    /// replaced either way.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn insert_user(&mut self, profile: UserProfile, batch: Option<&mut BatchList>) -> Result<bool> {
        let mut profile = profile;
        if let Some(existing) = self.users.get(&profile.id) {
            if existing.same_content(&profile) && !existing.is_dirty() && existing.last_written > 0 {
                debug!(user = profile.id, "user unchanged since last write; skipping");
                return Ok(false);
            }
            profile.last_update = profile.last_update.max(existing.last_update);
            profile.last_written = existing.last_written;
        }

        profile.mark_updated();
        profile.last_written = profile.last_update;
        let record = profile.to_record();
        self.users.insert(profile.id, profile);
        self.send_or_batch(Message::InsertUser(record), batch)?;
        Ok(true)
    }

    /// Update the in-memory profile only. Dirty profiles are written at
    /// shutdown or by [`write_back_state_async`](Self::write_back_state_async).
    pub fn stage_user(&mut self, profile: UserProfile) {
        let mut profile = profile;
        if let Some(existing) = self.users.get(&profile.id) {
            if existing.same_content(&profile) {
                return;
            }
            profile.last_update = profile.last_update.max(existing.last_update);
            profile.last_written = existing.last_written;
        }
        profile.mark_updated();
        self.users.insert(profile.id, profile);
    }

    /// Add an account. Its row id arrives as `Reply::AccountInserted` at
    /// `reply_to`; pass it to
    /// [`apply_account_inserted`](Self::apply_account_inserted).
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn insert_account(&mut self, name: impl Into<String>, reply_to: ReplyAddress) -> Result<()> {
        let name = name.into();
        self.accounts.push(Account::new(name.clone()));
        self.send(Message::InsertAccount {
            name,
            reply_to: Some(reply_to),
        })
    }

    /// Record the row id assigned to a new account. Returns `false` if no
    /// unassigned account has that name.
    pub fn apply_account_inserted(&mut self, name: &str, id: i64) -> bool {
        match self
            .accounts
            .iter_mut()
            .find(|a| a.name == name && a.db_index.is_none())
        {
            Some(account) => {
                account.db_index = Some(id);
                true
            }
            None => {
                warn!(name, id, "account insert reply for unknown account");
                false
            }
        }
    }

    /// Delete the account row `id` and forget the account in memory.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn delete_account(&mut self, id: i64) -> Result<()> {
        self.accounts.retain(|a| a.db_index != Some(id));
        self.send(Message::DeleteAccount { id })
    }

    /// Persist a copy of `name`'s current id sets. Returns `false` if the
    /// account is unknown or has no row yet.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn update_account_id_lists(&mut self, name: &str, batch: Option<&mut BatchList>) -> Result<bool> {
        let Some(message) = self.account(name).and_then(id_lists_message) else {
            warn!(name, "no stored row for account; id lists not written");
            return Ok(false);
        };
        self.send_or_batch(message, batch)?;
        Ok(true)
    }

    /// Run `f` against the executing connection, in order with other
    /// messages.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn run_on_store(&mut self, f: impl FnOnce(&mut Storage) + Send + 'static) -> Result<()> {
        self.send(Message::function(f))
    }

    /// Queue one batch holding every dirty user and every account's id
    /// sets. Returns the number of messages in it.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn write_back_state_async(&mut self, ack: Option<ReplyAddress>) -> Result<usize> {
        let mut batch = BatchList::new();
        batch.ack = ack;
        for record in self.take_dirty_users() {
            batch.push(Message::InsertUser(record));
        }
        for message in self.accounts.iter().filter_map(id_lists_message) {
            batch.push(message);
        }
        let len = batch.len();
        self.send(batch)?;
        Ok(len)
    }

    /// Dirty, meaningful profiles as records, marked written.
    fn take_dirty_users(&mut self) -> Vec<UserRecord> {
        let mut records: Vec<UserRecord> = self
            .users
            .values_mut()
            .filter(|u| u.is_dirty() && u.has_content())
            .map(|u| {
                u.last_written = u.last_update;
                u.to_record()
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the worker, write back users and accounts, close both
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns the first failure; later steps still run.
    pub fn shutdown(mut self) -> Result<ShutdownReport> {
        self.finish()
    }

    fn finish(&mut self) -> Result<ShutdownReport> {
        if let Err(e) = self.flush_batched() {
            error!(error = %e, "failed to flush pending batch at shutdown");
        }
        let Some(mut store) = self.store.take() else {
            return Err(StoreError::NotReady);
        };
        let guard = OperationGuard::new("store shutdown");
        let mut report = ShutdownReport::default();
        let mut first_error: Option<StoreError> = None;

        if let Some(sender) = self.sender.take() {
            if let Err(e) = sender.send(Message::Quit) {
                warn!(error = %e, "worker already gone at shutdown");
            }
        }
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(stats) => report.worker = Some(stats),
                Err(e) => {
                    error!(error = %e, "store worker did not stop cleanly");
                    first_error = first_error.or(Some(e));
                }
            }
        }

        let dirty = self.take_dirty_users();
        match store.write_back_users(&dirty) {
            Ok(n) => report.users_written = n,
            Err(e) => {
                error!(error = %e, "failed to write back users");
                first_error = first_error.or(Some(e));
            }
        }
        match store.write_account_id_lists(&self.accounts) {
            Ok(n) => report.accounts_written = n,
            Err(e) => {
                error!(error = %e, "failed to write back account id lists");
                first_error = first_error.or(Some(e));
            }
        }
        if let Err(e) = store.close() {
            error!(error = %e, "failed to close store");
            first_error = first_error.or(Some(e));
        }

        match first_error {
            Some(e) => {
                guard.fail(&e);
                Err(e)
            }
            None => {
                info!(
                    users = report.users_written,
                    accounts = report.accounts_written,
                    "store shut down"
                );
                guard.complete();
                Ok(report)
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.store.is_some() {
            if let Err(e) = self.finish() {
                error!(error = %e, "store shutdown on drop failed");
            }
        }
    }
}

fn id_lists_message(account: &Account) -> Option<Message> {
    account.db_index.map(|id| Message::UpdateAccountIdLists {
        id,
        tweet_ids: account.tweet_ids.clone(),
        dm_ids: account.dm_ids.clone(),
    })
}

/// Match configured accounts to stored rows by name, inserting rows for
/// the ones not stored yet.
fn reconcile_accounts(store: &mut Storage, names: &[String]) -> Result<Vec<Account>> {
    let mut rows = store.load_accounts()?;
    let mut accounts = Vec::with_capacity(names.len());
    for name in names {
        if let Some(pos) = rows.iter().position(|row| &row.name == name) {
            accounts.push(Account::from(rows.swap_remove(pos)));
        } else {
            let id = store.insert_account_sync(name)?;
            info!(name = %name, id, "created account row");
            accounts.push(Account {
                db_index: Some(id),
                ..Account::new(name.clone())
            });
        }
    }
    Ok(accounts)
}
