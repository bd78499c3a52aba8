//! Commands understood by the store executor.
//!
//! Building a [`Message`] never touches the store. Ownership moves into the
//! channel on send and into the executor on receive; the executor drops the
//! message once it has run.

use std::collections::BTreeSet;
use std::fmt;

use crate::model::{TweetRecord, UserRecord};
use crate::reply::ReplyAddress;
use crate::storage::Storage;

/// Closure run against whichever connection executes it.
pub type StoreFn = Box<dyn FnOnce(&mut Storage) + Send>;

/// Tweet lookup by id. Missing ids are left out of the reply.
#[derive(Debug, Clone)]
pub struct SelectRequest {
    pub ids: BTreeSet<u64>,
    pub reply_to: ReplyAddress,
    /// Send `Reply::Tweets(vec![])` when nothing matched instead of
    /// staying silent.
    pub reply_when_empty: bool,
}

impl SelectRequest {
    pub fn new(ids: impl IntoIterator<Item = u64>, reply_to: ReplyAddress) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            reply_to,
            reply_when_empty: false,
        }
    }

    #[must_use]
    pub fn reply_when_empty(mut self, yes: bool) -> Self {
        self.reply_when_empty = yes;
        self
    }
}

/// Ordered list of messages executed inside one transaction.
#[derive(Debug, Default)]
pub struct BatchList {
    pub messages: Vec<Message>,
    /// Receives a `Reply::BatchAck` once the batch has run.
    pub ack: Option<ReplyAddress>,
}

impl BatchList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ack(mut self, ack: ReplyAddress) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A single store command.
pub enum Message {
    InsertTweet(TweetRecord),
    /// Rewrite only the mutable part of a tweet.
    UpdateTweetDyn { id: u64, dyn_json: String, flags: u64 },
    /// `flags = (flags | set_mask) & !unset_mask` for every id.
    UpdateTweetFlags {
        ids: BTreeSet<u64>,
        set_mask: u64,
        unset_mask: u64,
    },
    SelectTweets(SelectRequest),
    /// Insert-or-replace.
    InsertUser(UserRecord),
    InsertAccount {
        name: String,
        reply_to: Option<ReplyAddress>,
    },
    DeleteAccount { id: i64 },
    UpdateAccountIdLists {
        id: i64,
        tweet_ids: BTreeSet<u64>,
        dm_ids: BTreeSet<u64>,
    },
    Batch(BatchList),
    Function(StoreFn),
    /// Stop after this message. Anything queued behind it is not run.
    Quit,
}

/// Discriminant of a [`Message`], for logging and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    InsertTweet,
    UpdateTweetDyn,
    UpdateTweetFlags,
    SelectTweets,
    InsertUser,
    InsertAccount,
    DeleteAccount,
    UpdateAccountIdLists,
    Batch,
    Function,
    Quit,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InsertTweet => "insert_tweet",
            Self::UpdateTweetDyn => "update_tweet_dyn",
            Self::UpdateTweetFlags => "update_tweet_flags",
            Self::SelectTweets => "select_tweets",
            Self::InsertUser => "insert_user",
            Self::InsertAccount => "insert_account",
            Self::DeleteAccount => "delete_account",
            Self::UpdateAccountIdLists => "update_account_id_lists",
            Self::Batch => "batch",
            Self::Function => "function",
            Self::Quit => "quit",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::InsertTweet(_) => MessageKind::InsertTweet,
            Self::UpdateTweetDyn { .. } => MessageKind::UpdateTweetDyn,
            Self::UpdateTweetFlags { .. } => MessageKind::UpdateTweetFlags,
            Self::SelectTweets(_) => MessageKind::SelectTweets,
            Self::InsertUser(_) => MessageKind::InsertUser,
            Self::InsertAccount { .. } => MessageKind::InsertAccount,
            Self::DeleteAccount { .. } => MessageKind::DeleteAccount,
            Self::UpdateAccountIdLists { .. } => MessageKind::UpdateAccountIdLists,
            Self::Batch(_) => MessageKind::Batch,
            Self::Function(_) => MessageKind::Function,
            Self::Quit => MessageKind::Quit,
        }
    }

    /// Wrap a closure as a function message.
    pub fn function(f: impl FnOnce(&mut Storage) + Send + 'static) -> Self {
        Self::Function(Box::new(f))
    }
}

impl From<BatchList> for Message {
    fn from(batch: BatchList) -> Self {
        Self::Batch(batch)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsertTweet(t) => f.debug_tuple("InsertTweet").field(&t.id).finish(),
            Self::UpdateTweetDyn { id, flags, .. } => f
                .debug_struct("UpdateTweetDyn")
                .field("id", id)
                .field("flags", flags)
                .finish_non_exhaustive(),
            Self::UpdateTweetFlags {
                ids,
                set_mask,
                unset_mask,
            } => f
                .debug_struct("UpdateTweetFlags")
                .field("ids", &ids.len())
                .field("set_mask", set_mask)
                .field("unset_mask", unset_mask)
                .finish(),
            Self::SelectTweets(req) => f.debug_tuple("SelectTweets").field(req).finish(),
            Self::InsertUser(u) => f.debug_tuple("InsertUser").field(&u.id).finish(),
            Self::InsertAccount { name, .. } => f
                .debug_struct("InsertAccount")
                .field("name", name)
                .finish_non_exhaustive(),
            Self::DeleteAccount { id } => f.debug_struct("DeleteAccount").field("id", id).finish(),
            Self::UpdateAccountIdLists {
                id,
                tweet_ids,
                dm_ids,
            } => f
                .debug_struct("UpdateAccountIdLists")
                .field("id", id)
                .field("tweet_ids", &tweet_ids.len())
                .field("dm_ids", &dm_ids.len())
                .finish(),
            Self::Batch(batch) => f.debug_tuple("Batch").field(batch).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Quit => f.write_str("Quit"),
        }
    }
}
