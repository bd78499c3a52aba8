//! Record shapes persisted by the engine.
//!
//! Row types (`*Record`, `*Row`) are plain owned copies that travel through
//! the message channel. `UserProfile` and `Account` are the in-memory state
//! owned by the producer thread; the worker only ever sees serialized
//! copies of them.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tweet as written by an insert: immutable statics plus the first
/// version of the mutable part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TweetRecord {
    pub id: u64,
    /// Text, source, entities. Written once.
    pub statics_json: String,
    /// Per-account perspective flags, counts. Rewritten on update.
    pub dyn_json: String,
    pub author_id: u64,
    /// Non-zero only for direct messages.
    pub recipient_id: u64,
    pub flags: u64,
    pub timestamp: u64,
}

/// Tweet as read back by a select.
pub type TweetRow = TweetRecord;

/// User row as written by an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: u64,
    pub json: String,
    pub cached_img_url: String,
    pub created_time: i64,
    pub last_update: u64,
}

/// User row as loaded at startup.
pub type UserRow = UserRecord;

/// Profile attributes serialized into the user row's JSON blob.
///
/// Unknown keys survive a load/store cycle through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAttributes {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub screen_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub profile_img_url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub protected: bool,
    pub followers_count: u64,
    pub friends_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// In-memory user profile plus its write-back cursors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub id: u64,
    pub attributes: UserAttributes,
    pub cached_img_url: String,
    pub created_time: i64,
    /// Bumped whenever the profile changes in memory.
    pub last_update: u64,
    /// Value of `last_update` the last time the profile was sent to the store.
    pub last_written: u64,
}

impl UserProfile {
    /// A new, never-written profile.
    #[must_use]
    pub fn new(id: u64, attributes: UserAttributes) -> Self {
        Self {
            id,
            attributes,
            ..Self::default()
        }
    }

    /// Whether the store lags the in-memory profile.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.last_written < self.last_update
    }

    /// Stub profiles (no screen name) are never written back.
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.attributes.screen_name.is_empty()
    }

    /// Whether two profiles carry the same stored content, ignoring cursors.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.attributes == other.attributes
            && self.cached_img_url == other.cached_img_url
            && self.created_time == other.created_time
    }

    /// Advance `last_update`, strictly past both cursors.
    pub fn mark_updated(&mut self) {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        self.last_update = now.max(self.last_update.max(self.last_written) + 1);
    }

    /// Serialize the attributes for the JSON blob.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.attributes).unwrap_or_else(|_| "{}".to_string())
    }

    /// Snapshot for an upsert message.
    #[must_use]
    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            id: self.id,
            json: self.to_json(),
            cached_img_url: self.cached_img_url.clone(),
            created_time: self.created_time,
            last_update: self.last_update,
        }
    }

    /// Rebuild a profile from a stored row. The row is clean by definition.
    ///
    /// Unparseable JSON yields empty attributes.
    #[must_use]
    pub fn from_row(row: UserRow) -> Self {
        let mut attributes: UserAttributes = if row.json.is_empty() {
            UserAttributes::default()
        } else {
            serde_json::from_str(&row.json).unwrap_or_else(|e| {
                tracing::warn!(user = row.id, error = %e, "unparseable user JSON");
                UserAttributes::default()
            })
        };
        if attributes.profile_img_url.is_empty() {
            attributes.profile_img_url.clone_from(&row.cached_img_url);
        }
        Self {
            id: row.id,
            attributes,
            cached_img_url: row.cached_img_url,
            created_time: row.created_time,
            last_update: row.last_update,
            last_written: row.last_update,
        }
    }
}

/// Account row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountRow {
    pub id: i64,
    pub name: String,
    pub tweet_ids: BTreeSet<u64>,
    pub dm_ids: BTreeSet<u64>,
}

/// In-memory account state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    /// Row id, `None` until the store assigns one.
    pub db_index: Option<i64>,
    pub tweet_ids: BTreeSet<u64>,
    pub dm_ids: BTreeSet<u64>,
}

impl Account {
    /// A configured account not yet matched against the store.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            name: row.name,
            db_index: Some(row.id),
            tweet_ids: row.tweet_ids,
            dm_ids: row.dm_ids,
        }
    }
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub tweets: i64,
    pub users: i64,
    pub accounts: i64,
}
