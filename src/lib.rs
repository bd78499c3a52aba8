//! tweetstore - asynchronous `SQLite` persistence for a Twitter client
//!
//! The library keeps tweets, user profiles and account state in one store
//! file. Writes and lookups are sent as messages to a background worker
//! that owns its own connection; large text fields go through a tagged,
//! dictionary-aware deflate codec.
//!
//! # Modules
//!
//! - [`codec`] - Tagged compression of stored text and id sets
//! - [`statement`] - Per-connection statement cache and transaction depth
//! - [`message`] - Commands sent to the store
//! - [`channel`] - Ordered transport between producer and worker
//! - [`storage`] - Connection, schema and command execution
//! - [`worker`] - Background execution thread
//! - [`reply`] - Delivery of results back to requesters
//! - [`engine`] - The front door used by the application

pub mod channel;
pub mod cli;
pub mod codec;
pub mod config;
pub mod doctor;
pub mod engine;
pub mod error;
pub mod logging;
pub mod message;
pub mod model;
pub mod reply;
pub mod statement;
pub mod storage;
pub mod worker;

pub use config::{Config, ThreadingMode};
pub use engine::{Engine, ShutdownReport};
pub use error::{Result, ResultExt, StoreError, format_error};
pub use message::{BatchList, Message, MessageKind, SelectRequest};
pub use model::*;
pub use reply::{BatchOutcome, Delivery, Reply, ReplyAddress, ReplyInbox, ReplyQueue, ReplyTag, ReplyTarget};
pub use storage::Storage;
pub use worker::{WorkerState, WorkerStats};

use chrono::{DateTime, Utc};

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: u64 = 1024 * 1024;
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Format an integer with thousands separators.
#[must_use]
pub fn format_number(value: i64) -> String {
    let abs = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(abs.len() + abs.len() / 3);

    for (idx, ch) in abs.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }

    let mut formatted: String = out.chars().rev().collect();
    if value < 0 {
        formatted.insert(0, '-');
    }
    formatted
}

/// Format a stored Unix timestamp, or `"unknown"` for zero and
/// out-of-range values.
#[must_use]
pub fn format_timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .filter(|s| *s > 0)
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .map_or_else(|| "unknown".to_string(), |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

/// Format bytes into a human-friendly string.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < BYTES_PER_KB {
        format!("{bytes} B")
    } else if bytes < BYTES_PER_MB {
        format_bytes_with_unit(bytes, BYTES_PER_KB, "KB")
    } else if bytes < BYTES_PER_GB {
        format_bytes_with_unit(bytes, BYTES_PER_MB, "MB")
    } else {
        format_bytes_with_unit(bytes, BYTES_PER_GB, "GB")
    }
}

fn format_bytes_with_unit(bytes: u64, unit: u64, suffix: &str) -> String {
    let whole = bytes / unit;
    let tenths = (bytes % unit) * 10 / unit;
    format!("{whole}.{tenths} {suffix}")
}
