//! Health checks for `tweetstore doctor`.
//!
//! Besides `PRAGMA integrity_check`, every compressed column is decoded so
//! damaged values show up here instead of as silently empty fields.

use rusqlite::types::ValueRef;
use serde::Serialize;
use tracing::debug;

use crate::codec;
use crate::error::Result;
use crate::storage::{SCHEMA_VERSION, Storage};

/// High-level category for a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Database,
    Blobs,
    Runtime,
}

/// Status for an individual health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warning,
    Error,
}

impl CheckStatus {
    /// Whether the check is healthy enough for continued operation.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Single health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub category: CheckCategory,
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl HealthCheck {
    fn pass(category: CheckCategory, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
            status: CheckStatus::Pass,
            message: message.into(),
            suggestion: None,
        }
    }

    fn problem(
        category: CheckCategory,
        status: CheckStatus,
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            category,
            name: name.into(),
            status,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

/// One value that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptValue {
    pub table: &'static str,
    pub column: &'static str,
    pub row_id: i64,
    pub reason: String,
}

/// Everything `doctor` found.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<HealthCheck>,
    /// First corrupt values found, up to the requested limit.
    pub corrupt: Vec<CorruptValue>,
}

impl DoctorReport {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Error)
    }
}

#[derive(Clone, Copy)]
enum ColumnKind {
    Text,
    IdSet,
}

const SCANNED_COLUMNS: &[(&str, &str, ColumnKind)] = &[
    ("tweets", "statics", ColumnKind::Text),
    ("tweets", "dynamic", ColumnKind::Text),
    ("users", "json", ColumnKind::Text),
    ("users", "cached_img_url", ColumnKind::Text),
    ("accounts", "tweet_ids", ColumnKind::IdSet),
    ("accounts", "dm_ids", ColumnKind::IdSet),
];

/// Run every check against `storage`, listing at most `limit` corrupt
/// values.
#[must_use]
pub fn run_checks(storage: &Storage, limit: usize) -> DoctorReport {
    let mut checks = vec![
        check_integrity(storage),
        check_schema_version(storage),
        check_threadsafe(storage),
    ];
    let mut corrupt = Vec::new();

    for &(table, column, kind) in SCANNED_COLUMNS {
        match scan_column(storage, table, column, kind) {
            Ok((scanned, found)) => {
                let name = format!("{table}.{column}");
                if found.is_empty() {
                    checks.push(HealthCheck::pass(
                        CheckCategory::Blobs,
                        name,
                        format!("{scanned} values decode"),
                    ));
                } else {
                    checks.push(HealthCheck::problem(
                        CheckCategory::Blobs,
                        CheckStatus::Error,
                        name,
                        format!("{} of {scanned} values are corrupt", found.len()),
                        "Corrupt values read back as empty; rewrite the affected rows.",
                    ));
                    let room = limit.saturating_sub(corrupt.len());
                    corrupt.extend(found.into_iter().take(room));
                }
            }
            Err(e) => checks.push(HealthCheck::problem(
                CheckCategory::Blobs,
                CheckStatus::Error,
                format!("{table}.{column}"),
                format!("scan failed: {e}"),
                "Check that the file is a tweetstore database.",
            )),
        }
    }

    DoctorReport { checks, corrupt }
}

fn check_integrity(storage: &Storage) -> HealthCheck {
    const NAME: &str = "PRAGMA integrity_check";
    match storage
        .connection()
        .query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))
    {
        Ok(result) if result == "ok" => HealthCheck::pass(CheckCategory::Database, NAME, "ok"),
        Ok(result) => HealthCheck::problem(
            CheckCategory::Database,
            CheckStatus::Error,
            NAME,
            format!("Integrity check failed: {result}"),
            "Database corruption detected. Restore from backup.",
        ),
        Err(err) => HealthCheck::problem(
            CheckCategory::Database,
            CheckStatus::Error,
            NAME,
            format!("Integrity check failed: {err}"),
            "Database corruption detected. Restore from backup.",
        ),
    }
}

fn check_schema_version(storage: &Storage) -> HealthCheck {
    const NAME: &str = "Schema version";
    match storage.schema_version() {
        Ok(current) if current == SCHEMA_VERSION => HealthCheck::pass(
            CheckCategory::Database,
            NAME,
            format!("schema_version={current}"),
        ),
        Ok(0) => HealthCheck::problem(
            CheckCategory::Database,
            CheckStatus::Error,
            NAME,
            "no schema version recorded",
            "This file was not written by tweetstore.",
        ),
        Ok(current) => HealthCheck::problem(
            CheckCategory::Database,
            CheckStatus::Error,
            NAME,
            format!("schema_version={current}, expected={SCHEMA_VERSION}"),
            "The store was written by a different build of tweetstore.",
        ),
        Err(err) => HealthCheck::problem(
            CheckCategory::Database,
            CheckStatus::Error,
            NAME,
            format!("could not read schema version: {err}"),
            "Check that no other process holds the store locked.",
        ),
    }
}

fn check_threadsafe(storage: &Storage) -> HealthCheck {
    if storage.library_is_threadsafe() {
        HealthCheck::pass(
            CheckCategory::Runtime,
            "SQLite threading",
            "thread-safe; background worker available",
        )
    } else {
        HealthCheck::problem(
            CheckCategory::Runtime,
            CheckStatus::Warning,
            "SQLite threading",
            "library built single-threaded",
            "Store commands will run synchronously on the calling thread.",
        )
    }
}

fn scan_column(
    storage: &Storage,
    table: &'static str,
    column: &'static str,
    kind: ColumnKind,
) -> Result<(usize, Vec<CorruptValue>)> {
    let sql = format!("SELECT id, {column} FROM {table}");
    let mut stmt = storage.connection().prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut scanned = 0;
    let mut corrupt = Vec::new();

    while let Some(row) = rows.next()? {
        let row_id: i64 = row.get(0)?;
        let bytes = match row.get_ref(1)? {
            ValueRef::Blob(b) | ValueRef::Text(b) => b,
            _ => continue,
        };
        scanned += 1;
        let problem = match (kind, codec::decompress(bytes)) {
            (_, Err(e)) => Some(e.to_string()),
            (ColumnKind::IdSet, Ok(Some(raw))) if raw.len() % 8 != 0 => {
                Some(format!("id set of {} bytes is not a multiple of 8", raw.len()))
            }
            _ => None,
        };
        if let Some(reason) = problem {
            corrupt.push(CorruptValue {
                table,
                column,
                row_id,
                reason,
            });
        }
    }

    debug!(table, column, scanned, corrupt = corrupt.len(), "scanned column");
    Ok((scanned, corrupt))
}
