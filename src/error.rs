//! Error types for tweetstore.
//!
//! Almost every store-level failure is recovered where it happens (logged,
//! statement skipped). The variants here are what escapes to callers: open
//! and schema failures at startup, close failures at shutdown, and the
//! outcome carried back by batch acknowledgements.

use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;

/// Primary error type for tweetstore operations.
#[derive(Error, Debug)]
pub enum StoreError {
    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// A stored blob could not be decoded.
    #[error("Corrupt blob: {reason}")]
    CorruptBlob { reason: String },

    /// A value was too large for the blob header.
    #[error("Value of {len} bytes is too large to store")]
    BlobTooLarge { len: usize },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// The store stayed locked for the whole retry budget.
    #[error("Store is busy; gave up after {attempts} attempts")]
    Busy { attempts: u32 },

    /// Store schema written by a newer build.
    #[error("Store schema version mismatch: expected at most {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    /// The engine failed to start or has already shut down.
    #[error("Store engine is not ready")]
    NotReady,

    /// Statement execution or connection failure.
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The other end of the message channel is gone.
    #[error("Message channel closed")]
    ChannelClosed,

    /// The worker thread panicked.
    #[error("Store worker thread panicked")]
    WorkerPanicked,

    // =========================================================================
    // IO / Configuration Errors
    // =========================================================================
    /// File read/write error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Path-specific IO error with context.
    #[error("Failed to {operation} '{path}': {source}")]
    PathError {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file parsing error.
    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigError { path: PathBuf, reason: String },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Catch-all for other errors with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Wrapped anyhow error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for tweetstore operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<CodecError> for StoreError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TooLarge(len) => Self::BlobTooLarge { len },
            CodecError::Corrupt(reason) | CodecError::Deflate(reason) => {
                Self::CorruptBlob { reason }
            }
        }
    }
}

impl StoreError {
    /// Create a path error with context.
    pub fn path_error(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::PathError {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Wrap an error with additional context.
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether the failure is lock contention that may clear on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Busy { .. } => true,
            Self::DatabaseError(e) => is_busy(e),
            _ => false,
        }
    }

    /// Whether the failure is a damaged stored value.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptBlob { .. })
    }

    /// Get a suggestion for how to fix this error, if applicable.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Busy { .. } => {
                Some("Another process holds the store open. Close it or raise store.busy_max_retries.")
            }
            Self::SchemaMismatch { .. } => {
                Some("The store was written by a newer version. Upgrade or point paths.db elsewhere.")
            }
            Self::CorruptBlob { .. } => Some("Run 'tweetstore doctor' to locate damaged rows."),
            _ => None,
        }
    }
}

/// Whether a rusqlite error is `SQLITE_BUSY` or `SQLITE_LOCKED`.
#[must_use]
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily (only evaluated on error).
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| StoreError::with_context(context, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| StoreError::with_context(f(), e))
    }
}

// =============================================================================
// CLI Error Formatting
// =============================================================================

use colored::Colorize;

/// Format a structured CLI error with explanation and suggestions.
#[must_use]
pub fn format_error(title: &str, explanation: &str, suggestions: &[&str]) -> String {
    use std::fmt::Write;

    let mut output = format!("{} {}", "✗".red().bold(), title.bold());

    if !explanation.is_empty() {
        let _ = write!(output, "\n\n   {explanation}");
    }

    if !suggestions.is_empty() {
        output.push_str("\n\n   ");
        if suggestions.len() == 1 {
            let _ = write!(output, "{} {}", "Hint:".cyan(), suggestions[0]);
        } else {
            let _ = write!(output, "{}:", "Try".cyan());
            for suggestion in suggestions {
                let _ = write!(output, "\n     {} {}", "•".dimmed(), suggestion);
            }
        }
    }

    output
}
