use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of feedline appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY, SQLITE_LOCKED and SQLITE_CANTOPEN all mean another process
/// holds the file.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Data Structures
// ============================================================================

/// Result of [`Database::add_feed`](super::Database::add_feed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddFeedOutcome {
    /// A new row was created.
    Added(i64),
    /// The URL was already subscribed; its title and description were refreshed.
    Existing(i64),
}

impl AddFeedOutcome {
    pub fn id(self) -> i64 {
        match self {
            AddFeedOutcome::Added(id) | AddFeedOutcome::Existing(id) => id,
        }
    }
}

/// Feed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StoredFeed {
    pub id: i64,
    pub group_id: i64,
    pub url: String,
    pub title: String,
    pub description: String,
    /// Canonical UTC time the row was last written.
    pub stamp: String,
}

/// Item row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StoredItem {
    pub id: i64,
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    pub description: String,
    /// Canonical UTC publish date.
    pub pub_date: String,
    /// Canonical UTC time the row was last written.
    pub stamp: String,
}
