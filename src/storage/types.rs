use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another instance of the engine has locked the database
    #[error("Another instance of gleaner appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Two posts of one source collided on the same sequence index.
    ///
    /// This cannot happen while the index is advanced inside the ingest
    /// transaction; any occurrence is an integrity bug, never a retry case.
    #[error("Post index collision on source {source_id} at index {idx}")]
    IndexCollision { source_id: i64, idx: i64 },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StorageError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StorageError::InstanceLocked;
        }

        StorageError::Other(err)
    }
}

// ============================================================================
// Persisted Entities
// ============================================================================

/// A pollable feed endpoint. All timestamps are Unix seconds; `etag` and
/// `last_modified` are opaque header values passed back to the server
/// verbatim on the next conditional fetch.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub name: Option<String>,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub description: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Next poll time. NULL = never polled, which sorts first in the due queue.
    pub due_at: Option<i64>,
    pub interval_secs: i64,
    pub last_result: Option<String>,
    pub status_code: i64,
    /// False suspends polling entirely.
    pub live: bool,
    pub last_polled: Option<i64>,
    pub last_success: Option<i64>,
    pub last_change: Option<i64>,
    pub last_302_url: Option<String>,
    pub last_302_start: Option<i64>,
    /// Highest post index assigned so far. Only ever increases.
    pub max_index: i64,
    pub consecutive_failures: i64,
    /// Once true, fetches for this source go through the proxy pool first.
    pub is_cloudflare: bool,
    pub category_id: Option<i64>,
}

/// One ingested feed entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub source_id: i64,
    pub guid: String,
    pub link: Option<String>,
    pub title: String,
    pub body: String,
    pub author: Option<String>,
    /// The entry's own timestamp from the feed, when it carried one.
    pub created_at: Option<i64>,
    /// Ingestion time, immutable once set.
    pub found_at: i64,
    /// Per-source monotonic sequence number, assigned exactly once at creation.
    pub idx: i64,
    pub read: bool,
    pub starred: bool,
}

/// Media attachment on a post, cascade-deleted with it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Enclosure {
    pub id: i64,
    pub post_id: i64,
    pub href: String,
    pub length: i64,
    pub mime_type: Option<String>,
    pub medium: Option<String>,
    pub description: Option<String>,
}

/// Name-unique label, many-to-many with both sources and posts.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// Grouping for sources, used for aggregate unread counts.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

/// A candidate outbound proxy address for Cloudflare-blocked fetches.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebProxy {
    pub id: i64,
    pub address: String,
}

// ============================================================================
// Ingest Input
// ============================================================================

/// A normalized entry ready for dedup and indexing.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub guid: String,
    pub link: Option<String>,
    pub title: String,
    pub body: String,
    pub author: Option<String>,
    pub created_at: Option<i64>,
    pub enclosures: Vec<NewEnclosure>,
}

#[derive(Debug, Clone)]
pub struct NewEnclosure {
    pub href: String,
    pub length: i64,
    pub mime_type: Option<String>,
    pub medium: Option<String>,
    pub description: Option<String>,
}
