//! Deduplication & indexing: the bridge from parsed entries to stored posts.
//!
//! The guid lookup and atomic index assignment live in the storage layer
//! (`Database::ingest_posts`); this module owns the ingest ordering policy
//! and the conversion from parser output to registry input.

use crate::poll::parser::RawEntry;
use crate::storage::{Database, NewEnclosure, NewPost, StorageError};

/// Put entries in the order they should receive indices: oldest first, so
/// `idx` approximates chronology.
///
/// Feeds list newest first, so the feed order is reversed, then stably
/// sorted by `published` where entries carry one. Entries without a
/// timestamp sort as oldest, keeping their (reversed) relative order.
pub fn ingest_order(mut entries: Vec<RawEntry>) -> Vec<RawEntry> {
    entries.reverse();
    if entries.iter().any(|e| e.published.is_some()) {
        entries.sort_by_key(|e| e.published.unwrap_or(i64::MIN));
    }
    entries
}

/// Ingest parsed entries for a source. Returns the number of new posts.
pub async fn ingest(
    db: &Database,
    source_id: i64,
    entries: Vec<RawEntry>,
    now: i64,
) -> Result<usize, StorageError> {
    let posts: Vec<NewPost> = ingest_order(entries).into_iter().map(to_new_post).collect();
    db.ingest_posts(source_id, &posts, now).await
}

fn to_new_post(entry: RawEntry) -> NewPost {
    NewPost {
        guid: entry.guid,
        link: entry.link,
        title: entry.title,
        body: entry.body,
        author: entry.author,
        created_at: entry.published,
        enclosures: entry
            .enclosures
            .into_iter()
            .map(|e| NewEnclosure {
                href: e.href,
                length: e.length,
                mime_type: e.mime_type,
                medium: e.medium,
                description: e.description,
            })
            .collect(),
    }
}
