use super::schema::Database;
use super::types::{Enclosure, NewPost, Post, StorageError};

/// Maximum number of posts to return from any single query (OOM protection)
const MAX_POSTS: i64 = 2000;

impl Database {
    // ========================================================================
    // Deduplication & Indexing
    // ========================================================================

    /// Ingest normalized entries for a source, returning the number of new
    /// posts created.
    ///
    /// Entries whose `(source_id, guid)` already exists are skipped without
    /// touching the stored post — feeds re-serve old entries and refreshing
    /// title/body would churn unread state. New posts get
    /// `idx = max_index + 1`, and `max_index` advances in the same
    /// transaction as the inserts, so two posts of one source can never
    /// collide on `idx`.
    pub async fn ingest_posts(
        &self,
        source_id: i64,
        posts: &[NewPost],
        now: i64,
    ) -> Result<usize, StorageError> {
        if posts.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let (mut max_idx,): (i64,) =
            sqlx::query_as("SELECT max_index FROM sources WHERE id = ?")
                .bind(source_id)
                .fetch_one(&mut *tx)
                .await?;

        let mut created = 0usize;
        for post in posts {
            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM posts WHERE source_id = ? AND guid = ?")
                    .bind(source_id)
                    .bind(&post.guid)
                    .fetch_optional(&mut *tx)
                    .await?;
            if existing.is_some() {
                continue;
            }

            max_idx += 1;
            let row: (i64,) = sqlx::query_as(
                r#"
                INSERT INTO posts (source_id, guid, link, title, body, author, created_at, found_at, idx)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
            "#,
            )
            .bind(source_id)
            .bind(&post.guid)
            .bind(&post.link)
            .bind(&post.title)
            .bind(&post.body)
            .bind(&post.author)
            .bind(post.created_at)
            .bind(now)
            .bind(max_idx)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| index_collision(e, source_id, max_idx))?;
            let post_id = row.0;

            for enc in &post.enclosures {
                sqlx::query(
                    r#"
                    INSERT INTO enclosures (post_id, href, length, mime_type, medium, description)
                    VALUES (?, ?, ?, ?, ?, ?)
                "#,
                )
                .bind(post_id)
                .bind(&enc.href)
                .bind(enc.length)
                .bind(&enc.mime_type)
                .bind(&enc.medium)
                .bind(&enc.description)
                .execute(&mut *tx)
                .await?;
            }

            created += 1;
        }

        if created > 0 {
            sqlx::query("UPDATE sources SET max_index = ? WHERE id = ?")
                .bind(max_idx)
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(created)
    }

    // ========================================================================
    // Post Queries
    // ========================================================================

    /// Posts of a source in display order (ascending `idx`), with optional
    /// pagination limit (default 500, hard cap 2000).
    pub async fn posts_for_source(
        &self,
        source_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Post>, StorageError> {
        let limit = limit.unwrap_or(500).min(MAX_POSTS);
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT * FROM posts
            WHERE source_id = ?
            ORDER BY idx
            LIMIT ?
        "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    pub async fn get_post(&self, id: i64) -> Result<Option<Post>, StorageError> {
        let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(post)
    }

    pub async fn enclosures_for_post(&self, post_id: i64) -> Result<Vec<Enclosure>, StorageError> {
        let enclosures =
            sqlx::query_as::<_, Enclosure>("SELECT * FROM enclosures WHERE post_id = ? ORDER BY id")
                .bind(post_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(enclosures)
    }

    // ========================================================================
    // Post State Mutators
    // ========================================================================

    pub async fn mark_read(&self, post_id: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE posts SET read = 1 WHERE id = ?")
            .bind(post_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn unmark_read(&self, post_id: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE posts SET read = 0 WHERE id = ?")
            .bind(post_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn toggle_starred(&self, post_id: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE posts SET starred = NOT starred WHERE id = ?")
            .bind(post_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Map a UNIQUE violation on `(source_id, idx)` to the integrity error it is.
fn index_collision(err: sqlx::Error, source_id: i64, idx: i64) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.message().contains("posts.source_id, posts.idx") {
            return StorageError::IndexCollision { source_id, idx };
        }
    }
    StorageError::Other(err)
}
