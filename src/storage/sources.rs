use super::schema::Database;
use super::types::{Category, Source, StorageError};

impl Database {
    // ========================================================================
    // Source Registry
    // ========================================================================

    /// Register a feed source, returning its ID.
    ///
    /// Re-registering an existing `feed_url` updates the metadata fields but
    /// leaves all polling state (due_at, etag, max_index, ...) untouched.
    pub async fn add_source(
        &self,
        feed_url: &str,
        name: Option<&str>,
        site_url: Option<&str>,
        interval_secs: i64,
    ) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sources (feed_url, name, site_url, interval_secs)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(feed_url) DO UPDATE SET
                name = COALESCE(excluded.name, name),
                site_url = COALESCE(excluded.site_url, site_url),
                interval_secs = excluded.interval_secs
            RETURNING id
        "#,
        )
        .bind(feed_url)
        .bind(name)
        .bind(site_url)
        .bind(interval_secs.max(1))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<Source>, StorageError> {
        let source = sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>, StorageError> {
        let sources = sqlx::query_as::<_, Source>("SELECT * FROM sources ORDER BY name, feed_url")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    /// Delete a source. Its posts (and their enclosures) go with it via
    /// the cascade constraints.
    pub async fn remove_source(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All live sources eligible for a poll at `now`, oldest-due first.
    ///
    /// `due_at IS NULL` means never polled; those sort before everything so
    /// new sources get their first fetch ahead of the steady-state queue.
    pub async fn due_sources(&self, now: i64) -> Result<Vec<Source>, StorageError> {
        let sources = sqlx::query_as::<_, Source>(
            r#"
            SELECT * FROM sources
            WHERE live = 1 AND (due_at IS NULL OR due_at <= ?)
            ORDER BY (due_at IS NULL) DESC, due_at ASC
        "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    // ========================================================================
    // Poll Outcome Recording
    // ========================================================================

    /// Record a successful poll: conditional-fetch validators, status, and
    /// the next due time (`now + interval`). `last_change` only moves when
    /// the poll actually produced new posts.
    pub async fn record_success(
        &self,
        source_id: i64,
        now: i64,
        status: u16,
        etag: Option<&str>,
        last_modified: Option<&str>,
        new_posts: usize,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                last_result = 'OK',
                status_code = ?,
                etag = ?,
                last_modified = ?,
                last_polled = ?,
                last_success = ?,
                last_change = CASE WHEN ? > 0 THEN ? ELSE last_change END,
                consecutive_failures = 0,
                due_at = ? + MAX(interval_secs, 1)
            WHERE id = ?
        "#,
        )
        .bind(i64::from(status))
        .bind(etag)
        .bind(last_modified)
        .bind(now)
        .bind(now)
        .bind(new_posts as i64)
        .bind(now)
        .bind(now)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a 304: the feed body was not re-downloaded, but the poll still
    /// counts as a success and `due_at` still advances.
    pub async fn record_unchanged(
        &self,
        source_id: i64,
        now: i64,
        status: u16,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                last_result = 'unchanged',
                status_code = ?,
                last_polled = ?,
                last_success = ?,
                consecutive_failures = 0,
                due_at = ? + MAX(interval_secs, 1)
            WHERE id = ?
        "#,
        )
        .bind(i64::from(status))
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed poll. `due_at` is the backoff-adjusted next attempt
    /// computed by the scheduler; `interval_secs` itself is never touched.
    /// When `suspend` is set the source leaves the due queue entirely.
    pub async fn record_failure(
        &self,
        source_id: i64,
        now: i64,
        message: &str,
        status: Option<u16>,
        due_at: i64,
        suspend: bool,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                last_result = ?,
                status_code = COALESCE(?, status_code),
                last_polled = ?,
                consecutive_failures = consecutive_failures + 1,
                live = CASE WHEN ? THEN 0 ELSE live END,
                due_at = ?
            WHERE id = ?
        "#,
        )
        .bind(message)
        .bind(status.map(i64::from))
        .bind(now)
        .bind(suspend)
        .bind(due_at)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remember where a redirect pointed. The start timestamp is only reset
    /// when the target changes, so a stable redirect accumulates age that an
    /// operator can review.
    pub async fn note_redirect(
        &self,
        source_id: i64,
        target: &str,
        now: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                last_302_start = CASE
                    WHEN last_302_url IS ? THEN COALESCE(last_302_start, ?)
                    ELSE ?
                END,
                last_302_url = ?
            WHERE id = ?
        "#,
        )
        .bind(target)
        .bind(now)
        .bind(now)
        .bind(target)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fill in name/site_url from feed-level metadata, but never overwrite
    /// values the user already set.
    pub async fn backfill_metadata(
        &self,
        source_id: i64,
        name: Option<&str>,
        site_url: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                name = CASE WHEN name IS NULL OR name = '' THEN COALESCE(?, name) ELSE name END,
                site_url = CASE WHEN site_url IS NULL OR site_url = '' THEN COALESCE(?, site_url) ELSE site_url END
            WHERE id = ?
        "#,
        )
        .bind(name)
        .bind(site_url)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resume or suspend polling. Reviving a source also clears its failure
    /// streak so it does not get re-suspended on the next hiccup.
    pub async fn set_live(&self, source_id: i64, live: bool) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE sources SET live = ?, consecutive_failures = CASE WHEN ? THEN 0 ELSE consecutive_failures END WHERE id = ?",
        )
        .bind(live)
        .bind(live)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a source as Cloudflare-fronted so future fetches go straight
    /// through the proxy pool.
    pub async fn set_cloudflare(&self, source_id: i64, is_cloudflare: bool) -> Result<(), StorageError> {
        sqlx::query("UPDATE sources SET is_cloudflare = ? WHERE id = ?")
            .bind(is_cloudflare)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn source_unread_count(&self, source_id: i64) -> Result<i64, StorageError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM posts WHERE source_id = ? AND read = 0")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    // ========================================================================
    // Category Operations
    // ========================================================================

    pub async fn create_category(&self, name: &str) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as("INSERT INTO categories (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>, StorageError> {
        let categories =
            sqlx::query_as::<_, Category>("SELECT id, name FROM categories ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(categories)
    }

    /// Move a source into a category, or out of any category with `None`.
    pub async fn assign_category(
        &self,
        source_id: i64,
        category_id: Option<i64>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE sources SET category_id = ? WHERE id = ?")
            .bind(category_id)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a category. Member sources are un-categorized by the
    /// ON DELETE SET NULL constraint.
    pub async fn delete_category(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unread posts across every source in the category.
    pub async fn category_unread_count(&self, category_id: i64) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM posts p
            JOIN sources s ON s.id = p.source_id
            WHERE s.category_id = ? AND p.read = 0
        "#,
        )
        .bind(category_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_add_source_defaults() {
        let db = test_db().await;
        let id = db
            .add_source("https://example.com/feed.xml", Some("Example"), None, 400)
            .await
            .unwrap();

        let source = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.feed_url, "https://example.com/feed.xml");
        assert_eq!(source.name.as_deref(), Some("Example"));
        assert_eq!(source.interval_secs, 400);
        assert_eq!(source.due_at, None, "new sources have never been polled");
        assert_eq!(source.max_index, 0);
        assert!(source.live);
        assert!(!source.is_cloudflare);
    }

    #[tokio::test]
    async fn test_add_source_conflict_preserves_poll_state() {
        let db = test_db().await;
        let id = db
            .add_source("https://example.com/feed.xml", None, None, 400)
            .await
            .unwrap();
        db.record_success(id, 1000, 200, Some("tag"), None, 1)
            .await
            .unwrap();

        let id2 = db
            .add_source("https://example.com/feed.xml", Some("Named"), None, 600)
            .await
            .unwrap();
        assert_eq!(id, id2);

        let source = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.name.as_deref(), Some("Named"));
        assert_eq!(source.interval_secs, 600);
        assert_eq!(source.etag.as_deref(), Some("tag"), "poll state untouched");
    }

    #[tokio::test]
    async fn test_due_sources_never_polled_first_then_oldest() {
        let db = test_db().await;
        let fresh = db.add_source("https://a.example/f", None, None, 400).await.unwrap();
        let old = db.add_source("https://b.example/f", None, None, 400).await.unwrap();
        let older = db.add_source("https://c.example/f", None, None, 400).await.unwrap();
        let future = db.add_source("https://d.example/f", None, None, 400).await.unwrap();

        // record_success sets due_at = now + interval
        db.record_success(old, 1000, 200, None, None, 0).await.unwrap();
        db.record_success(older, 500, 200, None, None, 0).await.unwrap();
        db.record_success(future, 1_000_000, 200, None, None, 0).await.unwrap();

        let due = db.due_sources(10_000).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![fresh, older, old], "NULL first, then oldest due");
    }

    #[tokio::test]
    async fn test_due_sources_excludes_suspended() {
        let db = test_db().await;
        let id = db.add_source("https://a.example/f", None, None, 400).await.unwrap();
        db.set_live(id, false).await.unwrap();
        assert!(db.due_sources(10_000).await.unwrap().is_empty());

        db.set_live(id, true).await.unwrap();
        assert_eq!(db.due_sources(10_000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_success_advances_due_and_change() {
        let db = test_db().await;
        let id = db.add_source("https://a.example/f", None, None, 400).await.unwrap();

        db.record_success(id, 1000, 200, Some("etag-1"), Some("Mon, 01 Jan"), 2)
            .await
            .unwrap();

        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.due_at, Some(1400));
        assert_eq!(s.status_code, 200);
        assert_eq!(s.last_result.as_deref(), Some("OK"));
        assert_eq!(s.etag.as_deref(), Some("etag-1"));
        assert_eq!(s.last_modified.as_deref(), Some("Mon, 01 Jan"));
        assert_eq!(s.last_success, Some(1000));
        assert_eq!(s.last_change, Some(1000));

        // A later success with no new posts keeps last_change where it was
        db.record_success(id, 2000, 200, None, None, 0).await.unwrap();
        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.last_change, Some(1000));
        assert_eq!(s.last_success, Some(2000));
        assert_eq!(s.due_at, Some(2400));
    }

    #[tokio::test]
    async fn test_record_unchanged_advances_due_without_change() {
        let db = test_db().await;
        let id = db.add_source("https://a.example/f", None, None, 400).await.unwrap();

        db.record_unchanged(id, 1000, 304).await.unwrap();

        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.due_at, Some(1400));
        assert_eq!(s.status_code, 304);
        assert_eq!(s.last_result.as_deref(), Some("unchanged"));
        assert_eq!(s.last_success, Some(1000));
        assert_eq!(s.last_change, None);
    }

    #[tokio::test]
    async fn test_record_failure_counts_and_suspends() {
        let db = test_db().await;
        let id = db.add_source("https://a.example/f", None, None, 400).await.unwrap();

        db.record_failure(id, 1000, "HTTP error: status 404", Some(404), 1800, false)
            .await
            .unwrap();
        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.consecutive_failures, 1);
        assert_eq!(s.due_at, Some(1800));
        assert_eq!(s.status_code, 404);
        assert_eq!(s.last_result.as_deref(), Some("HTTP error: status 404"));
        assert!(s.live);
        assert_eq!(s.interval_secs, 400, "interval itself is never mutated");

        // A failure without a status keeps the previous status code
        db.record_failure(id, 2000, "request timed out", None, 3600, true)
            .await
            .unwrap();
        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.consecutive_failures, 2);
        assert_eq!(s.status_code, 404);
        assert!(!s.live, "suspend flag flips live off");
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let db = test_db().await;
        let id = db.add_source("https://a.example/f", None, None, 400).await.unwrap();

        db.record_failure(id, 1000, "boom", None, 1800, false).await.unwrap();
        db.record_failure(id, 2000, "boom", None, 3600, false).await.unwrap();
        db.record_success(id, 3000, 200, None, None, 0).await.unwrap();

        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_note_redirect_start_only_resets_on_new_target() {
        let db = test_db().await;
        let id = db.add_source("https://a.example/f", None, None, 400).await.unwrap();

        db.note_redirect(id, "https://b.example/f", 1000).await.unwrap();
        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.last_302_url.as_deref(), Some("https://b.example/f"));
        assert_eq!(s.last_302_start, Some(1000));

        // Same target again: the start timestamp stays
        db.note_redirect(id, "https://b.example/f", 2000).await.unwrap();
        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.last_302_start, Some(1000));

        // New target: the clock restarts
        db.note_redirect(id, "https://c.example/f", 3000).await.unwrap();
        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.last_302_url.as_deref(), Some("https://c.example/f"));
        assert_eq!(s.last_302_start, Some(3000));
    }

    #[tokio::test]
    async fn test_backfill_metadata_never_overwrites() {
        let db = test_db().await;
        let id = db
            .add_source("https://a.example/f", Some("Mine"), None, 400)
            .await
            .unwrap();

        db.backfill_metadata(id, Some("Feed Title"), Some("https://a.example"))
            .await
            .unwrap();

        let s = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.name.as_deref(), Some("Mine"), "user name kept");
        assert_eq!(s.site_url.as_deref(), Some("https://a.example"), "empty field filled");
    }

    #[tokio::test]
    async fn test_revive_clears_failure_streak() {
        let db = test_db().await;
        let id = db.add_source("https://a.example/f", None, None, 400).await.unwrap();
        db.record_failure(id, 1000, "boom", None, 1800, true).await.unwrap();

        db.set_live(id, true).await.unwrap();
        let s = db.get_source(id).await.unwrap().unwrap();
        assert!(s.live);
        assert_eq!(s.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_category_lifecycle_and_unread_counts() {
        let db = test_db().await;
        let cat = db.create_category("Tech").await.unwrap();
        let a = db.add_source("https://a.example/f", None, None, 400).await.unwrap();
        let b = db.add_source("https://b.example/f", None, None, 400).await.unwrap();
        db.assign_category(a, Some(cat)).await.unwrap();
        db.assign_category(b, Some(cat)).await.unwrap();

        use crate::storage::NewPost;
        let post = |guid: &str| NewPost {
            guid: guid.to_string(),
            link: None,
            title: "t".to_string(),
            body: String::new(),
            author: None,
            created_at: None,
            enclosures: Vec::new(),
        };
        db.ingest_posts(a, &[post("1"), post("2")], 1000).await.unwrap();
        db.ingest_posts(b, &[post("1")], 1000).await.unwrap();

        assert_eq!(db.category_unread_count(cat).await.unwrap(), 3);
        assert_eq!(db.source_unread_count(a).await.unwrap(), 2);

        // Deleting the category un-categorizes sources, keeps them
        db.delete_category(cat).await.unwrap();
        let s = db.get_source(a).await.unwrap().unwrap();
        assert_eq!(s.category_id, None);
        assert!(db.list_categories().await.unwrap().is_empty());
    }
}
