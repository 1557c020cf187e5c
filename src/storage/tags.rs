use super::schema::Database;
use super::types::{StorageError, Tag};

impl Database {
    // ========================================================================
    // Tag Operations
    // ========================================================================

    /// Get or create a tag by name, returning its ID. Names are unique.
    pub async fn ensure_tag(&self, name: &str) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tags (name) VALUES (?)
            ON CONFLICT(name) DO UPDATE SET name = excluded.name
            RETURNING id
        "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn tag_source(&self, source_id: i64, tag_id: i64) -> Result<(), StorageError> {
        sqlx::query("INSERT OR IGNORE INTO source_tags (source_id, tag_id) VALUES (?, ?)")
            .bind(source_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn untag_source(&self, source_id: i64, tag_id: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM source_tags WHERE source_id = ? AND tag_id = ?")
            .bind(source_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn tag_post(&self, post_id: i64, tag_id: i64) -> Result<(), StorageError> {
        sqlx::query("INSERT OR IGNORE INTO post_tags (post_id, tag_id) VALUES (?, ?)")
            .bind(post_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn untag_post(&self, post_id: i64, tag_id: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM post_tags WHERE post_id = ? AND tag_id = ?")
            .bind(post_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn tags_for_source(&self, source_id: i64) -> Result<Vec<Tag>, StorageError> {
        let tags = sqlx::query_as::<_, Tag>(
            r#"
            SELECT t.id, t.name FROM tags t
            JOIN source_tags st ON st.tag_id = t.id
            WHERE st.source_id = ?
            ORDER BY t.name
        "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    pub async fn tags_for_post(&self, post_id: i64) -> Result<Vec<Tag>, StorageError> {
        let tags = sqlx::query_as::<_, Tag>(
            r#"
            SELECT t.id, t.name FROM tags t
            JOIN post_tags pt ON pt.tag_id = t.id
            WHERE pt.post_id = ?
            ORDER BY t.name
        "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, NewPost};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_ensure_tag_is_idempotent() {
        let db = test_db().await;
        let a = db.ensure_tag("rust").await.unwrap();
        let b = db.ensure_tag("rust").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_source_and_post_tag_sets_are_independent() {
        let db = test_db().await;
        let sid = db.add_source("https://a.example/f", None, None, 400).await.unwrap();
        db.ingest_posts(
            sid,
            &[NewPost {
                guid: "g".to_string(),
                link: None,
                title: "t".to_string(),
                body: String::new(),
                author: None,
                created_at: None,
                enclosures: Vec::new(),
            }],
            1000,
        )
        .await
        .unwrap();
        let pid = db.posts_for_source(sid, None).await.unwrap()[0].id;

        let rust = db.ensure_tag("rust").await.unwrap();
        let news = db.ensure_tag("news").await.unwrap();

        db.tag_source(sid, rust).await.unwrap();
        db.tag_source(sid, rust).await.unwrap(); // duplicate link is a no-op
        db.tag_post(pid, news).await.unwrap();

        let source_tags = db.tags_for_source(sid).await.unwrap();
        assert_eq!(source_tags.len(), 1);
        assert_eq!(source_tags[0].name, "rust");

        let post_tags = db.tags_for_post(pid).await.unwrap();
        assert_eq!(post_tags.len(), 1);
        assert_eq!(post_tags[0].name, "news");

        db.untag_source(sid, rust).await.unwrap();
        assert!(db.tags_for_source(sid).await.unwrap().is_empty());
        // Untagging the source left the post's set alone
        assert_eq!(db.tags_for_post(pid).await.unwrap().len(), 1);
    }
}
