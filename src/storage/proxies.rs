use super::schema::Database;
use super::types::{StorageError, WebProxy};

impl Database {
    // ========================================================================
    // Web Proxy Operations
    // ========================================================================

    /// Register a candidate proxy address. Duplicates are ignored.
    pub async fn add_proxy(&self, address: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT OR IGNORE INTO web_proxies (address) VALUES (?)")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_proxies(&self) -> Result<Vec<WebProxy>, StorageError> {
        let proxies =
            sqlx::query_as::<_, WebProxy>("SELECT id, address FROM web_proxies ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(proxies)
    }

    pub async fn remove_proxy(&self, address: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM web_proxies WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    #[tokio::test]
    async fn test_proxy_roundtrip() {
        let db = Database::open(":memory:").await.unwrap();

        db.add_proxy("http://10.0.0.1:8080").await.unwrap();
        db.add_proxy("http://10.0.0.2:8080").await.unwrap();
        db.add_proxy("http://10.0.0.1:8080").await.unwrap(); // duplicate ignored

        let proxies = db.list_proxies().await.unwrap();
        assert_eq!(proxies.len(), 2);

        db.remove_proxy("http://10.0.0.1:8080").await.unwrap();
        let proxies = db.list_proxies().await.unwrap();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].address, "http://10.0.0.2:8080");
    }
}
