//! Document storage for adapter-owned state
//!
//! The feed adapter appends its entries here and the Twitter adapter keeps
//! rotated refresh tokens here. Documents are append-only JSON values grouped
//! by collection and looked up by key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::path::Path;
use tokio::sync::RwLock;

use crate::error::{DbError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub key: String,
    pub body: serde_json::Value,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Append a document
    async fn create(&self, collection: &str, key: &str, body: serde_json::Value)
        -> Result<Document>;

    /// All documents stored under `key`, oldest first
    async fn search_by_key(&self, collection: &str, key: &str) -> Result<Vec<Document>>;

    /// Every document of a collection, oldest first
    async fn get_all(&self, collection: &str) -> Result<Vec<Document>>;
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work on both Windows and Unix, mode=rwc creates the file
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
        use sqlx::Row;

        let body: String = row.get("body");
        Ok(Document {
            collection: row.get("collection"),
            key: row.get("key"),
            body: serde_json::from_str(&body).map_err(DbError::Document)?,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> Result<Document> {
        let created_at = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO documents (collection, key, body, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(body.to_string())
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(Document {
            collection: collection.to_string(),
            key: key.to_string(),
            body,
            created_at,
        })
    }

    async fn search_by_key(&self, collection: &str, key: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT collection, key, body, created_at
            FROM documents WHERE collection = ? AND key = ?
            ORDER BY id ASC
            "#,
        )
        .bind(collection)
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(Self::row_to_document).collect()
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT collection, key, body, created_at
            FROM documents WHERE collection = ?
            ORDER BY id ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(Self::row_to_document).collect()
    }
}

/// In-memory store for tests and throwaway runs
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<Vec<Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> Result<Document> {
        let document = Document {
            collection: collection.to_string(),
            key: key.to_string(),
            body,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.documents.write().await.push(document.clone());
        Ok(document)
    }

    async fn search_by_key(&self, collection: &str, key: &str) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .read()
            .await
            .iter()
            .filter(|d| d.collection == collection && d.key == key)
            .cloned()
            .collect())
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .read()
            .await
            .iter()
            .filter(|d| d.collection == collection)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn exercise_store(store: &dyn DocumentStore) {
        store.create("feed_entries", "a", json!({"n": 1})).await.unwrap();
        store.create("feed_entries", "b", json!({"n": 2})).await.unwrap();
        store.create("oauth_tokens", "a", json!({"n": 3})).await.unwrap();
        store.create("feed_entries", "a", json!({"n": 4})).await.unwrap();

        let by_key = store.search_by_key("feed_entries", "a").await.unwrap();
        assert_eq!(by_key.len(), 2);
        assert_eq!(by_key[0].body["n"], 1);
        assert_eq!(by_key[1].body["n"], 4);

        let all = store.get_all("feed_entries").await.unwrap();
        let ns: Vec<i64> = all.iter().map(|d| d.body["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 4]);

        assert!(store.search_by_key("feed_entries", "zzz").await.unwrap().is_empty());
        assert!(store.get_all("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("store.db");
        let store = SqliteStore::new(db_path.to_str().unwrap()).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("store.db");
        let db_path = db_path.to_str().unwrap();

        {
            let store = SqliteStore::new(db_path).await.unwrap();
            store.create("oauth_tokens", "twitter", json!({"refresh_token": "r1"})).await.unwrap();
        }

        let reopened = SqliteStore::new(db_path).await.unwrap();
        let docs = reopened.search_by_key("oauth_tokens", "twitter").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].body["refresh_token"], "r1");
    }
}
