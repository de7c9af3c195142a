//! File-level provider-URI cache and durable object storage access.
//!
//! Uploaded file URIs live on their own TTL, independent of the context
//! caches that reference them: a context cache invalidated by file-set
//! drift can still be rebuilt from URIs that remain valid.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::core::errors::ApiError;

/// Durable object storage holding the original documents.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, ApiError>;
}

/// Object storage backed by a local directory tree.
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, ApiError> {
        let relative = locator.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(ApiError::BadRequest(format!(
                "invalid storage locator: {}",
                locator
            )));
        }
        let path = self.root.join(relative);
        tokio::fs::read(&path)
            .await
            .map_err(|e| ApiError::NotFound(format!("document {}: {}", locator, e)))
    }
}

#[derive(Debug, Clone)]
pub struct RemoteFileRecord {
    pub file_id: String,
    pub remote_uri: String,
    pub remote_name: String,
    pub mime_type: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RemoteFileStore {
    pool: SqlitePool,
}

impl RemoteFileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS remote_files (
                file_id TEXT PRIMARY KEY,
                remote_uri TEXT NOT NULL,
                remote_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;
        Ok(())
    }

    /// Unexpired record for the file, or None.
    pub async fn get_valid(
        &self,
        file_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RemoteFileRecord>, ApiError> {
        let row = sqlx::query("SELECT * FROM remote_files WHERE file_id = ?1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_raw: String = row.try_get("expires_at").map_err(ApiError::internal)?;
        let Ok(expires_at) = DateTime::parse_from_rfc3339(&expires_raw) else {
            return Ok(None);
        };
        let expires_at = expires_at.with_timezone(&Utc);
        if expires_at <= now {
            return Ok(None);
        }

        Ok(Some(RemoteFileRecord {
            file_id: row.try_get("file_id").unwrap_or_default(),
            remote_uri: row.try_get("remote_uri").unwrap_or_default(),
            remote_name: row.try_get("remote_name").unwrap_or_default(),
            mime_type: row.try_get("mime_type").unwrap_or_default(),
            expires_at,
        }))
    }

    pub async fn upsert(&self, record: &RemoteFileRecord) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO remote_files (file_id, remote_uri, remote_name, mime_type, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_id) DO UPDATE SET
                 remote_uri = excluded.remote_uri,
                 remote_name = excluded.remote_name,
                 mime_type = excluded.mime_type,
                 expires_at = excluded.expires_at",
        )
        .bind(&record.file_id)
        .bind(&record.remote_uri)
        .bind(&record.remote_name)
        .bind(&record.mime_type)
        .bind(record.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> RemoteFileStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = RemoteFileStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn expired_record_is_not_returned() {
        let store = test_store().await;
        let now = Utc::now();
        store
            .upsert(&RemoteFileRecord {
                file_id: "f1".to_string(),
                remote_uri: "files/abc".to_string(),
                remote_name: "abc".to_string(),
                mime_type: "application/pdf".to_string(),
                expires_at: now - Duration::minutes(1),
            })
            .await
            .unwrap();

        assert!(store.get_valid("f1", now).await.unwrap().is_none());

        store
            .upsert(&RemoteFileRecord {
                file_id: "f1".to_string(),
                remote_uri: "files/def".to_string(),
                remote_name: "def".to_string(),
                mime_type: "application/pdf".to_string(),
                expires_at: now + Duration::hours(1),
            })
            .await
            .unwrap();

        let record = store.get_valid("f1", now).await.unwrap().unwrap();
        assert_eq!(record.remote_uri, "files/def");
    }

    #[tokio::test]
    async fn local_storage_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.pdf"), b"content").unwrap();
        let storage = LocalObjectStorage::new(dir.path().to_path_buf());

        assert!(storage.fetch("doc.pdf").await.is_ok());
        assert!(storage.fetch("../doc.pdf").await.is_err());
        assert!(storage.fetch("missing.pdf").await.is_err());
    }
}
