//! Conversation persistence.
//!
//! Conversations are found or created per session window: the latest
//! conversation for a tenant scope is reused while its `updated_at` is
//! inside the idle timeout, otherwise a new one starts. Messages are
//! append-only. The user turn is persisted before retrieval begins; the
//! assistant turn at stream close.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::core::errors::ApiError;
use crate::models::TenantScope;
use crate::remote::cache::RemoteCacheEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub app_id: Option<String>,
    pub summary: Option<String>,
    pub first_message: Option<String>,
    pub cache_name: Option<String>,
    pub cache_expires_at: Option<String>,
    pub cache_file_set: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub fn is_active(&self, idle_minutes: i64, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&self.updated_at) {
            Ok(updated) => now - updated.with_timezone(&Utc) <= Duration::minutes(idle_minutes),
            Err(_) => false,
        }
    }

    /// The conversation's remote context-cache handle, when one is attached.
    pub fn remote_cache(&self) -> Option<RemoteCacheEntry> {
        let name = self.cache_name.clone()?;
        let expires_at = self
            .cache_expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))?;
        let file_ids: Vec<String> = self
            .cache_file_set
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        Some(RemoteCacheEntry {
            name,
            expires_at,
            file_ids,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub sources: Option<Value>,
    pub generation_mode: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                org_id TEXT,
                project_id TEXT,
                app_id TEXT,
                summary TEXT,
                first_message TEXT,
                cache_name TEXT,
                cache_expires_at TEXT,
                cache_file_set TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sources TEXT,
                generation_mode TEXT,
                duration_ms INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_scope
             ON conversations(user_id, org_id, project_id, app_id, updated_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    /// Latest conversation for the scope regardless of age; the caller
    /// applies the idle-window policy.
    pub async fn latest_for_scope(
        &self,
        scope: &TenantScope,
    ) -> Result<Option<Conversation>, ApiError> {
        let row = sqlx::query(
            "SELECT * FROM conversations
             WHERE user_id = ?1
               AND (org_id IS ?2)
               AND (project_id IS ?3)
               AND (app_id IS ?4)
             ORDER BY updated_at DESC
             LIMIT 1",
        )
        .bind(&scope.user_id)
        .bind(&scope.org_id)
        .bind(&scope.project_id)
        .bind(&scope.app_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(row.map(|r| conversation_from_row(&r)))
    }

    pub async fn create(
        &self,
        scope: &TenantScope,
        first_message: &str,
    ) -> Result<Conversation, ApiError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO conversations
                 (id, user_id, org_id, project_id, app_id, first_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        )
        .bind(&id)
        .bind(&scope.user_id)
        .bind(&scope.org_id)
        .bind(&scope.project_id)
        .bind(&scope.app_id)
        .bind(first_message)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(Conversation {
            id,
            user_id: scope.user_id.clone(),
            org_id: scope.org_id.clone(),
            project_id: scope.project_id.clone(),
            app_id: scope.app_id.clone(),
            summary: None,
            first_message: Some(first_message.to_string()),
            cache_name: None,
            cache_expires_at: None,
            cache_file_set: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        sources: Option<&Value>,
        generation_mode: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<i64, ApiError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(ApiError::internal)?;

        sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;

        let result = sqlx::query(
            "INSERT INTO messages
                 (conversation_id, role, content, sources, generation_mode, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(sources.map(|v| v.to_string()))
        .bind(generation_mode)
        .bind(duration_ms)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::internal)?;

        tx.commit().await.map_err(ApiError::internal)?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent `limit` turns, returned in chronological order.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, ApiError> {
        let rows = sqlx::query(
            "SELECT * FROM (
                 SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    pub async fn all_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<StoredMessage>, ApiError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY id ASC")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, ApiError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, ApiError> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE user_id = ?1 ORDER BY updated_at DESC LIMIT 100",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;
        Ok(rows.iter().map(conversation_from_row).collect())
    }

    pub async fn delete(&self, conversation_id: &str) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        Ok(())
    }

    pub async fn update_summary(
        &self,
        conversation_id: &str,
        summary: &str,
    ) -> Result<(), ApiError> {
        sqlx::query("UPDATE conversations SET summary = ?1 WHERE id = ?2")
            .bind(summary)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        Ok(())
    }

    pub async fn set_remote_cache(
        &self,
        conversation_id: &str,
        entry: &RemoteCacheEntry,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE conversations
             SET cache_name = ?1, cache_expires_at = ?2, cache_file_set = ?3
             WHERE id = ?4",
        )
        .bind(&entry.name)
        .bind(entry.expires_at.to_rfc3339())
        .bind(serde_json::to_string(&entry.file_ids).map_err(ApiError::internal)?)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;
        Ok(())
    }
}

fn conversation_from_row(row: &sqlx::sqlite::SqliteRow) -> Conversation {
    Conversation {
        id: row.try_get("id").unwrap_or_default(),
        user_id: row.try_get("user_id").unwrap_or_default(),
        org_id: row.try_get("org_id").unwrap_or(None),
        project_id: row.try_get("project_id").unwrap_or(None),
        app_id: row.try_get("app_id").unwrap_or(None),
        summary: row.try_get("summary").unwrap_or(None),
        first_message: row.try_get("first_message").unwrap_or(None),
        cache_name: row.try_get("cache_name").unwrap_or(None),
        cache_expires_at: row.try_get("cache_expires_at").unwrap_or(None),
        cache_file_set: row.try_get("cache_file_set").unwrap_or(None),
        created_at: row.try_get("created_at").unwrap_or_default(),
        updated_at: row.try_get("updated_at").unwrap_or_default(),
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        id: row.try_get("id").unwrap_or_default(),
        conversation_id: row.try_get("conversation_id").unwrap_or_default(),
        role: row.try_get("role").unwrap_or_default(),
        content: row.try_get("content").unwrap_or_default(),
        sources: row
            .try_get::<Option<String>, _>("sources")
            .unwrap_or(None)
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        generation_mode: row.try_get("generation_mode").unwrap_or(None),
        duration_ms: row.try_get("duration_ms").unwrap_or(None),
        created_at: row.try_get("created_at").unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> ConversationStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = ConversationStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn scope(user: &str) -> TenantScope {
        TenantScope {
            user_id: user.to_string(),
            org_id: Some("org-1".to_string()),
            project_id: None,
            app_id: None,
        }
    }

    #[tokio::test]
    async fn turn_round_trip_is_chronological() {
        let store = test_store().await;
        let conv = store.create(&scope("u1"), "first question").await.unwrap();

        store
            .add_message(&conv.id, "user", "q1", None, None, None)
            .await
            .unwrap();
        store
            .add_message(&conv.id, "assistant", "a1", None, Some("chunks"), Some(900))
            .await
            .unwrap();
        store
            .add_message(&conv.id, "user", "q2", None, None, None)
            .await
            .unwrap();

        let recent = store.recent_messages(&conv.id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "a1");
        assert_eq!(recent[1].content, "q2");

        let all = store.all_messages(&conv.id).await.unwrap();
        assert_eq!(
            all.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["q1", "a1", "q2"]
        );
    }

    #[tokio::test]
    async fn latest_for_scope_separates_tenants() {
        let store = test_store().await;
        let c1 = store.create(&scope("u1"), "hello").await.unwrap();
        let mut other = scope("u1");
        other.org_id = Some("org-2".to_string());
        store.create(&other, "different tenant").await.unwrap();

        let found = store.latest_for_scope(&scope("u1")).await.unwrap().unwrap();
        assert_eq!(found.id, c1.id);
    }

    #[tokio::test]
    async fn idle_window_detection() {
        let store = test_store().await;
        let mut conv = store.create(&scope("u1"), "hello").await.unwrap();
        let now = Utc::now();
        assert!(conv.is_active(60, now));

        conv.updated_at = (now - Duration::minutes(90)).to_rfc3339();
        assert!(!conv.is_active(60, now));
    }

    #[tokio::test]
    async fn remote_cache_round_trip() {
        let store = test_store().await;
        let conv = store.create(&scope("u1"), "hello").await.unwrap();

        let entry = RemoteCacheEntry {
            name: "cachedContents/abc".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            file_ids: vec!["f2".to_string(), "f1".to_string()],
        };
        store.set_remote_cache(&conv.id, &entry).await.unwrap();

        let reloaded = store.get(&conv.id).await.unwrap().unwrap();
        let cache = reloaded.remote_cache().unwrap();
        assert_eq!(cache.name, "cachedContents/abc");
        assert_eq!(cache.file_ids, vec!["f2".to_string(), "f1".to_string()]);
    }
}
