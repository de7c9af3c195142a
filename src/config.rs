use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::core::errors::ApiError;

#[derive(Debug, Clone)]
pub struct AppPaths {
    #[allow(dead_code)]
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_path: PathBuf,
    pub document_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        let data_dir = env::var("SCRIVA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join("data")
            });
        let log_dir = data_dir.join("logs");
        let db_path = data_dir.join("scriva_core.db");
        let document_dir = env::var("DOCUMENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("documents"));

        for dir in [&data_dir, &log_dir, &document_dir] {
            let _ = fs::create_dir_all(dir);
        }

        AppPaths {
            data_dir,
            log_dir,
            db_path,
            document_dir,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-level settings resolved from the environment at startup.
///
/// A missing `GEMINI_API_KEY` is not an error: it only disables the
/// full-document generation path.
#[derive(Debug, Clone)]
pub struct Settings {
    pub embedding_url: String,
    pub embedding_api_key: Option<String>,
    pub gemini_url: String,
    pub gemini_api_key: Option<String>,
    pub openai_url: String,
    pub openai_api_key: Option<String>,
    pub retrieval_url: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            embedding_url: env::var("EMBEDDING_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            embedding_api_key: non_empty_env("EMBEDDING_API_KEY"),
            gemini_url: env::var("GEMINI_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string()),
            gemini_api_key: non_empty_env("GEMINI_API_KEY"),
            openai_url: env::var("OPENAI_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            retrieval_url: env::var("RETRIEVAL_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8600".to_string()),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Per-tenant agent configuration.
///
/// Resolved per request through the scope chain; every field has a global
/// default so partially populated rows stay usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub answer_model: String,
    pub document_model: String,
    pub summary_model: String,
    pub embedding_model: String,
    pub temperature: f64,
    pub max_output_tokens: i32,
    pub match_count: i64,
    pub similarity_floor: f64,
    pub concept_expansion: bool,
    pub boost_factor: f64,
    pub memory_threshold: f64,
    pub memory_limit: i64,
    pub memory_trust_floor: i64,
    pub page_ceiling: i64,
    pub cache_ttl_secs: i64,
    pub file_uri_ttl_secs: i64,
    pub max_context_chars: usize,
    pub recent_turns: i64,
    pub idle_timeout_minutes: i64,
    pub base_prompt: Option<String>,
    pub project_identity: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            answer_model: "gpt-4o-mini".to_string(),
            document_model: "gemini-2.0-flash".to_string(),
            summary_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            temperature: 0.2,
            max_output_tokens: 2048,
            match_count: 20,
            similarity_floor: 0.35,
            concept_expansion: true,
            boost_factor: 1.2,
            memory_threshold: 0.92,
            memory_limit: 3,
            memory_trust_floor: 3,
            page_ceiling: 500,
            cache_ttl_secs: 3600,
            file_uri_ttl_secs: 47 * 3600,
            max_context_chars: 24_000,
            recent_turns: 6,
            idle_timeout_minutes: 60,
            base_prompt: None,
            project_identity: None,
        }
    }
}

/// A configuration scope, most specific first in the resolution chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigScope {
    Organization(String),
    Vertical(String),
    Global,
}

impl ConfigScope {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigScope::Organization(_) => "organization",
            ConfigScope::Vertical(_) => "vertical",
            ConfigScope::Global => "global",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ConfigScope::Organization(key) | ConfigScope::Vertical(key) => key,
            ConfigScope::Global => "*",
        }
    }
}

/// Ordered scope chain for a request. First match wins for the whole row.
pub fn scope_chain(org_id: Option<&str>, vertical: Option<&str>) -> Vec<ConfigScope> {
    let mut chain = Vec::new();
    if let Some(org) = org_id {
        chain.push(ConfigScope::Organization(org.to_string()));
    }
    if let Some(vertical) = vertical {
        chain.push(ConfigScope::Vertical(vertical.to_string()));
    }
    chain.push(ConfigScope::Global);
    chain
}

#[derive(Clone)]
pub struct AgentConfigStore {
    pool: SqlitePool,
}

impl AgentConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_config (
                scope_kind TEXT NOT NULL,
                scope_key TEXT NOT NULL,
                config TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (scope_kind, scope_key)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS org_verticals (
                org_id TEXT PRIMARY KEY,
                vertical TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    /// Resolve the effective configuration for a tenant.
    ///
    /// Walks organization → vertical → global and takes the first stored
    /// row as a whole; absent rows fall through, absent fields inside a row
    /// take built-in defaults.
    pub async fn resolve(&self, org_id: Option<&str>) -> Result<AgentConfig, ApiError> {
        let vertical = match org_id {
            Some(org) => self.vertical_for(org).await?,
            None => None,
        };

        for scope in scope_chain(org_id, vertical.as_deref()) {
            let row = sqlx::query(
                "SELECT config FROM agent_config WHERE scope_kind = ?1 AND scope_key = ?2",
            )
            .bind(scope.kind())
            .bind(scope.key())
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::internal)?;

            if let Some(row) = row {
                let raw: String = row.try_get("config").map_err(ApiError::internal)?;
                let config: AgentConfig = serde_json::from_str(&raw)
                    .map_err(|e| ApiError::Internal(format!("invalid agent config row: {}", e)))?;
                return Ok(config);
            }
        }

        Ok(AgentConfig::default())
    }

    /// Write path for admin tooling; the request pipeline only reads.
    #[allow(dead_code)]
    pub async fn upsert(&self, scope: &ConfigScope, config: &AgentConfig) -> Result<(), ApiError> {
        let raw = serde_json::to_string(config).map_err(ApiError::internal)?;
        sqlx::query(
            "INSERT INTO agent_config (scope_kind, scope_key, config) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope_kind, scope_key) DO UPDATE SET
                 config = excluded.config,
                 updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')",
        )
        .bind(scope.kind())
        .bind(scope.key())
        .bind(raw)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;
        Ok(())
    }

    async fn vertical_for(&self, org_id: &str) -> Result<Option<String>, ApiError> {
        let row = sqlx::query("SELECT vertical FROM org_verticals WHERE org_id = ?1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        Ok(row.and_then(|r| r.try_get::<String, _>("vertical").ok()))
    }

    #[cfg(test)]
    pub async fn set_vertical(&self, org_id: &str, vertical: &str) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO org_verticals (org_id, vertical) VALUES (?1, ?2)
             ON CONFLICT(org_id) DO UPDATE SET vertical = excluded.vertical",
        )
        .bind(org_id)
        .bind(vertical)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> AgentConfigStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = AgentConfigStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[test]
    fn scope_chain_order() {
        let chain = scope_chain(Some("org-1"), Some("legal"));
        assert_eq!(
            chain,
            vec![
                ConfigScope::Organization("org-1".to_string()),
                ConfigScope::Vertical("legal".to_string()),
                ConfigScope::Global,
            ]
        );

        let chain = scope_chain(None, None);
        assert_eq!(chain, vec![ConfigScope::Global]);
    }

    #[tokio::test]
    async fn resolve_falls_back_to_default_when_empty() {
        let store = test_store().await;
        let config = store.resolve(Some("org-1")).await.unwrap();
        assert_eq!(config.page_ceiling, AgentConfig::default().page_ceiling);
    }

    #[tokio::test]
    async fn org_row_beats_vertical_and_global() {
        let store = test_store().await;
        store.set_vertical("org-1", "legal").await.unwrap();

        let mut global = AgentConfig::default();
        global.page_ceiling = 100;
        store.upsert(&ConfigScope::Global, &global).await.unwrap();

        let mut vertical = AgentConfig::default();
        vertical.page_ceiling = 200;
        store
            .upsert(&ConfigScope::Vertical("legal".to_string()), &vertical)
            .await
            .unwrap();

        let mut org = AgentConfig::default();
        org.page_ceiling = 300;
        store
            .upsert(&ConfigScope::Organization("org-1".to_string()), &org)
            .await
            .unwrap();

        assert_eq!(store.resolve(Some("org-1")).await.unwrap().page_ceiling, 300);
        assert_eq!(store.resolve(Some("org-2")).await.unwrap().page_ceiling, 100);
    }

    #[tokio::test]
    async fn vertical_row_beats_global() {
        let store = test_store().await;
        store.set_vertical("org-9", "medical").await.unwrap();

        let mut global = AgentConfig::default();
        global.match_count = 10;
        store.upsert(&ConfigScope::Global, &global).await.unwrap();

        let mut vertical = AgentConfig::default();
        vertical.match_count = 40;
        store
            .upsert(&ConfigScope::Vertical("medical".to_string()), &vertical)
            .await
            .unwrap();

        assert_eq!(store.resolve(Some("org-9")).await.unwrap().match_count, 40);
    }
}
