use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::config::{AgentConfigStore, AppPaths, Settings};
use crate::embedding::EmbeddingClient;
use crate::history::ConversationStore;
use crate::llm::{GeminiClient, OpenAiProvider};
use crate::memory::QaMemoryStore;
use crate::rag::retrieval::{HttpRetrievalService, RetrievalService};
use crate::remote::{CacheManager, LocalObjectStorage, ObjectStorage, RemoteFileStore};

/// Process-wide state: every provider client is constructed once here and
/// handed to request handlers by reference.
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub settings: Settings,
    pub conversations: ConversationStore,
    pub qa_memory: QaMemoryStore,
    pub agent_config: AgentConfigStore,
    pub embeddings: EmbeddingClient,
    pub gemini: Arc<GeminiClient>,
    pub openai: OpenAiProvider,
    pub retrieval: Arc<dyn RetrievalService>,
    pub cache_manager: CacheManager,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub async fn initialize() -> anyhow::Result<Arc<Self>> {
        let paths = Arc::new(AppPaths::new());
        let settings = Settings::from_env();
        let pool = open_pool(&paths).await?;

        let conversations = ConversationStore::new(pool.clone());
        conversations.init_schema().await?;
        let remote_files = RemoteFileStore::new(pool.clone());
        remote_files.init_schema().await?;
        let qa_memory = QaMemoryStore::new(pool.clone());
        qa_memory.init_schema().await?;
        let agent_config = AgentConfigStore::new(pool.clone());
        agent_config.init_schema().await?;

        let embeddings = EmbeddingClient::new(
            settings.embedding_url.clone(),
            settings.embedding_api_key.clone(),
        );
        let gemini = Arc::new(GeminiClient::new(
            settings.gemini_url.clone(),
            settings.gemini_api_key.clone(),
        ));
        let openai = OpenAiProvider::new(
            settings.openai_url.clone(),
            settings.openai_api_key.clone(),
        );
        let retrieval: Arc<dyn RetrievalService> =
            Arc::new(HttpRetrievalService::new(settings.retrieval_url.clone()));
        let storage: Arc<dyn ObjectStorage> =
            Arc::new(LocalObjectStorage::new(paths.document_dir.clone()));

        let cache_manager = CacheManager::new(
            gemini.clone(),
            remote_files,
            storage,
            conversations.clone(),
        );

        Ok(Arc::new(AppState {
            paths,
            settings,
            conversations,
            qa_memory,
            agent_config,
            embeddings,
            gemini,
            openai,
            retrieval,
            cache_manager,
            started_at: Utc::now(),
        }))
    }
}

async fn open_pool(paths: &AppPaths) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(&paths.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
