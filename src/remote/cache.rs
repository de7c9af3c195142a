//! Provider-side context cache management.
//!
//! A cache maps a *set* of file ids (order-independent) to a provider
//! cache handle. It is reusable iff it has not expired and its file-id
//! set is identical, as a set, to the current request's candidates; any
//! membership change invalidates and triggers a rebuild. Failures here
//! never abort a request: every error becomes a [`FallbackReason`] and
//! the caller downgrades to chunk mode.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::config::AgentConfig;
use crate::history::{Conversation, ConversationStore};
use crate::llm::gemini::{FileRef, GeminiClient};
use crate::mode::FallbackReason;
use crate::models::FileInfo;
use crate::remote::files::{ObjectStorage, RemoteFileRecord, RemoteFileStore};

/// A persisted context-cache handle, keyed to the exact file-id set it
/// was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCacheEntry {
    pub name: String,
    pub expires_at: DateTime<Utc>,
    pub file_ids: Vec<String>,
}

impl RemoteCacheEntry {
    pub fn valid_for(&self, candidate_ids: &[String], now: DateTime<Utc>) -> bool {
        if self.expires_at <= now {
            return false;
        }
        let stored: BTreeSet<&str> = self.file_ids.iter().map(|s| s.as_str()).collect();
        let candidates: BTreeSet<&str> = candidate_ids.iter().map(|s| s.as_str()).collect();
        stored == candidates
    }
}

/// Stable digest of a file-id set, independent of ordering. Used as the
/// cache display name so rebuilds of the same set are recognizable in
/// provider consoles.
pub fn file_set_digest(file_ids: &[String]) -> String {
    let sorted: BTreeSet<&str> = file_ids.iter().map(|s| s.as_str()).collect();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..8])
}

/// A generation context ready for the full-document driver.
#[derive(Debug, Clone)]
pub struct ReadyContext {
    pub cache_name: Option<String>,
    pub files: Vec<FileRef>,
    pub reused: bool,
}

pub struct CacheManager {
    gemini: Arc<GeminiClient>,
    files: RemoteFileStore,
    storage: Arc<dyn ObjectStorage>,
    conversations: ConversationStore,
}

impl CacheManager {
    pub fn new(
        gemini: Arc<GeminiClient>,
        files: RemoteFileStore,
        storage: Arc<dyn ObjectStorage>,
        conversations: ConversationStore,
    ) -> Self {
        Self {
            gemini,
            files,
            storage,
            conversations,
        }
    }

    /// Produce a ready-to-use generation context for the candidate files,
    /// reusing the conversation's cache when the file set still matches
    /// and uploading only what the file-URI cache does not already cover.
    pub async fn prepare(
        &self,
        conversation: &Conversation,
        candidates: &[FileInfo],
        system_instruction: &str,
        config: &AgentConfig,
    ) -> Result<ReadyContext, FallbackReason> {
        let now = Utc::now();
        let candidate_ids: Vec<String> =
            candidates.iter().map(|f| f.file_id.clone()).collect();

        if let Some(entry) = conversation.remote_cache() {
            if entry.valid_for(&candidate_ids, now) {
                tracing::debug!(cache = %entry.name, "reusing context cache");
                return Ok(ReadyContext {
                    cache_name: Some(entry.name),
                    files: Vec::new(),
                    reused: true,
                });
            }
        }

        let refs = self.collect_file_refs(candidates, config, now).await?;

        let digest = file_set_digest(&candidate_ids);
        let created = self
            .gemini
            .create_cache(
                &config.document_model,
                &digest,
                system_instruction,
                &refs,
                config.cache_ttl_secs,
            )
            .await
            .map_err(|e| FallbackReason::CacheCreate(e.to_string()))?;

        let expires_at = created
            .expire_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| now + Duration::seconds(config.cache_ttl_secs));

        let entry = RemoteCacheEntry {
            name: created.name.clone(),
            expires_at,
            file_ids: candidate_ids,
        };
        if let Err(err) = self
            .conversations
            .set_remote_cache(&conversation.id, &entry)
            .await
        {
            tracing::warn!("failed to persist context cache handle: {}", err);
        }

        Ok(ReadyContext {
            cache_name: Some(created.name),
            files: refs,
            reused: false,
        })
    }

    async fn collect_file_refs(
        &self,
        candidates: &[FileInfo],
        config: &AgentConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<FileRef>, FallbackReason> {
        let mut refs = Vec::with_capacity(candidates.len());

        for file in candidates {
            match self.files.get_valid(&file.file_id, now).await {
                Ok(Some(record)) => {
                    refs.push(FileRef {
                        uri: record.remote_uri,
                        mime_type: record.mime_type,
                    });
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(file = %file.file_id, "file cache lookup failed: {}", err);
                }
            }

            let bytes = self
                .storage
                .fetch(&file.storage_path)
                .await
                .map_err(|e| FallbackReason::FileFetch(e.to_string()))?;

            let uploaded = self
                .gemini
                .upload_file(&file.file_name, &file.mime_type, bytes)
                .await
                .map_err(|e| FallbackReason::FileUpload(e.to_string()))?;

            let record = RemoteFileRecord {
                file_id: file.file_id.clone(),
                remote_uri: uploaded.uri.clone(),
                remote_name: uploaded.name,
                mime_type: file.mime_type.clone(),
                expires_at: now + Duration::seconds(config.file_uri_ttl_secs),
            };
            if let Err(err) = self.files.upsert(&record).await {
                tracing::warn!(file = %file.file_id, "failed to persist file uri: {}", err);
            }

            refs.push(FileRef {
                uri: uploaded.uri,
                mime_type: file.mime_type.clone(),
            });
        }

        Ok(refs)
    }
}
