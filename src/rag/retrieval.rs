//! Adapter over the opaque ranked-retrieval service.
//!
//! The service runs a hybrid vector + lexical + concept-expansion search
//! and returns loosely shaped rows; this module is the only place those
//! rows are validated and converted into typed [`Chunk`]/[`FileInfo`]
//! values.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::ApiError;
use crate::models::{Chunk, FileInfo, Layer};

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalQuery {
    pub query: String,
    pub embedding: Vec<f32>,
    pub user_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub app_id: Option<String>,
    pub include_app_layer: bool,
    pub include_org_layer: bool,
    pub include_project_layer: bool,
    pub include_user_layer: bool,
    pub match_count: i64,
    pub similarity_floor: f64,
    pub concept_expansion: bool,
    pub boost_ids: Vec<String>,
    pub boost_factor: f64,
    pub filter_source_types: Option<Vec<String>>,
}

/// Raw result row as returned by the retrieval RPC. All fields optional;
/// normalization decides what survives.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalRow {
    pub chunk_id: Option<String>,
    pub content: Option<String>,
    pub similarity: Option<f64>,
    pub rank_score: Option<f64>,
    pub layer: Option<String>,
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub storage_path: Option<String>,
    pub mime_type: Option<String>,
    pub page_count: Option<i64>,
    pub chunk_count: Option<i64>,
    pub source_type: Option<String>,
    pub matched_concepts: Option<Vec<String>>,
    pub boosted: Option<bool>,
}

#[async_trait]
pub trait RetrievalService: Send + Sync {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalRow>, ApiError>;
}

pub struct HttpRetrievalService {
    base_url: String,
    client: Client,
}

impl HttpRetrievalService {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl RetrievalService for HttpRetrievalService {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalRow>, ApiError> {
        let url = format!("{}/search", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(query)
            .send()
            .await
            .map_err(ApiError::upstream)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "retrieval failed ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(ApiError::upstream)?;
        let rows = payload
            .get("results")
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        serde_json::from_value(rows)
            .map_err(|e| ApiError::Upstream(format!("malformed retrieval rows: {}", e)))
    }
}

/// Normalized retrieval result: file-backed chunks, non-document chunks,
/// and the deduplicated candidate file set.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub document_chunks: Vec<Chunk>,
    pub extra_chunks: Vec<Chunk>,
    pub files: Vec<FileInfo>,
}

impl RetrievalOutcome {
    pub fn all_chunks(&self) -> Vec<Chunk> {
        let mut all = self.document_chunks.clone();
        all.extend(self.extra_chunks.clone());
        all
    }

    pub fn chunk_count(&self) -> usize {
        self.document_chunks.len() + self.extra_chunks.len()
    }
}

pub fn normalize(rows: Vec<RetrievalRow>) -> RetrievalOutcome {
    let mut document_chunks = Vec::new();
    let mut extra_chunks = Vec::new();

    for (idx, row) in rows.into_iter().enumerate() {
        let Some(content) = row.content.filter(|c| !c.trim().is_empty()) else {
            continue;
        };
        let chunk = Chunk {
            chunk_id: row.chunk_id.unwrap_or_else(|| format!("row-{}", idx)),
            content,
            similarity: row.similarity.unwrap_or(0.0),
            rank_score: row.rank_score.or(row.similarity).unwrap_or(0.0),
            layer: Layer::parse(row.layer.as_deref()),
            file_id: row.file_id,
            file_name: row.file_name,
            storage_path: row.storage_path,
            mime_type: row.mime_type,
            page_count: row.page_count,
            chunk_count: row.chunk_count,
            source_type: row.source_type.unwrap_or_else(|| "document".to_string()),
            concepts: row.matched_concepts.unwrap_or_default(),
            boosted: row.boosted.unwrap_or(false),
        };
        if chunk.is_file_backed() {
            document_chunks.push(chunk);
        } else {
            extra_chunks.push(chunk);
        }
    }

    let files = group_files(&document_chunks);

    RetrievalOutcome {
        document_chunks,
        extra_chunks,
        files,
    }
}

/// Deduplicate file-backed chunks into one [`FileInfo`] per file id,
/// keeping the maximum similarity. Page and chunk counts come from row
/// metadata, never from aggregation over the matched chunks.
fn group_files(chunks: &[Chunk]) -> Vec<FileInfo> {
    let mut by_id: HashMap<String, FileInfo> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for chunk in chunks {
        let Some(file_id) = chunk.file_id.clone() else {
            continue;
        };
        match by_id.get_mut(&file_id) {
            Some(existing) => {
                if chunk.similarity > existing.best_similarity {
                    existing.best_similarity = chunk.similarity;
                }
            }
            None => {
                order.push(file_id.clone());
                by_id.insert(
                    file_id.clone(),
                    FileInfo {
                        file_id,
                        file_name: chunk.file_name.clone().unwrap_or_default(),
                        storage_path: chunk.storage_path.clone().unwrap_or_default(),
                        mime_type: chunk
                            .mime_type
                            .clone()
                            .unwrap_or_else(|| "application/pdf".to_string()),
                        page_count: chunk.page_count.unwrap_or(0),
                        best_similarity: chunk.similarity,
                        chunk_count: chunk.chunk_count.unwrap_or(0),
                        layer: chunk.layer,
                    },
                );
            }
        }
    }

    let mut files: Vec<FileInfo> = order.into_iter().filter_map(|id| by_id.remove(&id)).collect();
    files.sort_by(|a, b| {
        b.best_similarity
            .partial_cmp(&a.best_similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(chunk_id: &str, file_id: Option<&str>, similarity: f64) -> RetrievalRow {
        RetrievalRow {
            chunk_id: Some(chunk_id.to_string()),
            content: Some(format!("content of {}", chunk_id)),
            similarity: Some(similarity),
            rank_score: Some(similarity),
            layer: Some("org".to_string()),
            file_id: file_id.map(|s| s.to_string()),
            file_name: file_id.map(|s| format!("{}.pdf", s)),
            storage_path: file_id.map(|s| format!("docs/{}.pdf", s)),
            mime_type: Some("application/pdf".to_string()),
            page_count: Some(12),
            chunk_count: Some(40),
            source_type: Some("document".to_string()),
            matched_concepts: None,
            boosted: None,
        }
    }

    #[test]
    fn normalize_groups_files_with_max_similarity() {
        let rows = vec![
            row("c1", Some("f1"), 0.7),
            row("c2", Some("f1"), 0.9),
            row("c3", Some("f2"), 0.8),
        ];
        let outcome = normalize(rows);
        assert_eq!(outcome.document_chunks.len(), 3);
        assert_eq!(outcome.files.len(), 2);
        assert_eq!(outcome.files[0].file_id, "f1");
        assert!((outcome.files[0].best_similarity - 0.9).abs() < 1e-9);
        // Counts come from metadata, not from how many chunks matched.
        assert_eq!(outcome.files[0].chunk_count, 40);
        assert_eq!(outcome.files[0].page_count, 12);
    }

    #[test]
    fn normalize_segregates_non_document_sources() {
        let mut transcript = row("t1", None, 0.85);
        transcript.source_type = Some("meeting_transcript".to_string());
        transcript.file_name = Some("Weekly sync".to_string());

        let rows = vec![row("c1", Some("f1"), 0.7), transcript];
        let outcome = normalize(rows);
        assert_eq!(outcome.document_chunks.len(), 1);
        assert_eq!(outcome.extra_chunks.len(), 1);
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.extra_chunks[0].source_type, "meeting_transcript");
    }

    #[test]
    fn normalize_drops_empty_rows() {
        let mut empty = row("c1", Some("f1"), 0.7);
        empty.content = Some("   ".to_string());
        let outcome = normalize(vec![empty]);
        assert_eq!(outcome.chunk_count(), 0);
        assert!(outcome.files.is_empty());
    }

    #[test]
    fn file_backed_requires_document_source_type() {
        let mut r = row("c1", Some("f1"), 0.7);
        r.source_type = Some("meeting_transcript".to_string());
        let outcome = normalize(vec![r]);
        // A transcript with a file reference still never feeds
        // full-document mode.
        assert!(outcome.files.is_empty());
        assert_eq!(outcome.extra_chunks.len(), 1);
    }
}
