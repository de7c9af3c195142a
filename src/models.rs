//! Shared domain types produced per request.
//!
//! Everything here is ephemeral: rows coming back from the ranked-retrieval
//! service are validated and converted into these structs once, at the
//! adapter boundary, and the rest of the pipeline only sees typed values.

use serde::{Deserialize, Serialize};

/// Tenant scoping for a request and its conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantScope {
    pub user_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub app_id: Option<String>,
}

/// Tenant-scoping tier a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    App,
    Org,
    Project,
    User,
}

impl Layer {
    /// Fixed priority order used when assembling chunk context.
    pub const PRIORITY: [Layer; 4] = [Layer::App, Layer::Org, Layer::Project, Layer::User];

    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("app") => Layer::App,
            Some("project") => Layer::Project,
            Some("user") => Layer::User,
            _ => Layer::Org,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::App => "app",
            Layer::Org => "org",
            Layer::Project => "project",
            Layer::User => "user",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Layer::App => "Application documents",
            Layer::Org => "Organization documents",
            Layer::Project => "Project documents",
            Layer::User => "Personal documents",
        }
    }
}

/// A scored passage returned by ranked retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub content: String,
    pub similarity: f64,
    pub rank_score: f64,
    pub layer: Layer,
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub storage_path: Option<String>,
    pub mime_type: Option<String>,
    pub page_count: Option<i64>,
    pub chunk_count: Option<i64>,
    pub source_type: String,
    pub concepts: Vec<String>,
    pub boosted: bool,
}

impl Chunk {
    /// File-backed chunks can feed full-document mode; everything else
    /// (meeting transcripts and similar) stays chunk-context only.
    pub fn is_file_backed(&self) -> bool {
        self.file_id.is_some() && self.source_type == "document"
    }
}

/// A retrieval-deduplicated source document, grouped from its chunks.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub file_id: String,
    pub file_name: String,
    pub storage_path: String,
    pub mime_type: String,
    pub page_count: i64,
    pub best_similarity: f64,
    pub chunk_count: i64,
    pub layer: Layer,
}

/// User-facing source list entry.
#[derive(Debug, Clone, Serialize)]
pub struct SourceEntry {
    pub file_id: Option<String>,
    pub name: String,
    pub layer: Layer,
    pub page_count: Option<i64>,
    pub similarity: f64,
    pub source_type: String,
}

impl SourceEntry {
    pub fn from_file(file: &FileInfo) -> Self {
        SourceEntry {
            file_id: Some(file.file_id.clone()),
            name: file.file_name.clone(),
            layer: file.layer,
            page_count: Some(file.page_count),
            similarity: file.best_similarity,
            source_type: "document".to_string(),
        }
    }

    pub fn from_chunk(chunk: &Chunk) -> Self {
        SourceEntry {
            file_id: chunk.file_id.clone(),
            name: chunk
                .file_name
                .clone()
                .unwrap_or_else(|| chunk.source_type.clone()),
            layer: chunk.layer,
            page_count: chunk.page_count,
            similarity: chunk.similarity,
            source_type: chunk.source_type.clone(),
        }
    }
}
