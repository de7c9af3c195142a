//! User-facing source list derivation.
//!
//! Full-document mode lists every candidate file unconditionally; the
//! model had all of them. Chunk mode lists only what the answer actually
//! cited, with a single-best fallback so an answer produced from
//! documents never ships an empty source list.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{Chunk, FileInfo, SourceEntry};

/// Document ids referenced by inline `<cite doc="ID" ...>` tags.
pub fn cited_doc_ids(text: &str) -> HashSet<String> {
    static CITE: OnceLock<Regex> = OnceLock::new();
    let re = CITE.get_or_init(|| Regex::new(r#"<cite\s+doc="([^"]+)""#).unwrap());
    re.captures_iter(text)
        .map(|cap| cap[1].to_string())
        .collect()
}

pub fn build_full_document_sources(
    files: &[FileInfo],
    extra_chunks: &[Chunk],
) -> Vec<SourceEntry> {
    let mut sources: Vec<SourceEntry> = files.iter().map(SourceEntry::from_file).collect();

    let mut seen_names: HashSet<String> = HashSet::new();
    for chunk in extra_chunks {
        let entry = SourceEntry::from_chunk(chunk);
        if seen_names.insert(entry.name.clone()) {
            sources.push(entry);
        }
    }

    sources
}

pub fn build_chunk_sources(answer: &str, chunks: &[Chunk]) -> Vec<SourceEntry> {
    let cited = cited_doc_ids(answer);

    let mut sources: Vec<SourceEntry> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for chunk in chunks {
        let id_cited = chunk
            .file_id
            .as_deref()
            .map(|id| cited.contains(id))
            .unwrap_or(false);
        let name_mentioned = chunk
            .file_name
            .as_deref()
            .map(|name| !name.is_empty() && answer.contains(name))
            .unwrap_or(false);
        if !id_cited && !name_mentioned {
            continue;
        }

        let key = chunk
            .file_id
            .clone()
            .or_else(|| chunk.file_name.clone())
            .unwrap_or_else(|| chunk.chunk_id.clone());
        if seen.insert(key) {
            sources.push(SourceEntry::from_chunk(chunk));
        }
    }

    if sources.is_empty() {
        if let Some(best) = chunks.iter().max_by(|a, b| {
            a.rank_score
                .partial_cmp(&b.rank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) {
            sources.push(SourceEntry::from_chunk(best));
        }
    }

    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Layer;

    fn chunk(id: &str, file_id: Option<&str>, name: Option<&str>, rank: f64) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            content: "text".to_string(),
            similarity: rank,
            rank_score: rank,
            layer: Layer::Org,
            file_id: file_id.map(|s| s.to_string()),
            file_name: name.map(|s| s.to_string()),
            storage_path: None,
            mime_type: None,
            page_count: None,
            chunk_count: None,
            source_type: "document".to_string(),
            concepts: vec![],
            boosted: false,
        }
    }

    #[test]
    fn cite_tags_are_extracted() {
        let answer = r#"Refunds take 14 days <cite doc="f1" page="3">. Shipping is free
            <cite doc="f2" page="1"> in most regions."#;
        let ids = cited_doc_ids(answer);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("f1"));
        assert!(ids.contains("f2"));
    }

    #[test]
    fn chunk_sources_keep_only_cited_files() {
        let chunks = vec![
            chunk("c1", Some("f1"), Some("handbook.pdf"), 0.9),
            chunk("c2", Some("f2"), Some("policy.pdf"), 0.8),
            chunk("c3", Some("f3"), Some("notes.pdf"), 0.7),
        ];
        let answer = r#"See the handbook <cite doc="f1" page="2">."#;
        let sources = build_chunk_sources(answer, &chunks);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].file_id.as_deref(), Some("f1"));
    }

    #[test]
    fn verbatim_name_mention_counts_as_citation() {
        let chunks = vec![
            chunk("c1", Some("f1"), Some("handbook.pdf"), 0.9),
            chunk("c2", Some("f2"), Some("policy.pdf"), 0.8),
        ];
        let answer = "According to policy.pdf, returns close after 30 days.";
        let sources = build_chunk_sources(answer, &chunks);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].file_id.as_deref(), Some("f2"));
    }

    #[test]
    fn duplicate_file_ids_collapse() {
        let chunks = vec![
            chunk("c1", Some("f1"), Some("handbook.pdf"), 0.9),
            chunk("c2", Some("f1"), Some("handbook.pdf"), 0.5),
        ];
        let answer = r#"<cite doc="f1" page="1"> and again <cite doc="f1" page="9">."#;
        let sources = build_chunk_sources(answer, &chunks);
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn no_citations_falls_back_to_best_ranked() {
        let chunks = vec![
            chunk("c1", Some("f1"), Some("handbook.pdf"), 0.6),
            chunk("c2", Some("f2"), Some("policy.pdf"), 0.9),
        ];
        let sources = build_chunk_sources("no tags at all", &chunks);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].file_id.as_deref(), Some("f2"));
    }

    #[test]
    fn empty_chunks_produce_empty_sources() {
        assert!(build_chunk_sources("anything", &[]).is_empty());
    }

    #[test]
    fn full_document_sources_list_all_candidates() {
        let files = vec![
            FileInfo {
                file_id: "f1".to_string(),
                file_name: "handbook.pdf".to_string(),
                storage_path: "docs/handbook.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                page_count: 42,
                best_similarity: 0.9,
                chunk_count: 10,
                layer: Layer::Org,
            },
        ];
        let mut transcript = chunk("t1", None, Some("Weekly sync"), 0.8);
        transcript.source_type = "meeting_transcript".to_string();

        let sources = build_full_document_sources(&files, &[transcript.clone(), transcript]);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].file_id.as_deref(), Some("f1"));
        assert_eq!(sources[1].source_type, "meeting_transcript");
    }
}
