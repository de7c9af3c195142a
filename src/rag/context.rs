//! Chunk-mode context formatting.
//!
//! Chunks are grouped by tenant layer in fixed priority order and rendered
//! into one context block. Truncation drops whole chunks or whole layers
//! once the character budget is reached; a chunk is never split
//! mid-content.

use crate::models::{Chunk, Layer};

pub fn format_chunk_context(chunks: &[Chunk], max_chars: usize) -> String {
    let mut out = String::new();
    let mut remaining = max_chars;
    let mut dropped = 0usize;

    for layer in Layer::PRIORITY {
        let layer_chunks: Vec<&Chunk> = chunks.iter().filter(|c| c.layer == layer).collect();
        if layer_chunks.is_empty() {
            continue;
        }

        let header = format!("### {}\n\n", layer.label());
        if header.len() > remaining {
            dropped += layer_chunks.len();
            continue;
        }

        let mut layer_out = String::new();
        let mut layer_budget = remaining - header.len();
        let mut kept_any = false;

        for chunk in layer_chunks {
            let block = render_chunk(chunk);
            if block.len() > layer_budget {
                dropped += 1;
                continue;
            }
            layer_budget -= block.len();
            layer_out.push_str(&block);
            kept_any = true;
        }

        if kept_any {
            out.push_str(&header);
            out.push_str(&layer_out);
            remaining = layer_budget;
        }
    }

    if dropped > 0 {
        tracing::debug!(dropped, "chunk context truncated at budget");
    }

    out.trim_end().to_string()
}

fn render_chunk(chunk: &Chunk) -> String {
    let mut tag = match (&chunk.file_id, &chunk.file_name) {
        (Some(id), Some(name)) => format!("[doc:{} \"{}\"]", id, name),
        (Some(id), None) => format!("[doc:{}]", id),
        (None, Some(name)) => format!("[{}: \"{}\"]", chunk.source_type, name),
        (None, None) => format!("[{}]", chunk.source_type),
    };
    if !chunk.concepts.is_empty() {
        tag.push_str(&format!(" (matches: {})", chunk.concepts.join(", ")));
    }
    format!("{}\n{}\n\n", tag, chunk.content.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, layer: Layer, content: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            content: content.to_string(),
            similarity: 0.8,
            rank_score: 0.8,
            layer,
            file_id: Some(format!("file-{}", id)),
            file_name: Some(format!("{}.pdf", id)),
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
    fn layers_render_in_priority_order() {
        let chunks = vec![
            chunk("u", Layer::User, "user text"),
            chunk("a", Layer::App, "app text"),
            chunk("o", Layer::Org, "org text"),
        ];
        let out = format_chunk_context(&chunks, 10_000);
        let app = out.find("app text").unwrap();
        let org = out.find("org text").unwrap();
        let user = out.find("user text").unwrap();
        assert!(app < org && org < user);
    }

    #[test]
    fn truncation_drops_whole_chunks() {
        let big = "x".repeat(400);
        let chunks = vec![
            chunk("a1", Layer::App, &big),
            chunk("a2", Layer::App, &big),
            chunk("a3", Layer::App, &big),
        ];
        let out = format_chunk_context(&chunks, 600);
        // Exactly one block fits; nothing is split mid-content.
        assert_eq!(out.matches(&big).count(), 1);
    }

    #[test]
    fn later_layer_dropped_when_budget_spent() {
        let big = "y".repeat(500);
        let chunks = vec![
            chunk("a", Layer::App, &big),
            chunk("u", Layer::User, &big),
        ];
        let out = format_chunk_context(&chunks, 620);
        assert!(out.contains("Application documents"));
        assert!(!out.contains("Personal documents"));
    }

    #[test]
    fn transcript_chunks_render_with_source_tag() {
        let mut c = chunk("t", Layer::Org, "notes from the call");
        c.file_id = None;
        c.file_name = Some("Weekly sync".to_string());
        c.source_type = "meeting_transcript".to_string();
        let out = format_chunk_context(&[c], 10_000);
        assert!(out.contains("[meeting_transcript: \"Weekly sync\"]"));
    }
}
