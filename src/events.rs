//! Events emitted over the response stream while a question is answered.

use serde::Serialize;
use serde_json::{json, Value};

use crate::models::SourceEntry;

/// Final metadata block sent after the last token.
#[derive(Debug, Clone, Serialize)]
pub struct SourcesPayload {
    pub conversation_id: String,
    pub generation_mode: String,
    pub fallback_reason: Option<String>,
    pub sources: Vec<SourceEntry>,
    pub chunk_count: usize,
    pub file_count: usize,
    pub duration_ms: i64,
}

#[derive(Debug, Clone)]
pub enum AskEvent {
    Step(String),
    Token(String),
    Sources(SourcesPayload),
    Error(String),
    Done,
}

impl AskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AskEvent::Step(_) => "step",
            AskEvent::Token(_) => "token",
            AskEvent::Sources(_) => "sources",
            AskEvent::Error(_) => "error",
            AskEvent::Done => "done",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            AskEvent::Step(label) => json!({ "label": label }),
            AskEvent::Token(text) => json!({ "text": text }),
            AskEvent::Sources(payload) => {
                serde_json::to_value(payload).unwrap_or_else(|_| json!({}))
            }
            AskEvent::Error(message) => json!({ "message": message }),
            AskEvent::Done => json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_stream_contract() {
        assert_eq!(AskEvent::Step("x".to_string()).name(), "step");
        assert_eq!(AskEvent::Token("x".to_string()).name(), "token");
        assert_eq!(AskEvent::Error("x".to_string()).name(), "error");
        assert_eq!(AskEvent::Done.name(), "done");
    }

    #[test]
    fn sources_payload_serializes_mode_and_reason() {
        let event = AskEvent::Sources(SourcesPayload {
            conversation_id: "c1".to_string(),
            generation_mode: "chunks".to_string(),
            fallback_reason: Some("page ceiling exceeded: 50 > 10".to_string()),
            sources: vec![],
            chunk_count: 4,
            file_count: 2,
            duration_ms: 1200,
        });
        let payload = event.payload();
        assert_eq!(payload["generation_mode"], "chunks");
        assert!(payload["fallback_reason"]
            .as_str()
            .unwrap()
            .contains("50 > 10"));
    }
}
