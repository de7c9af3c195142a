//! Prompt assembly.
//!
//! The system instruction is built from the tenant's configured base
//! prompt, an optional project-identity block, the fixed citation
//! contract populated with the candidate-file catalog, and an optional
//! intent-specific instruction. Conversation history is kept separate
//! from the instruction body and prepended as its own messages.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::AgentConfig;
use crate::history::{Conversation, StoredMessage};
use crate::llm::types::ChatMessage;
use crate::models::FileInfo;

const GENERIC_BASE_PROMPT: &str = "You are a careful assistant answering questions \
strictly from the organization's document corpus. Answer in the language of the \
question. If the provided material does not contain the answer, say so instead of \
guessing.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Synthesis,
    Factual,
    Comparison,
    Citation,
    Conversational,
}

impl Intent {
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("synthesis") => Some(Intent::Synthesis),
            Some("factual") => Some(Intent::Factual),
            Some("comparison") => Some(Intent::Comparison),
            Some("citation") => Some(Intent::Citation),
            Some("conversational") => Some(Intent::Conversational),
            _ => None,
        }
    }

    fn instruction(self) -> &'static str {
        match self {
            Intent::Synthesis => {
                "Synthesize across all relevant documents into one coherent answer \
                 rather than summarizing them one by one."
            }
            Intent::Factual => {
                "Answer precisely and concisely. Prefer exact figures, dates and \
                 names from the documents over paraphrase."
            }
            Intent::Comparison => {
                "Compare the relevant documents explicitly, naming agreements and \
                 differences point by point."
            }
            Intent::Citation => {
                "Every factual statement must carry a citation tag; do not state \
                 anything you cannot attribute to a document."
            }
            Intent::Conversational => {
                "Keep the tone conversational and direct; short paragraphs over \
                 lists where possible."
            }
        }
    }
}

/// Build the full system instruction for a request.
pub fn assemble_system_instruction(
    config: &AgentConfig,
    files: &[FileInfo],
    intent: Option<Intent>,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    let base = config
        .base_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(GENERIC_BASE_PROMPT);
    sections.push(strip_placeholders(base));

    if let Some(identity) = config
        .project_identity
        .as_deref()
        .filter(|p| !p.trim().is_empty())
    {
        sections.push(format!("Project context:\n{}", identity.trim()));
    }

    sections.push(citation_contract(files));

    if let Some(intent) = intent {
        sections.push(intent.instruction().to_string());
    }

    sections.join("\n\n")
}

/// Remove unresolved `{placeholder}` tokens left over from prompt
/// templates that were never populated for this tenant.
pub fn strip_placeholders(text: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\{[A-Za-z0-9_]+\}").unwrap());
    re.replace_all(text, "").trim().to_string()
}

fn citation_contract(files: &[FileInfo]) -> String {
    let mut contract = String::from(
        "Cite evidence inline with <cite doc=\"DOCUMENT_ID\" page=\"N\"> tags placed \
         directly after the statement they support. Do not emit numbered reference \
         lists, footnotes, or a trailing sources section; the inline tags are the \
         only accepted citation format.",
    );

    if !files.is_empty() {
        contract.push_str("\n\nAvailable documents:");
        for file in files {
            contract.push_str(&format!(
                "\n- {} \"{}\" ({} pages)",
                file.file_id, file.file_name, file.page_count
            ));
        }
    }

    contract
}

/// Conversation history as chat messages: the running summary (or the
/// first message while no summary exists yet), then the recent turns in
/// chronological order.
pub fn history_messages(
    conversation: &Conversation,
    recent: &[StoredMessage],
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(summary) = conversation
        .summary
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        messages.push(ChatMessage::system(format!(
            "Conversation so far:\n{}",
            summary.trim()
        )));
    } else if let Some(first) = conversation
        .first_message
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        messages.push(ChatMessage::system(format!(
            "The conversation started with: {}",
            first.trim()
        )));
    }

    for message in recent {
        if message.role == "assistant" {
            messages.push(ChatMessage::assistant(message.content.clone()));
        } else {
            messages.push(ChatMessage::user(message.content.clone()));
        }
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Layer;

    fn file(id: &str, name: &str, pages: i64) -> FileInfo {
        FileInfo {
            file_id: id.to_string(),
            file_name: name.to_string(),
            storage_path: format!("docs/{}", name),
            mime_type: "application/pdf".to_string(),
            page_count: pages,
            best_similarity: 0.9,
            chunk_count: 10,
            layer: Layer::Org,
        }
    }

    #[test]
    fn placeholders_are_stripped() {
        assert_eq!(
            strip_placeholders("Hello {company_name}, welcome to {product}."),
            "Hello , welcome to ."
        );
        assert_eq!(strip_placeholders("no templates here"), "no templates here");
    }

    #[test]
    fn generic_prompt_used_when_none_configured() {
        let config = AgentConfig::default();
        let instruction = assemble_system_instruction(&config, &[], None);
        assert!(instruction.starts_with("You are a careful assistant"));
    }

    #[test]
    fn configured_prompt_and_identity_lead_the_instruction() {
        let mut config = AgentConfig::default();
        config.base_prompt = Some("Answer as {org_name} support.".to_string());
        config.project_identity = Some("Project Atlas, logistics".to_string());

        let instruction = assemble_system_instruction(&config, &[], None);
        assert!(instruction.starts_with("Answer as  support."));
        assert!(instruction.contains("Project Atlas"));
    }

    #[test]
    fn contract_lists_candidate_files() {
        let config = AgentConfig::default();
        let files = vec![file("f1", "handbook.pdf", 42), file("f2", "policy.pdf", 7)];
        let instruction = assemble_system_instruction(&config, &files, None);
        assert!(instruction.contains("<cite doc=\"DOCUMENT_ID\" page=\"N\">"));
        assert!(instruction.contains("f1 \"handbook.pdf\" (42 pages)"));
        assert!(instruction.contains("f2 \"policy.pdf\" (7 pages)"));
    }

    #[test]
    fn intent_instruction_is_appended() {
        let config = AgentConfig::default();
        let with = assemble_system_instruction(&config, &[], Some(Intent::Comparison));
        let without = assemble_system_instruction(&config, &[], None);
        assert!(with.len() > without.len());
        assert!(with.contains("Compare the relevant documents"));
    }

    #[test]
    fn history_prefers_summary_over_first_message() {
        let mut conversation = Conversation {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            org_id: None,
            project_id: None,
            app_id: None,
            summary: None,
            first_message: Some("What is our refund policy?".to_string()),
            cache_name: None,
            cache_expires_at: None,
            cache_file_set: None,
            created_at: String::new(),
            updated_at: String::new(),
        };

        let messages = history_messages(&conversation, &[]);
        assert!(messages[0].content.contains("started with"));

        conversation.summary = Some("User asked about refunds.".to_string());
        let messages = history_messages(&conversation, &[]);
        assert!(messages[0].content.contains("Conversation so far"));
    }
}
