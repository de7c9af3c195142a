//! The request pipeline.
//!
//! One invocation per inbound question: load conversation and tenant
//! config, embed the query, try the answer memory, run ranked retrieval,
//! pick a generation mode, stream the answer, derive sources, persist the
//! turn. Full-document failures downgrade to chunk mode; they never
//! surface as user-visible errors.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::core::errors::ApiError;
use crate::events::{AskEvent, SourcesPayload};
use crate::history::Conversation;
use crate::llm::provider::GenerationProvider;
use crate::llm::types::{ChatMessage, ChatRequest};
use crate::memory::QaMemoryHit;
use crate::mode::{resolve_mode, FallbackReason, GenerationMode, ModeDecision};
use crate::models::{Layer, SourceEntry, TenantScope};
use crate::prompt::{self, Intent};
use crate::rag::context::format_chunk_context;
use crate::rag::retrieval::{normalize, RetrievalOutcome, RetrievalQuery};
use crate::remote::ReadyContext;
use crate::sources;
use crate::state::AppState;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub query: String,
    pub user_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub app_id: Option<String>,
    pub rewritten_query: Option<String>,
    pub intent: Option<String>,
    pub generation_mode: Option<String>,
    #[serde(default = "default_true")]
    pub include_app_layer: bool,
    #[serde(default = "default_true")]
    pub include_org_layer: bool,
    #[serde(default = "default_true")]
    pub include_project_layer: bool,
    #[serde(default = "default_true")]
    pub include_user_layer: bool,
    pub filter_source_types: Option<Vec<String>>,
    #[serde(default)]
    pub boost_ids: Vec<String>,
}

impl AskRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.query.trim().is_empty() {
            return Err(ApiError::BadRequest("query must not be empty".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(ApiError::BadRequest("user_id is required".to_string()));
        }
        Ok(())
    }

    pub fn scope(&self) -> TenantScope {
        TenantScope {
            user_id: self.user_id.clone(),
            org_id: self.org_id.clone(),
            project_id: self.project_id.clone(),
            app_id: self.app_id.clone(),
        }
    }

    fn embedding_text(&self) -> &str {
        self.rewritten_query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&self.query)
    }
}

/// Entry point: drives the whole request and closes the stream with a
/// `done` event. Send failures mean the client went away; they are
/// ignored and in-flight work simply runs out.
pub async fn run(state: Arc<AppState>, request: AskRequest, events: mpsc::Sender<AskEvent>) {
    if let Err(err) = run_inner(&state, &request, &events).await {
        tracing::error!("request failed: {}", err);
        let _ = events.send(AskEvent::Error(err.to_string())).await;
    }
    let _ = events.send(AskEvent::Done).await;
}

async fn run_inner(
    state: &Arc<AppState>,
    request: &AskRequest,
    events: &mpsc::Sender<AskEvent>,
) -> Result<(), ApiError> {
    request.validate()?;
    let started = Instant::now();
    let scope = request.scope();

    step(events, "loading context").await;
    let (config, latest) = tokio::join!(
        state.agent_config.resolve(scope.org_id.as_deref()),
        state.conversations.latest_for_scope(&scope),
    );
    let config = config?;
    let latest = latest.unwrap_or_else(|err| {
        tracing::warn!("conversation lookup failed, starting fresh: {}", err);
        None
    });

    let conversation = match latest
        .filter(|c| c.is_active(config.idle_timeout_minutes, Utc::now()))
    {
        Some(conversation) => conversation,
        None => state.conversations.create(&scope, &request.query).await?,
    };

    // The user turn lands before any retrieval work starts.
    if let Err(err) = state
        .conversations
        .add_message(&conversation.id, "user", &request.query, None, None, None)
        .await
    {
        tracing::warn!("failed to persist user turn: {}", err);
    }

    step(events, "embedding query").await;
    let embedding = state
        .embeddings
        .embed(request.embedding_text(), &config.embedding_model)
        .await?;

    if let Some(org_id) = scope.org_id.as_deref() {
        step(events, "checking answer memory").await;
        match state
            .qa_memory
            .best_match(
                &embedding,
                org_id,
                scope.project_id.as_deref(),
                config.memory_threshold,
                config.memory_limit,
            )
            .await
        {
            Ok(Some(hit)) if hit.entry.usable(config.memory_trust_floor) => {
                return replay_memory(state, &conversation, hit, events, started).await;
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("memory lookup failed: {}", err),
        }
    }

    step(events, "searching documents").await;
    let rows = state
        .retrieval
        .search(&RetrievalQuery {
            query: request.query.clone(),
            embedding,
            user_id: scope.user_id.clone(),
            org_id: scope.org_id.clone(),
            project_id: scope.project_id.clone(),
            app_id: scope.app_id.clone(),
            include_app_layer: request.include_app_layer,
            include_org_layer: request.include_org_layer,
            include_project_layer: request.include_project_layer,
            include_user_layer: request.include_user_layer,
            match_count: config.match_count,
            similarity_floor: config.similarity_floor,
            concept_expansion: config.concept_expansion,
            boost_ids: request.boost_ids.clone(),
            boost_factor: config.boost_factor,
            filter_source_types: request.filter_source_types.clone(),
        })
        .await?;
    let outcome = normalize(rows);
    tracing::debug!(
        chunks = outcome.chunk_count(),
        files = outcome.files.len(),
        boosted = outcome.document_chunks.iter().filter(|c| c.boosted).count(),
        indexed_chunks = outcome.files.iter().map(|f| f.chunk_count).sum::<i64>(),
        "retrieval normalized"
    );

    let requested = GenerationMode::parse(request.generation_mode.as_deref());
    let total_pages: i64 = outcome.files.iter().map(|f| f.page_count).sum();
    let decision = resolve_mode(
        requested,
        outcome.files.len(),
        total_pages,
        config.page_ceiling,
        state.gemini.available(),
    );

    let system_instruction = prompt::assemble_system_instruction(
        &config,
        &outcome.files,
        Intent::parse(request.intent.as_deref()),
    );
    let history = load_history(state, &conversation, request, config.recent_turns).await;

    let mut effective = decision;
    let mut answer = String::new();

    if effective.mode == GenerationMode::Gemini {
        step(events, "preparing documents").await;
        match state
            .cache_manager
            .prepare(&conversation, &outcome.files, &system_instruction, &config)
            .await
        {
            Ok(ready) => {
                step(events, "generating answer").await;
                match stream_document_answer(
                    state,
                    &config,
                    &ready,
                    &system_instruction,
                    &history,
                    &request.query,
                    events,
                )
                .await
                {
                    Ok(text) => answer = text,
                    Err(reason) => {
                        tracing::warn!("document mode failed, downgrading: {}", reason);
                        effective = ModeDecision::chunks(Some(reason));
                    }
                }
            }
            Err(reason) => {
                tracing::warn!("context preparation failed, downgrading: {}", reason);
                effective = ModeDecision::chunks(Some(reason));
            }
        }
    }

    if effective.mode == GenerationMode::Chunks && answer.is_empty() {
        step(events, "generating answer").await;
        answer = stream_chunk_answer(
            state,
            &config.answer_model,
            &config.document_model,
            config.temperature,
            config.max_output_tokens,
            config.max_context_chars,
            &outcome,
            &system_instruction,
            &history,
            &request.query,
            events,
        )
        .await?;
    }

    let source_list = match effective.mode {
        GenerationMode::Gemini => {
            sources::build_full_document_sources(&outcome.files, &outcome.extra_chunks)
        }
        _ => sources::build_chunk_sources(&answer, &outcome.all_chunks()),
    };

    let duration_ms = started.elapsed().as_millis() as i64;
    finish_turn(
        state,
        &conversation,
        &answer,
        source_list,
        effective.mode.as_str(),
        effective.fallback.map(|r| r.to_string()),
        outcome.chunk_count(),
        outcome.files.len(),
        duration_ms,
        events,
    )
    .await;

    spawn_summary_refresh(
        state.clone(),
        conversation,
        config.summary_model.clone(),
        request.query.clone(),
        answer,
    );

    Ok(())
}

async fn step(events: &mpsc::Sender<AskEvent>, label: &str) {
    let _ = events.send(AskEvent::Step(label.to_string())).await;
}

/// Recent turns for the prompt, minus the user turn just persisted for
/// this request.
async fn load_history(
    state: &Arc<AppState>,
    conversation: &Conversation,
    request: &AskRequest,
    recent_turns: i64,
) -> Vec<ChatMessage> {
    let mut recent = match state
        .conversations
        .recent_messages(&conversation.id, recent_turns + 1)
        .await
    {
        Ok(messages) => messages,
        Err(err) => {
            tracing::warn!("history load failed: {}", err);
            Vec::new()
        }
    };

    if recent
        .last()
        .map(|m| m.role == "user" && m.content == request.query)
        .unwrap_or(false)
    {
        recent.pop();
    }
    while recent.len() as i64 > recent_turns {
        recent.remove(0);
    }

    prompt::history_messages(conversation, &recent)
}

/// Serve a trusted memory hit: replay the cached answer as a token
/// stream, bump its trust counter, persist the turn, emit sources.
async fn replay_memory(
    state: &Arc<AppState>,
    conversation: &Conversation,
    hit: QaMemoryHit,
    events: &mpsc::Sender<AskEvent>,
    started: Instant,
) -> Result<(), ApiError> {
    step(events, "answer memory hit").await;
    tracing::debug!(
        question = %hit.entry.question,
        similarity = hit.similarity,
        "serving from answer memory"
    );

    for word in hit.entry.answer.split_whitespace() {
        let _ = events.send(AskEvent::Token(format!("{} ", word))).await;
    }

    if let Err(err) = state.qa_memory.record_use(hit.entry.id).await {
        tracing::warn!("trust increment failed: {}", err);
    }

    let source_list: Vec<SourceEntry> = hit
        .entry
        .file_ids
        .iter()
        .map(|id| SourceEntry {
            file_id: Some(id.clone()),
            name: id.clone(),
            layer: Layer::Org,
            page_count: None,
            similarity: hit.similarity,
            source_type: "memory".to_string(),
        })
        .collect();

    let duration_ms = started.elapsed().as_millis() as i64;
    finish_turn(
        state,
        conversation,
        &hit.entry.answer,
        source_list,
        "memory",
        None,
        0,
        0,
        duration_ms,
        events,
    )
    .await;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn finish_turn(
    state: &Arc<AppState>,
    conversation: &Conversation,
    answer: &str,
    source_list: Vec<SourceEntry>,
    mode: &str,
    fallback_reason: Option<String>,
    chunk_count: usize,
    file_count: usize,
    duration_ms: i64,
    events: &mpsc::Sender<AskEvent>,
) {
    let sources_json = serde_json::to_value(&source_list).ok();
    if let Err(err) = state
        .conversations
        .add_message(
            &conversation.id,
            "assistant",
            answer,
            sources_json.as_ref(),
            Some(mode),
            Some(duration_ms),
        )
        .await
    {
        tracing::warn!("failed to persist assistant turn: {}", err);
    }

    let _ = events
        .send(AskEvent::Sources(SourcesPayload {
            conversation_id: conversation.id.clone(),
            generation_mode: mode.to_string(),
            fallback_reason,
            sources: source_list,
            chunk_count,
            file_count,
            duration_ms,
        }))
        .await;
}

/// Stream a full-document answer. Returns the accumulated text, or the
/// reason to downgrade when the stream failed before emitting anything.
/// Once tokens have reached the client a failure only truncates; a chunk
/// rerun would duplicate output.
async fn stream_document_answer(
    state: &Arc<AppState>,
    config: &crate::config::AgentConfig,
    ready: &ReadyContext,
    system_instruction: &str,
    history: &[ChatMessage],
    query: &str,
    events: &mpsc::Sender<AskEvent>,
) -> Result<String, FallbackReason> {
    let system = if ready.cache_name.is_some() {
        None
    } else {
        Some(system_instruction)
    };

    let mut rx = state
        .gemini
        .stream_document_answer(
            &config.document_model,
            ready.cache_name.as_deref(),
            system,
            &ready.files,
            history,
            query,
            config.temperature,
            config.max_output_tokens,
        )
        .await
        .map_err(|e| FallbackReason::Generation(e.to_string()))?;

    let mut answer = String::new();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(token) => {
                answer.push_str(&token);
                let _ = events.send(AskEvent::Token(token)).await;
            }
            Err(err) => {
                if answer.is_empty() {
                    return Err(FallbackReason::Generation(err.to_string()));
                }
                tracing::warn!("document stream ended early: {}", err);
                break;
            }
        }
    }

    Ok(answer)
}

#[allow(clippy::too_many_arguments)]
async fn stream_chunk_answer(
    state: &Arc<AppState>,
    answer_model: &str,
    document_model: &str,
    temperature: f64,
    max_output_tokens: i32,
    max_context_chars: usize,
    outcome: &RetrievalOutcome,
    system_instruction: &str,
    history: &[ChatMessage],
    query: &str,
    events: &mpsc::Sender<AskEvent>,
) -> Result<String, ApiError> {
    let (provider, model): (&dyn GenerationProvider, &str) = if state.openai.available() {
        (&state.openai, answer_model)
    } else if state.gemini.available() {
        (state.gemini.as_ref(), document_model)
    } else {
        return Err(ApiError::ServiceUnavailable(
            "no generation provider credential configured".to_string(),
        ));
    };

    let context = format_chunk_context(&outcome.all_chunks(), max_context_chars);

    let mut messages = vec![ChatMessage::system(system_instruction)];
    if !context.is_empty() {
        messages.push(ChatMessage::system(format!(
            "Relevant excerpts from the corpus:\n\n{}",
            context
        )));
    }
    messages.extend_from_slice(history);
    messages.push(ChatMessage::user(query));

    let request = ChatRequest::new(messages).with_limits(temperature, max_output_tokens);
    let mut rx = provider.stream_chat(request, model).await?;

    let mut answer = String::new();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(token) => {
                answer.push_str(&token);
                let _ = events.send(AskEvent::Token(token)).await;
            }
            Err(err) => {
                if answer.is_empty() {
                    return Err(err);
                }
                tracing::warn!("chunk stream ended early: {}", err);
                break;
            }
        }
    }

    Ok(answer)
}

/// Refresh the running summary in the background after a completed turn.
fn spawn_summary_refresh(
    state: Arc<AppState>,
    conversation: Conversation,
    summary_model: String,
    question: String,
    answer: String,
) {
    if answer.trim().is_empty() {
        return;
    }

    tokio::spawn(async move {
        let provider: &dyn GenerationProvider = if state.openai.available() {
            &state.openai
        } else if state.gemini.available() {
            state.gemini.as_ref()
        } else {
            return;
        };

        let prior = conversation.summary.clone().unwrap_or_default();
        let request = ChatRequest::new(vec![
            ChatMessage::system(
                "Maintain a running summary of this conversation in at most five \
                 sentences. Keep names, figures and open questions.",
            ),
            ChatMessage::user(format!(
                "Current summary:\n{}\n\nNew exchange:\nQ: {}\nA: {}",
                prior, question, answer
            )),
        ]);

        match provider.chat(request, &summary_model).await {
            Ok(summary) if !summary.trim().is_empty() => {
                if let Err(err) = state
                    .conversations
                    .update_summary(&conversation.id, summary.trim())
                    .await
                {
                    tracing::warn!("summary persist failed: {}", err);
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("summary refresh failed: {}", err),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_request() -> AskRequest {
        AskRequest {
            query: "What is the refund policy?".to_string(),
            user_id: "u1".to_string(),
            org_id: None,
            project_id: None,
            app_id: None,
            rewritten_query: None,
            intent: None,
            generation_mode: None,
            include_app_layer: true,
            include_org_layer: true,
            include_project_layer: true,
            include_user_layer: true,
            filter_source_types: None,
            boost_ids: vec![],
        }
    }

    #[test]
    fn validation_rejects_missing_fields() {
        let mut request = minimal_request();
        request.query = "  ".to_string();
        assert!(request.validate().is_err());

        let mut request = minimal_request();
        request.user_id = String::new();
        assert!(request.validate().is_err());

        assert!(minimal_request().validate().is_ok());
    }

    #[test]
    fn rewritten_query_wins_for_embedding() {
        let mut request = minimal_request();
        assert_eq!(request.embedding_text(), "What is the refund policy?");

        request.rewritten_query = Some("refund policy duration".to_string());
        assert_eq!(request.embedding_text(), "refund policy duration");

        request.rewritten_query = Some("   ".to_string());
        assert_eq!(request.embedding_text(), "What is the refund policy?");
    }

    #[test]
    fn layer_flags_default_to_true() {
        let request: AskRequest =
            serde_json::from_str(r#"{"query": "q", "user_id": "u1"}"#).unwrap();
        assert!(request.include_app_layer);
        assert!(request.include_org_layer);
        assert!(request.include_project_layer);
        assert!(request.include_user_layer);
        assert!(request.boost_ids.is_empty());
    }
}
