use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::llm::provider::GenerationProvider;
use crate::state::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "providers": {
            "gemini": state.gemini.available(),
            "openai": state.openai.available(),
            "embedding": state.settings.embedding_api_key.is_some(),
        },
    }))
}
