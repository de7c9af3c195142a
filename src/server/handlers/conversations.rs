use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub user_id: String,
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let conversations = state.conversations.list_for_user(&params.user_id).await?;
    Ok(Json(json!({ "conversations": conversations })))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conversation = state
        .conversations
        .get(&conversation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("conversation {}", conversation_id)))?;
    Ok(Json(json!({ "conversation": conversation })))
}

pub async fn get_conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.conversations.get(&conversation_id).await?.is_none() {
        return Err(ApiError::NotFound(format!(
            "conversation {}",
            conversation_id
        )));
    }
    let messages = state.conversations.all_messages(&conversation_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.conversations.delete(&conversation_id).await?;
    Ok(Json(json!({ "deleted": conversation_id })))
}
