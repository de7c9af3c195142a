use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::ChatRequest;
use crate::core::errors::ApiError;

/// Streaming contract shared by both generation providers.
///
/// `stream_chat` yields text fragments as they arrive; the receiver closes
/// at end of stream. Drivers tolerate malformed server-sent lines without
/// aborting the stream.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// provider name (e.g. "openai", "gemini")
    fn name(&self) -> &str;

    /// whether the provider has a usable credential
    fn available(&self) -> bool;

    /// chat completion (non-streaming)
    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, ApiError>;

    /// chat completion (streaming)
    async fn stream_chat(
        &self,
        request: ChatRequest,
        model_id: &str,
    ) -> Result<mpsc::Receiver<Result<String, ApiError>>, ApiError>;
}
