use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::provider::GenerationProvider;
use super::types::{ChatMessage, ChatRequest};
use crate::core::errors::ApiError;

/// Google Gemini driver.
///
/// Covers the three provider surfaces the pipeline needs: the file store
/// (`/upload/v1beta/files`), server-side context caches
/// (`/v1beta/cachedContents`), and SSE generation
/// (`:streamGenerateContent?alt=sse`). Also implements the shared
/// [`GenerationProvider`] contract for plain chunk-context chats.
#[derive(Clone)]
pub struct GeminiClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

/// A file uploaded to the provider file store.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub uri: String,
}

/// A provider-side context cache.
#[derive(Debug, Clone)]
pub struct CreatedCache {
    pub name: String,
    pub expire_time: Option<String>,
}

/// File reference attached to a generation request or cache.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub uri: String,
    pub mime_type: String,
}

impl GeminiClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::new(),
        }
    }

    fn key(&self) -> Result<&str, ApiError> {
        self.api_key.as_deref().ok_or_else(|| {
            ApiError::ServiceUnavailable("document provider credential missing".to_string())
        })
    }

    /// Upload raw bytes to the provider file store and return its handle.
    pub async fn upload_file(
        &self,
        display_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedFile, ApiError> {
        let url = format!("{}/upload/v1beta/files?key={}", self.base_url, self.key()?);

        let res = self
            .client
            .post(&url)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("X-Goog-File-Name", display_name)
            .header("Content-Type", mime_type)
            .body(bytes)
            .send()
            .await
            .map_err(ApiError::upstream)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "file upload failed ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(ApiError::upstream)?;
        let name = payload["file"]["name"].as_str().unwrap_or_default();
        let uri = payload["file"]["uri"].as_str().unwrap_or_default();
        if name.is_empty() || uri.is_empty() {
            return Err(ApiError::Upstream(
                "file upload returned no handle".to_string(),
            ));
        }

        Ok(UploadedFile {
            name: name.to_string(),
            uri: uri.to_string(),
        })
    }

    /// Create a context cache holding the system instruction and the file
    /// references, with the given TTL.
    pub async fn create_cache(
        &self,
        model_id: &str,
        display_name: &str,
        system_instruction: &str,
        files: &[FileRef],
        ttl_secs: i64,
    ) -> Result<CreatedCache, ApiError> {
        let url = format!("{}/v1beta/cachedContents?key={}", self.base_url, self.key()?);

        let parts: Vec<Value> = files
            .iter()
            .map(|f| {
                json!({
                    "fileData": {
                        "mimeType": f.mime_type,
                        "fileUri": f.uri,
                    }
                })
            })
            .collect();

        let body = json!({
            "model": format!("models/{}", model_id),
            "displayName": display_name,
            "systemInstruction": { "parts": [{ "text": system_instruction }] },
            "contents": [{ "role": "user", "parts": parts }],
            "ttl": format!("{}s", ttl_secs),
        });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::upstream)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "cache creation failed ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(ApiError::upstream)?;
        let name = payload["name"].as_str().unwrap_or_default();
        if name.is_empty() {
            return Err(ApiError::Upstream(
                "cache creation returned no name".to_string(),
            ));
        }

        Ok(CreatedCache {
            name: name.to_string(),
            expire_time: payload["expireTime"].as_str().map(|s| s.to_string()),
        })
    }

    /// Stream an answer grounded in whole documents, through a context
    /// cache when one is ready, otherwise with inline file references.
    pub async fn stream_document_answer(
        &self,
        model_id: &str,
        cache_name: Option<&str>,
        system_instruction: Option<&str>,
        files: &[FileRef],
        history: &[ChatMessage],
        query: &str,
        temperature: f64,
        max_output_tokens: i32,
    ) -> Result<mpsc::Receiver<Result<String, ApiError>>, ApiError> {
        let mut contents = history_contents(history);

        let mut user_parts: Vec<Value> = Vec::new();
        if cache_name.is_none() {
            for f in files {
                user_parts.push(json!({
                    "fileData": { "mimeType": f.mime_type, "fileUri": f.uri }
                }));
            }
        }
        user_parts.push(json!({ "text": query }));
        contents.push(json!({ "role": "user", "parts": user_parts }));

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_output_tokens,
            },
        });
        if let Some(cache) = cache_name {
            body["cachedContent"] = json!(cache);
        } else if let Some(system) = system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        self.stream_generate(model_id, body).await
    }

    async fn stream_generate(
        &self,
        model_id: &str,
        body: Value,
    ) -> Result<mpsc::Receiver<Result<String, ApiError>>, ApiError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url,
            model_id,
            self.key()?
        );

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::upstream)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "generation stream failed ({}): {}",
                status, text
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            match serde_json::from_str::<Value>(data) {
                                Ok(v) => {
                                    for text in candidate_texts(&v) {
                                        if !text.is_empty()
                                            && tx.send(Ok(text)).await.is_err()
                                        {
                                            return;
                                        }
                                    }
                                }
                                Err(err) => {
                                    tracing::debug!("skipping unparsable stream line: {}", err);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(ApiError::upstream(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn candidate_texts(payload: &Value) -> Vec<String> {
    let mut texts = Vec::new();
    if let Some(candidates) = payload["candidates"].as_array() {
        for candidate in candidates {
            if let Some(parts) = candidate["content"]["parts"].as_array() {
                for part in parts {
                    if let Some(text) = part["text"].as_str() {
                        texts.push(text.to_string());
                    }
                }
            }
        }
    }
    texts
}

/// Map shared chat messages into Gemini contents. System messages are
/// handled separately (systemInstruction or cache), so they are skipped.
fn history_contents(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| {
            let role = if m.role == "assistant" { "model" } else { "user" };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect()
}

#[async_trait]
impl GenerationProvider for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, ApiError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url,
            model_id,
            self.key()?
        );

        let body = chat_body(&request);
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::upstream)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "chat completion failed ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(ApiError::upstream)?;
        Ok(candidate_texts(&payload).join(""))
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        model_id: &str,
    ) -> Result<mpsc::Receiver<Result<String, ApiError>>, ApiError> {
        let body = chat_body(&request);
        self.stream_generate(model_id, body).await
    }
}

fn chat_body(request: &ChatRequest) -> Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();

    let mut body = json!({ "contents": history_contents(&request.messages) });
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".to_string(), json!(t));
    }
    if let Some(t) = request.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(t));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_texts_extracts_parts() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello" }, { "text": " world" }] }
            }]
        });
        assert_eq!(candidate_texts(&payload), vec!["Hello", " world"]);
    }

    #[test]
    fn candidate_texts_tolerates_empty_candidates() {
        let payload = json!({ "candidates": [{ "finishReason": "SAFETY" }] });
        assert!(candidate_texts(&payload).is_empty());
    }

    #[test]
    fn history_contents_maps_roles_and_drops_system() {
        let messages = vec![
            ChatMessage::system("rules"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let contents = history_contents(&messages);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }
}
