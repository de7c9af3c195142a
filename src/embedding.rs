use reqwest::Client;
use serde_json::{json, Value};

use crate::core::errors::ApiError;

/// Client for the external embedding provider (OpenAI-style `/embeddings`).
///
/// An embedding failure is fatal for the request: nothing downstream can
/// run without the query vector, so there is no retry here.
#[derive(Clone)]
pub struct EmbeddingClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl EmbeddingClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::new(),
        }
    }

    pub async fn embed(&self, text: &str, model_id: &str) -> Result<Vec<f32>, ApiError> {
        let key = self.api_key.as_deref().ok_or_else(|| {
            ApiError::ServiceUnavailable("embedding provider credential missing".to_string())
        })?;

        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": model_id,
            "input": text,
        });

        let res = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::upstream)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!(
                "embedding failed ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(ApiError::upstream)?;
        let vector: Vec<f32> = payload["data"][0]["embedding"]
            .as_array()
            .map(|vals| {
                vals.iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_default();

        if vector.is_empty() {
            return Err(ApiError::Upstream(
                "embedding response carried no vector".to_string(),
            ));
        }

        Ok(vector)
    }
}
