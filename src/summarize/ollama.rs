//! Ollama-compatible inference client
//!
//! Speaks the OpenAI-style `/v1/chat/completions` and `/v1/models` endpoints
//! that Ollama exposes locally. Everything behind the `InferenceClient` trait
//! so the engine can be tested without a running model.

use async_trait::async_trait;
use tracing::debug;

use crate::config::SummarizerSettings;
use crate::types::error::{MailError, Result};

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(serde::Deserialize)]
struct ModelsResponse {
    data: Vec<ModelItem>,
}

#[derive(serde::Deserialize)]
struct ModelItem {
    id: String,
}

/// Local inference backend.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Model IDs the backend currently serves.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// One non-streaming completion.
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

pub struct OllamaClient {
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(settings: &SummarizerSettings) -> Result<Self> {
        // The engine applies its own overall deadline; this client-level
        // timeout only bounds a wedged connection.
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| MailError::ModelUnavailable(format!("HTTP client error: {}", e)))?;
        Ok(Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            http,
        })
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn list_models(&self) -> Result<Vec<String>> {
        let endpoint = format!("{}/v1/models", self.base_url);
        debug!("Fetching models from {}", endpoint);

        let resp = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| MailError::ModelUnavailable(format!("model host unreachable: {}", e)))?;
        let body: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| MailError::ModelUnavailable(format!("bad models response: {}", e)))?;
        Ok(body.data.into_iter().map(|m| m.id).collect())
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let endpoint = format!("{}/v1/chat/completions", self.base_url);

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt }
            ],
            "temperature": 0.2,
            "stream": false
        });

        let resp = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MailError::ModelTimeout(0)
                } else {
                    MailError::ModelUnavailable(format!("inference request failed: {}", e))
                }
            })?;

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| MailError::ModelUnavailable(format!("bad completion response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| MailError::ModelUnavailable("completion had no choices".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
