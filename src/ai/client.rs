use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::retry::{send_with_retry, RetryPolicy};
use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// Everything the model sees for one utterance
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub system: String,
    pub prompt: String,
}

/// Reachability of the model service and whether the configured model is installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub endpoint: String,
    pub model: String,
    pub reachable: bool,
    pub model_available: bool,
    pub available_models: Vec<String>,
    pub detail: Option<String>,
}

/// Text-completion capability used by the intent parser
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<String>;

    async fn status(&self) -> Result<ModelStatus>;
}

/// Ollama `/api/generate` client
pub struct OllamaClient {
    client: Client,
    status_client: Client,
    base_url: String,
    generate_endpoint: String,
    model: String,
    temperature: f32,
    context_window: u32,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("model", &self.model)
            .field("generate_endpoint", &self.generate_endpoint)
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|err| Error::Config(format!("failed to build HTTP client: {err}")))?;
        let status_client = Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .map_err(|err| Error::Config(format!("failed to build HTTP client: {err}")))?;

        let base = config.base_url.trim_end_matches('/').to_string();
        tracing::info!(model = %config.model, url = %base, timeout_secs = config.timeout_secs, "Ollama client initialized");
        Ok(Self {
            client,
            status_client,
            generate_endpoint: format!("{base}/api/generate"),
            base_url: base,
            model: config.model.clone(),
            temperature: config.temperature,
            context_window: config.context_window,
            retry_policy: config.retry.clone(),
        })
    }

    fn payload(&self, request: &ModelRequest) -> serde_json::Value {
        json!({
            "model": self.model,
            "system": request.system,
            "prompt": request.prompt,
            "stream": false,
            "format": "json",
            "options": {
                "temperature": self.temperature,
                "num_ctx": self.context_window,
            }
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        tracing::debug!(
            model = %self.model,
            prompt_chars = request.prompt.len(),
            "Sending prompt to Ollama"
        );
        let response = send_with_retry(
            self.client.post(&self.generate_endpoint).json(&self.payload(request)),
            &self.retry_policy,
            "Ollama request",
        )
        .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<failed to read body>"));
            return Err(Error::Model(format!(
                "Ollama returned status {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| Error::Model(format!("failed to decode Ollama response: {err}")))?;

        let text = payload.response.trim().to_string();
        if text.is_empty() {
            return Err(Error::Model("the model returned an empty response".to_string()));
        }
        tracing::debug!(response = %text, "Raw model response");
        Ok(text)
    }

    async fn status(&self) -> Result<ModelStatus> {
        let mut status = ModelStatus {
            endpoint: self.base_url.clone(),
            model: self.model.clone(),
            reachable: false,
            model_available: false,
            available_models: Vec::new(),
            detail: None,
        };

        let banner = match self.status_client.get(&self.base_url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
            Ok(resp) => {
                status.detail = Some(format!("server answered with status {}", resp.status()));
                return Ok(status);
            }
            Err(err) => {
                tracing::warn!(url = %self.base_url, error = %err, "Ollama connection test failed");
                status.detail = Some(format!("cannot reach {}: {err}", self.base_url));
                return Ok(status);
            }
        };
        if !banner.contains("Ollama is running") {
            status.detail = Some(format!(
                "unexpected answer: {}",
                banner.chars().take(100).collect::<String>()
            ));
            return Ok(status);
        }
        status.reachable = true;

        let tags_url = format!("{}/api/tags", self.base_url);
        match self.status_client.get(&tags_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let tags: TagsResponse = resp
                    .json()
                    .await
                    .map_err(|err| Error::Model(format!("failed to decode model list: {err}")))?;
                status.available_models = tags.models.into_iter().map(|m| m.name).collect();
                status.model_available = status.available_models.iter().any(|m| *m == self.model);
                if !status.model_available {
                    tracing::warn!(model = %self.model, "Configured model is not installed");
                    status.detail = Some(format!("run `ollama pull {}`", self.model));
                }
            }
            Ok(resp) => {
                status.detail = Some(format!("could not list models (status {})", resp.status()));
            }
            Err(err) => {
                status.detail = Some(format!("could not list models: {err}"));
            }
        }
        Ok(status)
    }
}
