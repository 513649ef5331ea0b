//! Completion backend — the HTTP boundary to model providers.
//!
//! Backends speak the OpenAI-compatible wire (`/chat/completions`,
//! `/embeddings`, `/models`), which every supported provider (OpenAI,
//! Azure, Ollama, local llama.cpp servers) exposes. Provider SDKs are a
//! deliberate non-dependency; this is the narrow interface.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use foundry::config::BackendConfig;
use foundry::EngineError;

/// Backend-level error, classified for retry policy.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("API key env var '{0}' is not set")]
    MissingApiKey(String),
}

impl BackendError {
    /// Transient errors are retried with backoff; structural ones are not.
    /// Rate limiting (429) is always transient.
    pub fn transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout(_) => true,
            Self::Status { code, .. } => *code == 408 || *code == 429 || *code >= 500,
            Self::Malformed(_) | Self::MissingApiKey(_) => false,
        }
    }
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
}

/// One completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The provider boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, BackendError>;

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;

    /// Cheap reachability probe.
    async fn health_check(&self) -> Result<(), BackendError>;
}

/// OpenAI-compatible HTTP backend.
pub struct HttpBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Build from configuration, resolving the API key from the named
    /// environment variable. The key itself never appears in config.
    pub fn from_config(name: &str, config: &BackendConfig) -> Result<Self, EngineError> {
        let api_key = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.is_empty() => Some(key),
                _ => {
                    return Err(EngineError::Config(format!(
                        "backend '{name}': env var '{var}' is not set"
                    )))
                }
            },
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn handle_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            code: status.as_u16(),
            body: body.chars().take(512).collect(),
        })
    }

    fn classify_reqwest(err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(Duration::ZERO)
        } else if err.is_connect() {
            BackendError::Connect(err.to_string())
        } else {
            BackendError::Malformed(err.to_string())
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": req.prompt}));

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });
        if let Some(seed) = req.seed {
            body["seed"] = json!(seed);
        }

        let response = self
            .request("/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_reqwest)?;
        let response = Self::handle_status(response).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Malformed("no choices in response".into()))?;
        let usage = parsed.usage.unwrap_or_default();
        Ok(CompletionResponse {
            text: choice.message.content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let body = json!({"model": model, "input": texts});
        let response = self
            .request("/embeddings")
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_reqwest)?;
        let response = Self::handle_status(response).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let mut builder = self.client.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(Self::classify_reqwest)?;
        Self::handle_status(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Connect("refused".into()).transient());
        assert!(BackendError::Timeout(Duration::from_secs(1)).transient());
        assert!(BackendError::Status {
            code: 429,
            body: "rate limited".into()
        }
        .transient());
        assert!(BackendError::Status {
            code: 503,
            body: "".into()
        }
        .transient());
        assert!(!BackendError::Status {
            code: 400,
            body: "bad request".into()
        }
        .transient());
        assert!(!BackendError::Malformed("nonsense".into()).transient());
        assert!(!BackendError::MissingApiKey("OPENAI_API_KEY".into()).transient());
    }

    #[test]
    fn test_missing_api_key_env_rejected_at_build() {
        std::env::remove_var("CRUCIBLE_TEST_MISSING_KEY");
        let config = BackendConfig {
            api_key_env: Some("CRUCIBLE_TEST_MISSING_KEY".into()),
            ..Default::default()
        };
        assert!(HttpBackend::from_config("test", &config).is_err());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = BackendConfig {
            base_url: "http://localhost:11434/v1/".into(),
            ..Default::default()
        };
        let backend = HttpBackend::from_config("ollama", &config).unwrap();
        assert_eq!(backend.base_url, "http://localhost:11434/v1");
    }
}
