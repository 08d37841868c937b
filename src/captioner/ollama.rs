use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::{error_message, Captioner, DEFAULT_REVERSE_PROMPT};
use crate::error::CaptionError;
use crate::parser;
use crate::types::ImagePayload;

/// Configuration for a local Ollama vision model.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Ollama API endpoint (e.g., "http://localhost:11434")
    pub endpoint: String,
    /// Vision model name (e.g., "llava", "llava-llama3", "minicpm-v")
    pub model: String,
    /// Instruction sent alongside each image.
    pub prompt: String,
    /// Request timeout (default: 120s)
    pub timeout: Duration,
    /// Generation options sent to Ollama
    pub options: GenerateOptions,
}

/// Ollama generation options controlling output quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Maximum tokens to generate
    pub num_predict: u32,
    /// Penalize repeated tokens (default: 1.2)
    pub repeat_penalty: f32,
    /// Window for repeat penalty (default: 128)
    pub repeat_last_n: u32,
    /// Temperature (default: None, uses Ollama default)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            num_predict: 256,
            repeat_penalty: 1.2,
            repeat_last_n: 128,
            temperature: None,
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llava".to_string(),
            prompt: DEFAULT_REVERSE_PROMPT.to_string(),
            timeout: Duration::from_secs(120),
            options: GenerateOptions::default(),
        }
    }
}

impl OllamaConfig {
    /// Create a new config with the given model name.
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the Ollama endpoint.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the generation options.
    pub fn options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }
}

/// Reverse-prompt captioning through a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaCaptioner {
    http: Client,
    config: OllamaConfig,
}

impl OllamaCaptioner {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    /// Use a custom `reqwest::Client`.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    fn request_body(&self, image: &ImagePayload) -> Value {
        json!({
            "model": self.config.model,
            "prompt": self.config.prompt,
            "images": [image.base64()],
            "stream": false,
            "options": self.config.options,
        })
    }
}

impl Captioner for OllamaCaptioner {
    async fn caption(&self, image: &ImagePayload) -> Result<String, CaptionError> {
        let url = format!("{}/api/generate", self.config.endpoint);
        let resp = self
            .http
            .post(&url)
            .timeout(self.config.timeout)
            .json(&self.request_body(image))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CaptionError::Timeout(self.config.timeout)
                } else {
                    CaptionError::Connection {
                        endpoint: self.config.endpoint.clone(),
                        source: e,
                    }
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(CaptionError::Http {
                status,
                body: error_message(&text),
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| CaptionError::InvalidResponse(e.to_string()))?;

        parse_response(&json)
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

/// Extract the caption from an `/api/generate` response body.
pub fn parse_response(json: &Value) -> Result<String, CaptionError> {
    let raw = json
        .get("response")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CaptionError::InvalidResponse("missing \"response\" field".to_string()))?;

    parser::clean_caption(raw).ok_or(CaptionError::EmptyCaption)
}
