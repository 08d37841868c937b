use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::{error_message, Captioner, DEFAULT_REVERSE_PROMPT};
use crate::error::{BatchError, CaptionError};
use crate::parser;
use crate::types::ImagePayload;

/// Finish reasons that mean the model refused rather than failed.
const BLOCKING_FINISH_REASONS: [&str; 6] = [
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
    "IMAGE_SAFETY",
];

/// Configuration for the Gemini `generateContent` backend.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API root (e.g., "https://generativelanguage.googleapis.com")
    pub endpoint: String,
    /// Model name (e.g., "gemini-2.5-flash-lite")
    pub model: String,
    /// Sent as `x-goog-api-key`.
    pub api_key: String,
    /// Instruction sent alongside each image.
    pub prompt: String,
    /// Request timeout (default: 120s)
    pub timeout: Duration,
    pub generation: GenerationConfig,
}

/// Sampling options forwarded as `generationConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.5-flash-lite".to_string(),
            api_key: String::new(),
            prompt: DEFAULT_REVERSE_PROMPT.to_string(),
            timeout: Duration::from_secs(120),
            generation: GenerationConfig::default(),
        }
    }
}

impl GeminiConfig {
    /// Create a config for the default model with the given API key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }
}

/// Reverse-prompt captioning through the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiCaptioner {
    http: Client,
    config: GeminiConfig,
}

impl GeminiCaptioner {
    /// Fails if the API key or model is missing; both are required before any call.
    pub fn new(config: GeminiConfig) -> Result<Self, BatchError> {
        if config.api_key.trim().is_empty() {
            return Err(BatchError::Config(
                "Gemini API key is empty (set --api-key or GEMINI_API_KEY)".to_string(),
            ));
        }
        if config.model.trim().is_empty() {
            return Err(BatchError::Config("model name is empty".to_string()));
        }
        Ok(Self {
            http: Client::new(),
            config,
        })
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.endpoint, self.config.model
        )
    }

    fn request_body(&self, image: &ImagePayload) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": self.config.prompt },
                    { "inline_data": { "mime_type": image.mime_type, "data": image.base64() } },
                ],
            }],
            "generationConfig": self.config.generation,
        })
    }
}

impl Captioner for GeminiCaptioner {
    async fn caption(&self, image: &ImagePayload) -> Result<String, CaptionError> {
        let resp = self
            .http
            .post(self.url())
            .header("x-goog-api-key", &self.config.api_key)
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

/// Extract the caption from a `generateContent` response body.
pub fn parse_response(json: &Value) -> Result<String, CaptionError> {
    if let Some(reason) = json
        .pointer("/promptFeedback/blockReason")
        .and_then(|v| v.as_str())
    {
        return Err(CaptionError::Blocked(reason.to_string()));
    }

    let candidate = json.pointer("/candidates/0").ok_or_else(|| {
        CaptionError::InvalidResponse("response contains no candidates".to_string())
    })?;

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if let Some(caption) = parser::clean_caption(&text) {
        return Ok(caption);
    }

    match candidate.get("finishReason").and_then(|v| v.as_str()) {
        Some(reason) if BLOCKING_FINISH_REASONS.contains(&reason) => {
            Err(CaptionError::Blocked(reason.to_string()))
        }
        _ => Err(CaptionError::EmptyCaption),
    }
}
