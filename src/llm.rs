//! HTTP clients for vision-capable chat models.
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{LlmSettings, Provider};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited by provider")]
    RateLimit,

    #[error("model client misconfigured: {0}")]
    Config(String),

    #[error("model returned no content")]
    EmptyResponse,
}

impl LlmError {
    /// Worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::RateLimit | LlmError::EmptyResponse => true,
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Network(e.to_string())
    }
}

/// One-shot multimodal completion.
#[async_trait]
pub trait VisionModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        image_png: Option<&[u8]>,
    ) -> Result<String, LlmError>;
}

/// Builds the client selected by `settings.provider`.
pub fn from_settings(settings: &LlmSettings) -> Result<Arc<dyn VisionModel>, LlmError> {
    let api_key = settings.resolve_api_key().ok_or_else(|| {
        LlmError::Config(match settings.provider {
            Provider::Openai => "OPENAI_API_KEY not set in environment".into(),
            Provider::Gemini => "GOOGLE_API_KEY not set in environment".into(),
        })
    })?;
    let client = Client::builder()
        .timeout(Duration::from_millis(settings.request_timeout_ms))
        .build()?;
    let model: Arc<dyn VisionModel> = match settings.provider {
        Provider::Openai => Arc::new(OpenAiVision {
            client,
            endpoint: settings.endpoint(),
            api_key,
            model: settings.model_name(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }),
        Provider::Gemini => Arc::new(GeminiVision {
            client,
            endpoint: settings.endpoint(),
            api_key,
            model: settings.model_name(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }),
    };
    Ok(model)
}

/// OpenAI-compatible `/chat/completions`.
pub struct OpenAiVision {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[async_trait]
impl VisionModel for OpenAiVision {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        image_png: Option<&[u8]>,
    ) -> Result<String, LlmError> {
        let mut user_content = vec![json!({"type": "text", "text": prompt})];
        if let Some(png) = image_png.filter(|b| !b.is_empty()) {
            user_content.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/png;base64,{}", STANDARD.encode(png))},
            }));
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user_content},
                ],
                "temperature": self.temperature,
                "max_tokens": self.max_tokens,
            }))
            .send()
            .await?;

        let body = checked_json(response).await?;
        openai_text(&body).ok_or(LlmError::EmptyResponse)
    }
}

/// Google `generateContent`.
pub struct GeminiVision {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[async_trait]
impl VisionModel for GeminiVision {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        image_png: Option<&[u8]>,
    ) -> Result<String, LlmError> {
        let mut parts = vec![json!({"text": prompt})];
        if let Some(png) = image_png.filter(|b| !b.is_empty()) {
            parts.push(json!({
                "inline_data": {"mime_type": "image/png", "data": STANDARD.encode(png)},
            }));
        }

        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.endpoint, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({
                "system_instruction": {"parts": [{"text": system}]},
                "contents": [{"role": "user", "parts": parts}],
                "generationConfig": {
                    "temperature": self.temperature,
                    "maxOutputTokens": self.max_tokens,
                },
            }))
            .send()
            .await?;

        let body = checked_json(response).await?;
        gemini_text(&body).ok_or(LlmError::EmptyResponse)
    }
}

const MAX_ERROR_BODY_CHARS: usize = 200;

async fn checked_json(response: reqwest::Response) -> Result<Value, LlmError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(LlmError::RateLimit);
    }
    let text = response.text().await?;
    read_body(status, &text)
}

/// Error statuses become [`LlmError::Api`] whatever the body looks like.
fn read_body(status: StatusCode, text: &str) -> Result<Value, LlmError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(LlmError::RateLimit);
    }
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|body| body["error"]["message"].as_str().map(String::from))
            .unwrap_or_else(|| {
                let raw: String = text.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
                if raw.is_empty() {
                    "Unknown API error".to_string()
                } else {
                    raw
                }
            });
        tracing::warn!(target: "agent.decide", status = status.as_u16(), %message, "model API error");
        return Err(LlmError::Api {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_str(text)
        .map_err(|e| LlmError::Network(format!("unreadable response body: {e}")))
}

fn openai_text(body: &Value) -> Option<String> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn gemini_text(body: &Value) -> Option<String> {
    let text: String = body["candidates"][0]["content"]["parts"]
        .as_array()?
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
