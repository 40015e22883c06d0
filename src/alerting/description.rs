use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DescriptionError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Description service returned HTTP {status}: {body}")]
    Service { status: u16, body: String },
    #[error("Description service returned an empty response")]
    Empty,
}

/// Natural-language description of what changed between two frames.
#[async_trait]
pub trait DescriptionService: Send + Sync {
    async fn describe_change(
        &self,
        previous: &[u8],
        current: &[u8],
        mime: &str,
    ) -> Result<String, DescriptionError>;
}

const PROMPT: &str = "You are watching a fixed camera. The first image is the previous frame and \
the second image is the current frame. Describe in one or two short sentences what changed \
between them. If nothing meaningful changed (lighting flicker, compression noise), answer \
exactly: No significant changes.";

/// Client for an OpenAI-compatible chat-completions endpoint with image input.
pub struct ChatDescriptionService {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl ChatDescriptionService {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DescriptionError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into(),
            api_key,
            model: model.into(),
        })
    }

    fn payload(&self, previous: &[u8], current: &[u8], mime: &str) -> Value {
        let data_url = |bytes: &[u8]| format!("data:{mime};base64,{}", STANDARD.encode(bytes));
        json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": PROMPT },
                        { "type": "image_url", "image_url": { "url": data_url(previous) } },
                        { "type": "image_url", "image_url": { "url": data_url(current) } }
                    ]
                }
            ],
            "max_tokens": 256,
            "temperature": 0.2,
        })
    }
}

#[async_trait]
impl DescriptionService for ChatDescriptionService {
    async fn describe_change(
        &self,
        previous: &[u8],
        current: &[u8],
        mime: &str,
    ) -> Result<String, DescriptionError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&self.payload(previous, current, mime));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            crate::utils::truncate_on_char_boundary(&mut body, 300);
            return Err(DescriptionError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let data: Value = response.json().await?;
        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(DescriptionError::Empty);
        }
        Ok(text)
    }
}

/// Whether a description amounts to "no significant change(s)", ignoring case
/// and punctuation.
pub fn is_no_significant_change(description: &str) -> bool {
    let normalized = crate::utils::normalize_text(description);
    matches!(
        normalized.as_str(),
        "no significant change" | "no significant changes"
    )
}
