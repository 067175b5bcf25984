use async_trait::async_trait;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::config::{Config, RetryConfig};
use crate::core::error::{ClientError, Service};
use crate::services::net::{ResilientClient, RetryPolicy};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    /// Falls back to the OpenAI chat key when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_image_retry")]
    pub retry: RetryConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            size: default_size(),
            base_url: default_base_url(),
            retry: default_image_retry(),
        }
    }
}

fn default_model() -> String {
    "dall-e-3".to_string()
}
fn default_size() -> String {
    "1024x1024".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_image_retry() -> RetryConfig {
    RetryConfig::with_attempts(3)
}

/// Image generator. Returns a reference (URL or data URI) to the picture.
#[async_trait]
pub trait ImageClient: Send + Sync {
    async fn generate(&self, prompt: &str, style: &str) -> Result<String, ClientError>;
}

/// Every page of a run is drawn in the same style.
pub fn compose_prompt(prompt: &str, style: &str) -> String {
    let style = style.trim();
    if style.is_empty() {
        prompt.trim().to_string()
    } else {
        format!("{}\n\nStyle: {}", prompt.trim(), style)
    }
}

pub struct OpenAIImageClient {
    api_key: String,
    model: String,
    size: String,
    base_url: String,
    client: ResilientClient,
}

impl OpenAIImageClient {
    pub fn new(config: &Config) -> Result<Self> {
        let cfg = &config.image;
        Ok(Self {
            api_key: config.image_api_key().unwrap_or_default(),
            model: cfg.model.clone(),
            size: cfg.size.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            client: ResilientClient::new(Service::Image, RetryPolicy::from(&cfg.retry))?,
        })
    }
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: String,
    size: &'a str,
    n: u32,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
    b64_json: Option<String>,
}

fn image_reference(value: Value) -> Result<String, String> {
    let resp: ImageResponse =
        serde_json::from_value(value).map_err(|e| format!("unexpected image response: {}", e))?;
    let first = resp
        .data
        .into_iter()
        .next()
        .ok_or_else(|| "image response contains no data".to_string())?;
    match (first.url, first.b64_json) {
        (Some(url), _) if !url.is_empty() => Ok(url),
        (_, Some(b64)) if !b64.is_empty() => Ok(format!("data:image/png;base64,{}", b64)),
        _ => Err("image response has neither url nor b64_json".to_string()),
    }
}

#[async_trait]
impl ImageClient for OpenAIImageClient {
    async fn generate(&self, prompt: &str, style: &str) -> Result<String, ClientError> {
        let url = format!("{}/images/generations", self.base_url);
        let body = ImageRequest {
            model: &self.model,
            prompt: compose_prompt(prompt, style),
            size: &self.size,
            n: 1,
        };
        let echo = serde_json::to_string(&body).unwrap_or_default();

        self.client
            .execute_json(
                &echo,
                |http| http.post(&url).bearer_auth(&self.api_key).json(&body),
                image_reference,
            )
            .await
    }
}
