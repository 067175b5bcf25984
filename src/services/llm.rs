use async_trait::async_trait;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

use crate::core::config::{Config, RetryConfig};
use crate::core::error::{ClientError, Service};
use crate::services::net::{ResilientClient, RetryPolicy};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub openai: Option<OpenAIConfig>,
    pub ollama: Option<OllamaConfig>,
    #[serde(default = "default_llm_retry")]
    pub retry: RetryConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_llm_retry() -> RetryConfig {
    RetryConfig::with_attempts(3)
}

/// Text generator: one system + user prompt in, completion text out.
#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String, ClientError>;
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    let policy = RetryPolicy::from(&config.llm.retry);
    match config.llm.provider.as_str() {
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().context("Ollama config missing")?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model, policy)?))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            Ok(Box::new(OpenAIClient::new(
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
                policy,
            )?))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

fn messages(system: &str, user: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system".to_string(),
            content: system.to_string(),
        },
        ChatMessage {
            role: "user".to_string(),
            content: user.to_string(),
        },
    ]
}

// --- Ollama ---

#[derive(Clone)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: ResilientClient,
}

impl Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OllamaClient {
    fn new(base_url: &str, model: &str, policy: RetryPolicy) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: ResilientClient::new(Service::Text, policy)?,
        })
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: Option<OllamaMessageResponse>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    #[serde(default)]
    content: String,
}

fn ollama_content(value: Value) -> Result<String, String> {
    let resp: OllamaResponse =
        serde_json::from_value(value).map_err(|e| format!("unexpected Ollama response: {}", e))?;
    if let Some(err) = resp.error {
        return Err(format!("Ollama returned error: {}", err));
    }
    resp.message
        .map(|m| m.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| "Ollama response has no message content".to_string())
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String, ClientError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaRequest {
            model: self.model.clone(),
            messages: messages(system, user),
            stream: false,
        };
        let echo = serde_json::to_string(&body).unwrap_or_default();

        self.client
            .execute_json(&echo, |http| http.post(&url).json(&body), ollama_content)
            .await
    }
}

// --- OpenAI ---

#[derive(Clone)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: ResilientClient,
}

impl Debug for OpenAIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>, policy: RetryPolicy) -> Result<Self> {
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_OPENAI_URL)
                .trim_end_matches('/')
                .to_string(),
            client: ResilientClient::new(Service::Text, policy)?,
        })
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

fn openai_content(value: Value) -> Result<String, String> {
    let resp: OpenAIResponse =
        serde_json::from_value(value).map_err(|e| format!("unexpected OpenAI response: {}", e))?;
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| "OpenAI response empty or missing content".to_string())
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String, ClientError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAIRequest {
            model: self.model.clone(),
            messages: messages(system, user),
        };
        let echo = serde_json::to_string(&body).unwrap_or_default();

        self.client
            .execute_json(
                &echo,
                |http| {
                    http.post(&url)
                        .bearer_auth(&self.api_key)
                        .json(&body)
                },
                openai_content,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1677652288,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "1. 小貓迷路了"
                },
                "logprobs": null,
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21 }
        }"#;

        let value: Value = serde_json::from_str(json).unwrap();
        assert_eq!(openai_content(value).unwrap(), "1. 小貓迷路了");
    }

    #[test]
    fn test_openai_missing_content_is_an_error() {
        let value: Value = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": null}}]}"#,
        )
        .unwrap();
        assert!(openai_content(value).is_err());

        let value: Value = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(openai_content(value).is_err());
    }

    #[test]
    fn test_ollama_response_parsing() {
        let value: Value = serde_json::from_str(
            r#"{"model": "qwen", "message": {"role": "assistant", "content": "happy"}, "done": true}"#,
        )
        .unwrap();
        assert_eq!(ollama_content(value).unwrap(), "happy");

        let value: Value = serde_json::from_str(r#"{"error": "model not found"}"#).unwrap();
        assert!(ollama_content(value).unwrap_err().contains("model not found"));
    }

    #[test]
    fn test_request_serialization() {
        let body = OpenAIRequest {
            model: "gpt-4o-mini".to_string(),
            messages: messages("sys", "user"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "user");
    }

    #[test]
    fn test_create_llm_rejects_unknown_provider() {
        let mut config: Config = serde_yaml_ng::from_str(
            "llm:\n  provider: gemini\n",
        )
        .unwrap();
        assert!(create_llm(&config).is_err());
        config.llm.provider = "ollama".to_string();
        config.llm.ollama = Some(OllamaConfig {
            base_url: "http://localhost:11434/".to_string(),
            model: "qwen".to_string(),
        });
        let llm = create_llm(&config).unwrap();
        assert!(format!("{:?}", llm).contains("http://localhost:11434"));
    }
}
