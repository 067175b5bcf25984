use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::ConfigError;
use crate::core::state::DEFAULT_PAGES;
use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;
use crate::services::speech::acgnai::SpeechConfig;

pub const CONFIG_FILE: &str = "config.yml";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_ACCESS_TOKEN: &str = "TTS_ACCESS_TOKEN";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_cache")]
    pub cache_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Retry behaviour of one external service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default = "default_initial_wait")]
    pub initial_wait_secs: f64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: f64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl RetryConfig {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_wait_secs: default_initial_wait(),
            max_wait_secs: default_max_wait(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Pause after every page, in seconds.
    #[serde(default = "default_page_delay")]
    pub page_delay_secs: f64,
    /// Minimum spacing between two calls to the same service, in milliseconds.
    #[serde(default)]
    pub min_call_spacing_ms: u64,

    #[serde(default = "default_characters")]
    pub characters: Vec<String>,
    #[serde(default = "default_themes")]
    pub themes: Vec<String>,

    // Used verbatim in unattended mode.
    #[serde(default)]
    pub character: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default = "default_page_count")]
    pub page_count: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_delay_secs: default_page_delay(),
            min_call_spacing_ms: 0,
            characters: default_characters(),
            themes: default_themes(),
            character: None,
            theme: None,
            page_count: default_page_count(),
        }
    }
}

fn default_output() -> String {
    "output".to_string()
}
fn default_cache() -> String {
    "cache/audio".to_string()
}
fn default_initial_wait() -> f64 {
    0.5
}
fn default_max_wait() -> f64 {
    32.0
}
fn default_timeout() -> u64 {
    60
}
fn default_page_delay() -> f64 {
    5.0
}
fn default_page_count() -> u8 {
    DEFAULT_PAGES
}
fn default_characters() -> Vec<String> {
    ["貓咪", "狗狗", "花花", "小鳥", "小石頭"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_themes() -> Vec<String> {
    ["親情", "友情", "冒險", "度假", "運動比賽"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Secrets from the environment win over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_API_KEY).filter(|k| !k.trim().is_empty()) {
            if let Some(openai) = self.llm.openai.as_mut() {
                openai.api_key = key.clone();
            }
            self.image.api_key = Some(key);
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN).filter(|t| !t.trim().is_empty()) {
            self.speech.access_token = token;
        }
    }

    /// Checks everything the pipeline cannot run without.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        match self.llm.provider.as_str() {
            "openai" => {
                let cfg = self.llm.openai.as_ref().ok_or_else(|| {
                    ConfigError("llm.provider is 'openai' but the openai section is missing".to_string())
                })?;
                if cfg.api_key.trim().is_empty() {
                    return Err(ConfigError(format!(
                        "OpenAI API key missing (set llm.openai.api_key or {})",
                        ENV_API_KEY
                    )));
                }
            }
            "ollama" => {
                if self.llm.ollama.is_none() {
                    return Err(ConfigError(
                        "llm.provider is 'ollama' but the ollama section is missing".to_string(),
                    ));
                }
            }
            other => return Err(ConfigError(format!("Unknown LLM provider: {}", other))),
        }

        if self.image_api_key().is_none() {
            return Err(ConfigError(format!(
                "Image API key missing (set image.api_key, llm.openai.api_key or {})",
                ENV_API_KEY
            )));
        }

        if self.speech.access_token.trim().is_empty() {
            return Err(ConfigError(format!(
                "TTS access token missing (set speech.access_token or {})",
                ENV_ACCESS_TOKEN
            )));
        }

        if self.speech.retry.max_attempts == 0
            || self.llm.retry.max_attempts == 0
            || self.image.retry.max_attempts == 0
        {
            return Err(ConfigError("retry.max_attempts must be at least 1".to_string()));
        }

        Ok(())
    }

    /// The image endpoint shares the OpenAI key unless it has its own.
    pub fn image_api_key(&self) -> Option<String> {
        self.image
            .api_key
            .clone()
            .or_else(|| self.llm.openai.as_ref().map(|o| o.api_key.clone()))
            .filter(|k| !k.trim().is_empty())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.cache_folder)?;
        Ok(())
    }
}
