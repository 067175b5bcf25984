use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CatalogResponse, SpeakerCatalog, SpeechClient};
use crate::core::config::RetryConfig;
use crate::core::error::{ClientError, Service};
use crate::core::state::Emotion;
use crate::services::net::{ResilientClient, RetryPolicy};

const REDACTED: &str = "***";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeechConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_infer_url")]
    pub infer_url: String,
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_brand")]
    pub brand: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_speaker")]
    pub speaker: String,
    /// Probe the service before the first synthesis attempt of each call.
    #[serde(default = "default_true")]
    pub probe: bool,
    #[serde(default)]
    pub params: SynthesisParams,
    #[serde(default = "default_speech_retry")]
    pub retry: RetryConfig,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            infer_url: default_infer_url(),
            catalog_url: default_catalog_url(),
            brand: default_brand(),
            name: default_name(),
            speaker: default_speaker(),
            probe: true,
            params: SynthesisParams::default(),
            retry: default_speech_retry(),
        }
    }
}

/// Inference knobs sent with every synthesis request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SynthesisParams {
    pub text_language: String,
    pub text_split_method: String,
    pub fragment_interval: f64,
    pub batch_size: u32,
    pub batch_threshold: f64,
    pub parallel_infer: bool,
    pub split_bucket: bool,
    pub top_k: u32,
    pub top_p: f64,
    pub temperature: f64,
    pub speed_factor: f64,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            text_language: "中文".to_string(),
            text_split_method: "按标点符号切".to_string(),
            fragment_interval: 0.3,
            batch_size: 1,
            batch_threshold: 0.75,
            parallel_infer: true,
            split_bucket: true,
            top_k: 10,
            top_p: 1.0,
            temperature: 1.0,
            speed_factor: 1.0,
        }
    }
}

fn default_infer_url() -> String {
    "https://infer.acgnai.top/infer/gen".to_string()
}
fn default_catalog_url() -> String {
    "https://infer.acgnai.top/infer/spks".to_string()
}
fn default_brand() -> String {
    "gpt-sovits".to_string()
}
fn default_name() -> String {
    "anime".to_string()
}
fn default_speaker() -> String {
    "派蒙【原神】".to_string()
}
fn default_true() -> bool {
    true
}
fn default_speech_retry() -> RetryConfig {
    RetryConfig::with_attempts(10)
}

#[derive(Serialize)]
struct InferRequest<'a> {
    access_token: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    brand: &'a str,
    name: &'a str,
    method: &'a str,
    params: InferParams<'a>,
}

#[derive(Serialize)]
struct InferParams<'a> {
    speaker: &'a str,
    emotion: &'a str,
    text: &'a str,
    #[serde(flatten)]
    tuning: &'a SynthesisParams,
}

#[derive(Deserialize)]
struct InferResponse {
    audio: Option<String>,
    error: Option<Value>,
    #[serde(default, alias = "msg")]
    message: Option<String>,
}

#[derive(Debug, PartialEq)]
enum AudioPayload {
    Inline(Vec<u8>),
    Remote(String),
}

fn decode_audio(value: Value) -> Result<AudioPayload, String> {
    let resp: InferResponse =
        serde_json::from_value(value).map_err(|e| format!("unexpected speech response: {}", e))?;
    if let Some(err) = resp.error.filter(|e| !e.is_null()) {
        let text = match err {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Err(format!("speech service returned error: {}", text));
    }
    let audio = resp
        .audio
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| match resp.message {
            Some(m) => format!("response has no audio field ({})", m),
            None => "response has no audio field".to_string(),
        })?;

    if audio.starts_with("http://") || audio.starts_with("https://") {
        return Ok(AudioPayload::Remote(audio));
    }

    let encoded = match audio.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| "malformed data URI in audio field".to_string())?,
        None => audio.as_str(),
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| format!("audio field is not valid base64: {}", e))?;
    if bytes.is_empty() {
        return Err("audio field decoded to nothing".to_string());
    }
    Ok(AudioPayload::Inline(bytes))
}

/// GPT-SoVITS voices hosted by acgnai.
pub struct AcgnaiClient {
    config: SpeechConfig,
    client: ResilientClient,
    catalog_client: ResilientClient,
}

impl AcgnaiClient {
    pub fn new(config: SpeechConfig) -> Result<Self> {
        let policy = RetryPolicy::from(&config.retry);
        let catalog_client = ResilientClient::new(Service::Speech, policy.clone())?;
        let policy = if config.probe {
            let origin = url::Url::parse(&config.infer_url)
                .and_then(|u| u.join("/"))
                .with_context(|| format!("Invalid speech infer_url: {}", config.infer_url))?;
            policy.with_preflight(origin.to_string())
        } else {
            policy
        };
        Ok(Self {
            client: ResilientClient::new(Service::Speech, policy)?,
            catalog_client,
            config,
        })
    }

    fn request<'a>(
        &'a self,
        access_token: &'a str,
        speaker: &'a str,
        emotion: Emotion,
        text: &'a str,
    ) -> InferRequest<'a> {
        InferRequest {
            access_token,
            kind: "tts",
            brand: &self.config.brand,
            name: &self.config.name,
            method: "api",
            params: InferParams {
                speaker,
                emotion: emotion.as_str(),
                text,
                tuning: &self.config.params,
            },
        }
    }

    fn catalog_url(&self) -> Result<url::Url, url::ParseError> {
        url::Url::parse_with_params(
            &self.config.catalog_url,
            &[
                ("type", "tts"),
                ("brand", self.config.brand.as_str()),
                ("name", self.config.name.as_str()),
            ],
        )
    }
}

#[async_trait]
impl SpeechClient for AcgnaiClient {
    async fn synthesize(
        &self,
        speaker: &str,
        emotion: Emotion,
        text: &str,
    ) -> Result<Vec<u8>, ClientError> {
        let body = self.request(&self.config.access_token, speaker, emotion, text);
        let echo = serde_json::to_string(&self.request(REDACTED, speaker, emotion, text))
            .unwrap_or_default();

        let payload = self
            .client
            .execute_json(
                &echo,
                |http| http.post(&self.config.infer_url).json(&body),
                decode_audio,
            )
            .await?;

        match payload {
            AudioPayload::Inline(bytes) => Ok(bytes),
            AudioPayload::Remote(url) => {
                debug!("Downloading synthesized audio from {}", url);
                self.client.fetch_bytes(&url).await
            }
        }
    }

    async fn catalog(&self) -> Result<SpeakerCatalog, ClientError> {
        let url = self.catalog_url().map_err(|e| ClientError::Fatal {
            service: Service::Speech,
            attempts: 0,
            reason: format!("invalid catalog url: {}", e),
            request: self.config.catalog_url.clone(),
        })?;
        let token = self.config.access_token.as_str();

        self.catalog_client
            .execute_json(
                url.as_str(),
                |http| {
                    let req = http.get(url.clone());
                    if token.is_empty() {
                        req
                    } else {
                        req.bearer_auth(token)
                    }
                },
                |value| {
                    serde_json::from_value::<CatalogResponse>(value)
                        .map(SpeakerCatalog::from_response)
                        .map_err(|e| format!("unexpected catalog response: {}", e))
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use serde_json::json;

    fn client(config: SpeechConfig) -> AcgnaiClient {
        AcgnaiClient::new(config).unwrap()
    }

    #[test]
    fn test_request_body_shape() {
        let c = client(SpeechConfig {
            access_token: "secret".to_string(),
            ..SpeechConfig::default()
        });
        let body = serde_json::to_value(c.request("secret", "派蒙【原神】", Emotion::Sad, "你好")).unwrap();
        assert_eq!(body["type"], "tts");
        assert_eq!(body["brand"], "gpt-sovits");
        assert_eq!(body["name"], "anime");
        assert_eq!(body["method"], "api");
        assert_eq!(body["access_token"], "secret");
        assert_eq!(body["params"]["speaker"], "派蒙【原神】");
        assert_eq!(body["params"]["emotion"], "sad");
        assert_eq!(body["params"]["text"], "你好");
        assert_eq!(body["params"]["text_split_method"], "按标点符号切");
        assert_eq!(body["params"]["top_k"], 10);
        assert_eq!(body["params"]["batch_threshold"], 0.75);
        assert_eq!(body["params"]["parallel_infer"], true);
    }

    #[test]
    fn test_decode_inline_and_data_uri() {
        assert_eq!(
            decode_audio(json!({"audio": "UklGRg=="})).unwrap(),
            AudioPayload::Inline(b"RIFF".to_vec())
        );
        assert_eq!(
            decode_audio(json!({"audio": "data:audio/wav;base64,UklGRg=="})).unwrap(),
            AudioPayload::Inline(b"RIFF".to_vec())
        );
        assert_eq!(
            decode_audio(json!({"audio": "https://cdn.example/a.wav"})).unwrap(),
            AudioPayload::Remote("https://cdn.example/a.wav".to_string())
        );
    }

    #[test]
    fn test_missing_audio_or_error_is_fatal() {
        assert!(decode_audio(json!({"message": "ok"})).unwrap_err().contains("no audio"));
        assert!(decode_audio(json!({"error": "quota exceeded"}))
            .unwrap_err()
            .contains("quota exceeded"));
        assert!(decode_audio(json!({"audio": "not base64!!"})).is_err());
        assert!(decode_audio(json!({"audio": ""})).is_err());
    }

    #[test]
    fn test_catalog_url_carries_query() {
        let c = client(SpeechConfig::default());
        let url = c.catalog_url().unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("type".to_string(), "tts".to_string())));
        assert!(pairs.contains(&("brand".to_string(), "gpt-sovits".to_string())));
        assert!(pairs.contains(&("name".to_string(), "anime".to_string())));
    }

    #[test]
    fn test_probe_targets_service_origin() {
        let c = client(SpeechConfig::default());
        assert_eq!(
            c.client.policy().preflight_url.as_deref(),
            Some("https://infer.acgnai.top/")
        );
        let c = client(SpeechConfig {
            probe: false,
            ..SpeechConfig::default()
        });
        assert!(c.client.policy().preflight_url.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_without_retrying() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let c = client(SpeechConfig {
            access_token: "secret".to_string(),
            infer_url: format!("http://127.0.0.1:{}/infer/gen", port),
            ..SpeechConfig::default()
        });
        let err = c.synthesize("x", Emotion::Happy, "hi").await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable { .. }));
        assert_eq!(err.kind(), ErrorKind::FatalResponse);
        assert_eq!(err.attempts(), 0);
    }
}
