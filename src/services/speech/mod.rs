pub mod acgnai;

use crate::core::error::ClientError;
use crate::core::state::Emotion;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Speech synthesizer addressed by (speaker, emotion).
#[async_trait]
pub trait SpeechClient: Send + Sync {
    async fn synthesize(
        &self,
        speaker: &str,
        emotion: Emotion,
        text: &str,
    ) -> Result<Vec<u8>, ClientError>;

    /// Speakers the service offers, each with the emotions it was trained on.
    async fn catalog(&self) -> Result<SpeakerCatalog, ClientError>;
}

/// Emotions per speaker. The service lists them either flat or grouped by
/// language; both shapes are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EmotionListing {
    Flat(Vec<String>),
    ByLanguage(BTreeMap<String, Vec<String>>),
}

impl EmotionListing {
    fn into_labels(self) -> Vec<String> {
        match self {
            EmotionListing::Flat(v) => v,
            EmotionListing::ByLanguage(m) => m.into_values().flatten().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogResponse {
    #[serde(default, alias = "msg")]
    pub message: Option<String>,
    #[serde(default, alias = "models")]
    spklist: BTreeMap<String, EmotionListing>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeakerCatalog {
    speakers: BTreeMap<String, Vec<String>>,
}

impl SpeakerCatalog {
    pub fn new(speakers: BTreeMap<String, Vec<String>>) -> Self {
        Self { speakers }
    }

    pub(crate) fn from_response(resp: CatalogResponse) -> Self {
        let speakers = resp
            .spklist
            .into_iter()
            .map(|(name, listing)| {
                let mut labels = listing.into_labels();
                labels.sort();
                labels.dedup();
                (name, labels)
            })
            .collect();
        Self { speakers }
    }

    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    pub fn speakers(&self) -> impl Iterator<Item = &str> {
        self.speakers.keys().map(String::as_str)
    }

    pub fn contains(&self, speaker: &str) -> bool {
        self.speakers.contains_key(speaker)
    }

    pub fn emotions_of(&self, speaker: &str) -> Option<&[String]> {
        self.speakers.get(speaker).map(Vec::as_slice)
    }

    /// Restricts `wanted` to what `speaker` supports; anything else is neutral.
    pub fn resolve_emotion(&self, speaker: &str, wanted: Emotion) -> Emotion {
        if wanted == Emotion::Neutral {
            return wanted;
        }
        let supported = self
            .emotions_of(speaker)
            .map(|labels| labels.iter().any(|l| l.eq_ignore_ascii_case(wanted.as_str())))
            .unwrap_or(false);
        if supported {
            wanted
        } else {
            Emotion::Neutral
        }
    }
}
