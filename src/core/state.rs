use crate::core::error::{PipelineError, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

pub const MIN_PAGES: u8 = 6;
pub const MAX_PAGES: u8 = 12;
pub const DEFAULT_PAGES: u8 = 8;

/// Placeholder shown at the top of the plot point list. Never a valid choice.
pub const PLOT_POINT_SENTINEL: &str = "請選擇";

/// Text used for a page the model returned without any narration.
pub const MISSING_TEXT_PLACEHOLDER: &str = "no text";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub character: String,
    pub theme: String,
    pub plot_point: String,
    pub page_count: u8,
}

impl GenerationParameters {
    pub fn new(
        character: impl Into<String>,
        theme: impl Into<String>,
        plot_point: impl Into<String>,
        page_count: u8,
    ) -> Result<Self, PipelineError> {
        let character = character.into().trim().to_string();
        let theme = theme.into().trim().to_string();
        let plot_point = plot_point.into().trim().to_string();

        if character.is_empty() {
            return Err(PipelineError::Validation("a main character is required".to_string()));
        }
        if theme.is_empty() {
            return Err(PipelineError::Validation("a theme is required".to_string()));
        }
        if plot_point.is_empty() || plot_point == PLOT_POINT_SENTINEL {
            return Err(PipelineError::Validation(
                "choose a plot point or enter a custom one".to_string(),
            ));
        }
        if !(MIN_PAGES..=MAX_PAGES).contains(&page_count) {
            return Err(PipelineError::Validation(format!(
                "page count must be between {} and {}, got {}",
                MIN_PAGES, MAX_PAGES, page_count
            )));
        }

        Ok(Self {
            character,
            theme,
            plot_point,
            page_count,
        })
    }

    /// Page at which the story's twist lands.
    pub fn twist_page(&self) -> u8 {
        self.page_count - 3
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotPointSet(pub Vec<String>);

impl PlotPointSet {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryDraft(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleBase(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub text: String,
    #[serde(rename = "imagePrompt")]
    pub image_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; 4] = [Emotion::Happy, Emotion::Sad, Emotion::Angry, Emotion::Neutral];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Neutral => "neutral",
        }
    }

    /// Maps a free-form classifier label onto the closed set; anything unknown is neutral.
    pub fn coerce(label: &str) -> Emotion {
        let cleaned = label
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        Emotion::ALL
            .into_iter()
            .find(|e| e.as_str() == cleaned)
            .unwrap_or(Emotion::Neutral)
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a run currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    PlotPointsReady,
    StoryReady,
    PagesParsed,
    StyleReady,
    PerPage(usize),
    Complete,
    Failed(Stage),
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed(_) | RunState::Cancelled)
    }
}

/// Per-run state owned by the presentation layer and handed to the workflow.
#[derive(Debug)]
pub struct GenerationSession {
    pub character: String,
    pub theme: String,
    pub page_count: u8,
    pub plot_points: Option<PlotPointSet>,
    pub selected_plot_point: Option<String>,
    pub speaker: String,
    pub state: RunState,
    cancel: CancellationToken,
}

impl GenerationSession {
    pub fn new(
        character: impl Into<String>,
        theme: impl Into<String>,
        page_count: u8,
        speaker: impl Into<String>,
    ) -> Self {
        Self {
            character: character.into(),
            theme: theme.into(),
            page_count,
            plot_points: None,
            selected_plot_point: None,
            speaker: speaker.into(),
            state: RunState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn select_plot_point(&mut self, plot_point: impl Into<String>) {
        self.selected_plot_point = Some(plot_point.into());
    }

    /// Freezes the user's choices into the immutable parameters of a run.
    pub fn parameters(&self) -> Result<GenerationParameters, PipelineError> {
        let plot_point = self.selected_plot_point.clone().unwrap_or_default();
        GenerationParameters::new(&self.character, &self.theme, plot_point, self.page_count)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AudioOutcome {
    Synthesized {
        #[serde(skip)]
        bytes: Vec<u8>,
        from_cache: bool,
    },
    Failed {
        error: String,
    },
}

impl AudioOutcome {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            AudioOutcome::Synthesized { bytes, .. } => Some(bytes),
            AudioOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Generated { reference: String },
    MissingPrompt,
    Failed { error: String },
}

impl ImageOutcome {
    pub fn reference(&self) -> Option<&str> {
        match self {
            ImageOutcome::Generated { reference } => Some(reference),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageResult {
    pub index: usize,
    pub text: String,
    pub image_prompt: String,
    pub emotion: Emotion,
    pub audio: AudioOutcome,
    pub image: ImageOutcome,
}

impl PageResult {
    pub fn is_fully_rendered(&self) -> bool {
        self.audio.bytes().is_some() && self.image.reference().is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BookResult {
    pub parameters: GenerationParameters,
    pub story: StoryDraft,
    pub style: StyleBase,
    pub speaker: String,
    pub requested_pages: u8,
    pub pages: Vec<PageResult>,
}

impl BookResult {
    pub fn page_count_mismatch(&self) -> bool {
        self.pages.len() != self.requested_pages as usize
    }

    pub fn audio_failures(&self) -> usize {
        self.pages.iter().filter(|p| p.audio.bytes().is_none()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_emotion_coercion() {
        assert_eq!(Emotion::coerce("happy"), Emotion::Happy);
        assert_eq!(Emotion::coerce("  Sad.\n"), Emotion::Sad);
        assert_eq!(Emotion::coerce("\"ANGRY\""), Emotion::Angry);
        assert_eq!(Emotion::coerce("excited"), Emotion::Neutral);
        assert_eq!(Emotion::coerce(""), Emotion::Neutral);
    }

    #[test]
    fn test_parameters_reject_sentinel_and_range() {
        let err = GenerationParameters::new("貓咪", "友情", PLOT_POINT_SENTINEL, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = GenerationParameters::new("貓咪", "友情", "迷路了", 13).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = GenerationParameters::new("  ", "友情", "迷路了", 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let params = GenerationParameters::new("貓咪", "友情", " 迷路了 ", 6).unwrap();
        assert_eq!(params.plot_point, "迷路了");
        assert_eq!(params.twist_page(), 3);
    }

    #[test]
    fn test_session_without_selection_is_invalid() {
        let session = GenerationSession::new("狗狗", "冒險", 8, "派蒙");
        assert!(session.parameters().is_err());
    }

    #[test]
    fn test_page_record_uses_camel_case_key() {
        let page = PageRecord {
            text: "t".to_string(),
            image_prompt: "p".to_string(),
        };
        let json = serde_json::to_string(&page).unwrap();
        assert_eq!(json, r#"{"text":"t","imagePrompt":"p"}"#);
    }
}
