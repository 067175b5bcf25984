use crate::core::error::{PipelineError, Service, Stage};
use crate::core::state::{
    AudioOutcome, BookResult, Emotion, GenerationParameters, GenerationSession, ImageOutcome,
    PageRecord, PageResult, PlotPointSet, RunState, StoryDraft, StyleBase,
};
use crate::services::cache::AudioCache;
use crate::services::image::ImageClient;
use crate::services::llm::LlmClient;
use crate::services::pacing::RateLimiter;
use crate::services::repair::extract_pages;
use crate::services::speech::{SpeakerCatalog, SpeechClient};
use crate::services::stages;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Receives progress of a run. Every method has a no-op default.
pub trait ProgressSink: Send + Sync {
    fn stage_started(&self, _stage: Stage) {}
    fn story_ready(&self, _story: &StoryDraft) {}
    fn pages_parsed(&self, _parsed: usize, _requested: u8) {}
    fn page_started(&self, _index: usize, _total: usize) {}
    fn page_finished(&self, _result: &PageResult) {}
    fn warning(&self, _message: &str) {}
}

/// Sends progress to the log only.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn stage_started(&self, stage: Stage) {
        info!("Entering {} stage", stage);
    }

    fn page_finished(&self, result: &PageResult) {
        info!(
            "Page {} done (emotion {}, audio {}, image {})",
            result.index,
            result.emotion,
            result.audio.bytes().is_some(),
            result.image.reference().is_some()
        );
    }

    fn warning(&self, message: &str) {
        warn!("{}", message);
    }
}

pub struct WorkflowManager {
    llm: Box<dyn LlmClient>,
    image: Box<dyn ImageClient>,
    speech: Box<dyn SpeechClient>,
    cache: AudioCache,
    pacing: Arc<dyn RateLimiter>,
    progress: Arc<dyn ProgressSink>,
    catalog: OnceCell<Option<SpeakerCatalog>>,
}

impl WorkflowManager {
    pub fn new(
        llm: Box<dyn LlmClient>,
        image: Box<dyn ImageClient>,
        speech: Box<dyn SpeechClient>,
        cache: AudioCache,
        pacing: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            llm,
            image,
            speech,
            cache,
            pacing,
            progress: Arc::new(LogProgress),
            catalog: OnceCell::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Fetched on first use and kept for the life of the manager, so the
    /// front end and the page loop share one request.
    pub async fn speaker_catalog(&self) -> Option<&SpeakerCatalog> {
        self.catalog
            .get_or_init(|| self.fetch_catalog())
            .await
            .as_ref()
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.progress.warning(&message);
    }

    async fn text_stage(
        &self,
        session: &GenerationSession,
        stage: Stage,
        system: &str,
        prompt: &str,
    ) -> Result<String, PipelineError> {
        if session.is_cancelled() {
            return Err(PipelineError::Cancelled { stage });
        }
        self.progress.stage_started(stage);
        self.pacing.before_call(Service::Text).await;
        let text = self
            .llm
            .chat(system, prompt)
            .await
            .map_err(|source| PipelineError::Stage { stage, source })?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::EmptyStageOutput { stage });
        }
        Ok(text.to_string())
    }

    /// Offers plot points for the session's character and theme.
    /// A failure leaves the session where it was so the user can retry.
    pub async fn generate_plot_points(
        &self,
        session: &mut GenerationSession,
    ) -> Result<PlotPointSet, PipelineError> {
        if session.character.trim().is_empty() || session.theme.trim().is_empty() {
            return Err(PipelineError::Validation(
                "a main character and a theme are required".to_string(),
            ));
        }

        let prompt = stages::plot_points_prompt(session.character.trim(), session.theme.trim());
        let raw = match self
            .text_stage(session, Stage::PlotPoints, stages::SYSTEM_AUTHOR, &prompt)
            .await
        {
            Err(PipelineError::Cancelled { stage }) => {
                session.state = RunState::Cancelled;
                return Err(PipelineError::Cancelled { stage });
            }
            other => other?,
        };

        let points = stages::parse_plot_points(&raw);
        if points.is_empty() {
            return Err(PipelineError::EmptyStageOutput {
                stage: Stage::PlotPoints,
            });
        }

        let set = PlotPointSet(points);
        session.plot_points = Some(set.clone());
        session.state = RunState::PlotPointsReady;
        Ok(set)
    }

    /// Runs every stage after plot point selection and renders each page.
    pub async fn run_book(
        &self,
        session: &mut GenerationSession,
    ) -> Result<BookResult, PipelineError> {
        if session.state.is_terminal() {
            return Err(PipelineError::Validation(
                "this session has already finished; start a new one".to_string(),
            ));
        }
        let params = session.parameters()?;

        match self.run_stages(session, params).await {
            Ok(book) => {
                session.state = RunState::Complete;
                Ok(book)
            }
            Err(e) => {
                session.state = match &e {
                    PipelineError::Cancelled { .. } => RunState::Cancelled,
                    other => match other.stage() {
                        Some(stage) => RunState::Failed(stage),
                        None => session.state.clone(),
                    },
                };
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        session: &mut GenerationSession,
        params: GenerationParameters,
    ) -> Result<BookResult, PipelineError> {
        info!(
            "Generating book: {} / {} / {} ({} pages)",
            params.character, params.theme, params.plot_point, params.page_count
        );

        let story = StoryDraft(
            self.text_stage(
                session,
                Stage::Story,
                stages::SYSTEM_AUTHOR,
                &stages::story_prompt(&params),
            )
            .await?,
        );
        session.state = RunState::StoryReady;
        self.progress.story_ready(&story);

        let raw_pages = self
            .text_stage(
                session,
                Stage::Paging,
                stages::SYSTEM_AUTHOR,
                &stages::paging_prompt(&story, &params),
            )
            .await?;
        let pages = extract_pages(&raw_pages)?;
        if pages.is_empty() {
            return Err(PipelineError::JsonStructure {
                raw: raw_pages,
                repaired: "[]".to_string(),
                message: "the paged story contains no pages".to_string(),
            });
        }
        session.state = RunState::PagesParsed;
        self.progress.pages_parsed(pages.len(), params.page_count);
        if pages.len() != params.page_count as usize {
            self.warn(format!(
                "Requested {} pages but the model returned {}",
                params.page_count,
                pages.len()
            ));
        }

        let style = StyleBase(
            self.text_stage(
                session,
                Stage::Style,
                stages::SYSTEM_ILLUSTRATOR,
                &stages::style_prompt(&story),
            )
            .await?,
        );
        session.state = RunState::StyleReady;

        let catalog = self.speaker_catalog().await;
        let total = pages.len();
        let mut results = Vec::with_capacity(total);

        for (i, page) in pages.iter().enumerate() {
            let index = i + 1;
            if session.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    stage: Stage::Page(index),
                });
            }
            session.state = RunState::PerPage(index);
            self.progress.page_started(index, total);

            let result = self
                .render_page(index, page, &session.speaker, &style, catalog)
                .await;
            self.progress.page_finished(&result);
            results.push(result);

            if index < total && !self.pacing.after_page(index, session.cancel_token()).await {
                return Err(PipelineError::Cancelled {
                    stage: Stage::Page(index + 1),
                });
            }
        }

        Ok(BookResult {
            parameters: params.clone(),
            story,
            style,
            speaker: session.speaker.clone(),
            requested_pages: params.page_count,
            pages: results,
        })
    }

    async fn fetch_catalog(&self) -> Option<SpeakerCatalog> {
        self.pacing.before_call(Service::Speech).await;
        match self.speech.catalog().await {
            Ok(catalog) if !catalog.is_empty() => Some(catalog),
            Ok(_) => {
                self.warn("Speaker catalog is empty; emotions will not be restricted".to_string());
                None
            }
            Err(e) => {
                self.warn(format!(
                    "Could not fetch the speaker catalog, emotions will not be restricted: {}",
                    e
                ));
                None
            }
        }
    }

    async fn classify_emotion(
        &self,
        index: usize,
        text: &str,
        speaker: &str,
        catalog: Option<&SpeakerCatalog>,
    ) -> Emotion {
        self.pacing.before_call(Service::Text).await;
        let emotion = match self
            .llm
            .chat(stages::SYSTEM_CLASSIFIER, &stages::emotion_prompt(text))
            .await
        {
            Ok(label) => stages::parse_emotion(&label),
            Err(e) => {
                self.warn(format!(
                    "Page {}: emotion classification failed, using neutral: {}",
                    index, e
                ));
                Emotion::Neutral
            }
        };
        match catalog {
            Some(catalog) => catalog.resolve_emotion(speaker, emotion),
            None => emotion,
        }
    }

    async fn synthesize(&self, index: usize, text: &str, speaker: &str, emotion: Emotion) -> AudioOutcome {
        if let Some(bytes) = self.cache.lookup(text, emotion).await {
            return AudioOutcome::Synthesized {
                bytes,
                from_cache: true,
            };
        }

        self.pacing.before_call(Service::Speech).await;
        match self.speech.synthesize(speaker, emotion, text).await {
            Ok(bytes) => {
                self.cache.store(text, emotion, &bytes).await;
                AudioOutcome::Synthesized {
                    bytes,
                    from_cache: false,
                }
            }
            Err(e) => {
                self.warn(format!("Page {}: speech synthesis failed: {}", index, e));
                AudioOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn illustrate(&self, index: usize, prompt: &str, style: &StyleBase) -> ImageOutcome {
        if prompt.trim().is_empty() {
            self.warn(format!("Page {} has no image prompt", index));
            return ImageOutcome::MissingPrompt;
        }

        self.pacing.before_call(Service::Image).await;
        match self.image.generate(prompt, &style.0).await {
            Ok(reference) => ImageOutcome::Generated { reference },
            Err(e) => {
                self.warn(format!("Page {}: image generation failed: {}", index, e));
                ImageOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Emotion, then speech, then image. Failures stay on this page.
    async fn render_page(
        &self,
        index: usize,
        page: &PageRecord,
        speaker: &str,
        style: &StyleBase,
        catalog: Option<&SpeakerCatalog>,
    ) -> PageResult {
        let emotion = self.classify_emotion(index, &page.text, speaker, catalog).await;
        let audio = self.synthesize(index, &page.text, speaker, emotion).await;
        let image = self.illustrate(index, &page.image_prompt, style).await;

        PageResult {
            index,
            text: page.text.clone(),
            image_prompt: page.image_prompt.clone(),
            emotion,
            audio,
            image,
        }
    }
}
