use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Arc, Mutex};
use storybook::core::config::Config;
use storybook::core::error::{ErrorKind, Stage};
use storybook::core::io::{NativeStorage, Storage};
use storybook::core::state::{PageResult, StoryDraft};
use storybook::services::cache::AudioCache;
use storybook::services::export::BookExporter;
use storybook::services::image::OpenAIImageClient;
use storybook::services::llm::create_llm;
use storybook::services::pacing::PacingLimiter;
use storybook::services::setup;
use storybook::services::speech::acgnai::AcgnaiClient;
use storybook::services::workflow::{ProgressSink, WorkflowManager};

/// Terminal rendering of a run: stage lines, then a bar over the pages.
struct ConsoleProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn println(&self, line: &str) {
        match self.bar.lock().ok().and_then(|b| b.clone()) {
            Some(bar) => bar.println(line),
            None => println!("{}", line),
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.lock().ok().and_then(|mut b| b.take()) {
            bar.finish_and_clear();
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn stage_started(&self, stage: Stage) {
        let label = match stage {
            Stage::PlotPoints => "正在生成故事轉折重點...",
            Stage::Story => "正在生成故事...",
            Stage::Paging => "正在分頁故事...",
            Stage::Style => "正在生成風格基礎...",
            Stage::Page(_) => return,
        };
        self.println(label);
    }

    fn story_ready(&self, story: &StoryDraft) {
        self.println(&format!("故事大綱：\n{}\n", story.0));
    }

    fn pages_parsed(&self, parsed: usize, requested: u8) {
        self.println(&format!("成功解析 JSON。共有 {} 頁（要求 {} 頁）。", parsed, requested));
        let pb = ProgressBar::new(parsed as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        if let Ok(mut bar) = self.bar.lock() {
            *bar = Some(pb);
        }
    }

    fn page_finished(&self, result: &PageResult) {
        let audio = if result.audio.bytes().is_some() { "ok" } else { "失敗" };
        let image = result.image.reference().unwrap_or("-");
        self.println(&format!(
            "第 {} 頁 [{}] 語音: {} 圖片: {}\n  {}",
            result.index, result.emotion, audio, image, result.text
        ));
        if let Some(bar) = self.bar.lock().ok().and_then(|b| b.clone()) {
            bar.inc(1);
        }
    }

    fn warning(&self, message: &str) {
        self.println(&format!("警告: {}", message));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        return Err(e.into());
    }
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let progress = Arc::new(ConsoleProgress::new());
    let workflow = WorkflowManager::new(
        create_llm(&config)?,
        Box::new(OpenAIImageClient::new(&config)?),
        Box::new(AcgnaiClient::new(config.speech.clone())?),
        AudioCache::new(storage.clone(), config.cache_folder.clone()),
        Arc::new(PacingLimiter::from_config(&config.pipeline)),
    )
    .with_progress(progress.clone());

    println!("Fetching speaker catalog...");
    let catalog = workflow.speaker_catalog().await;
    if catalog.is_none() {
        eprintln!("Speaker catalog unavailable, using {}", config.speech.speaker);
    }

    let mut session = setup::start_session(&config, catalog)?;

    let token = session.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling after the current step...");
            token.cancel();
        }
    });

    loop {
        match workflow.generate_plot_points(&mut session).await {
            Ok(points) => {
                for (i, p) in points.as_slice().iter().enumerate() {
                    println!("  {}. {}", i + 1, p);
                }
                break;
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e.into()),
            Err(e) => {
                eprintln!("未能生成有效的轉折重點：{}", e);
                if config.unattended || !setup::confirm("重試？", true, false) {
                    return Err(e.into());
                }
            }
        }
    }

    setup::choose_plot_point(&config, &mut session)?;

    let book = match workflow.run_book(&mut session).await {
        Ok(book) => book,
        Err(e) => {
            progress.finish();
            eprintln!("發生錯誤（{:?}）：{}", session.state, e);
            return Err(e.into());
        }
    };
    progress.finish();

    if book.page_count_mismatch() {
        println!(
            "注意：要求 {} 頁，實際生成 {} 頁。",
            book.requested_pages,
            book.pages.len()
        );
    }
    let complete = book.pages.iter().filter(|p| p.is_fully_rendered()).count();
    println!("{} / {} 頁已完整生成。", complete, book.pages.len());
    if book.audio_failures() > 0 {
        println!("{} 頁語音生成失敗。", book.audio_failures());
    }

    let exporter = BookExporter::new(storage, config.output_folder.clone());
    let dir = exporter.export(&book).await?;
    println!("繪本已儲存至 {}", dir);

    Ok(())
}
