use crate::core::io::Storage;
use crate::core::state::{AudioOutcome, BookResult, Emotion, GenerationParameters, ImageOutcome};
use crate::utils::audio::sniff_format;
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub const MANIFEST_FILE: &str = "book.json";

#[derive(Serialize)]
struct Manifest<'a> {
    parameters: &'a GenerationParameters,
    speaker: &'a str,
    story: &'a str,
    style: &'a str,
    requested_pages: u8,
    page_count_mismatch: bool,
    pages: Vec<ManifestPage<'a>>,
}

#[derive(Serialize)]
struct ManifestPage<'a> {
    index: usize,
    text: &'a str,
    image_prompt: &'a str,
    emotion: Emotion,
    audio_file: Option<String>,
    audio: &'a AudioOutcome,
    image: &'a ImageOutcome,
}

/// Replaces characters that are awkward in directory names.
pub fn slugify(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug: String = joined
        .chars()
        .map(|c| {
            if c.is_whitespace() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '.') {
                '_'
            } else {
                c
            }
        })
        .collect();
    if slug.is_empty() {
        "book".to_string()
    } else {
        slug
    }
}

/// Writes page audio and a `book.json` manifest under the output folder.
pub struct BookExporter {
    storage: Arc<dyn Storage>,
    output_folder: String,
}

impl BookExporter {
    pub fn new(storage: Arc<dyn Storage>, output_folder: impl Into<String>) -> Self {
        Self {
            storage,
            output_folder: output_folder.into(),
        }
    }

    async fn free_dir(&self, slug: &str) -> Result<String> {
        let base = Path::new(&self.output_folder);
        let mut n = 1;
        loop {
            let name = if n == 1 {
                slug.to_string()
            } else {
                format!("{}-{}", slug, n)
            };
            let dir = base.join(name).to_string_lossy().to_string();
            if !self.storage.exists(&dir).await? {
                return Ok(dir);
            }
            n += 1;
        }
    }

    /// Returns the directory the book was written to.
    pub async fn export(&self, book: &BookResult) -> Result<String> {
        let params = &book.parameters;
        let slug = slugify(&[&params.character, &params.theme, &params.plot_point]);
        let dir = self.free_dir(&slug).await?;

        let mut pages = Vec::with_capacity(book.pages.len());
        for page in &book.pages {
            let audio_file = match page.audio.bytes() {
                Some(bytes) => {
                    let name = format!(
                        "page_{:02}.{}",
                        page.index,
                        sniff_format(bytes).extension()
                    );
                    let path = Path::new(&dir).join(&name);
                    self.storage
                        .write(&path.to_string_lossy(), bytes)
                        .await
                        .with_context(|| format!("Failed to write audio for page {}", page.index))?;
                    Some(name)
                }
                None => None,
            };
            pages.push(ManifestPage {
                index: page.index,
                text: &page.text,
                image_prompt: &page.image_prompt,
                emotion: page.emotion,
                audio_file,
                audio: &page.audio,
                image: &page.image,
            });
        }

        let manifest = Manifest {
            parameters: params,
            speaker: &book.speaker,
            story: &book.story.0,
            style: &book.style.0,
            requested_pages: book.requested_pages,
            page_count_mismatch: book.page_count_mismatch(),
            pages,
        };
        let content = serde_json::to_string_pretty(&manifest)?;
        let manifest_path = Path::new(&dir).join(MANIFEST_FILE);
        self.storage
            .write(&manifest_path.to_string_lossy(), content.as_bytes())
            .await
            .context("Failed to write book manifest")?;

        info!("Book exported to {}", dir);
        Ok(dir)
    }
}
