use crate::core::config::Config;
use crate::core::state::{
    GenerationSession, PlotPointSet, MAX_PAGES, MIN_PAGES, PLOT_POINT_SENTINEL,
};
use crate::services::speech::SpeakerCatalog;
use anyhow::{anyhow, Result};
use inquire::{Confirm, Select, Text};

/// Entry that switches a selection list to free text.
pub const OTHER_OPTION: &str = "其他";

pub fn with_other(options: &[String]) -> Vec<String> {
    let mut out = options.to_vec();
    out.push(OTHER_OPTION.to_string());
    out
}

pub fn plot_point_options(points: &PlotPointSet) -> Vec<String> {
    let mut out = vec![PLOT_POINT_SENTINEL.to_string()];
    out.extend(with_other(points.as_slice()));
    out
}

/// Configured speaker first, then the rest of the catalog.
pub fn speaker_options(catalog: &SpeakerCatalog, preferred: &str) -> Vec<String> {
    let mut out = Vec::new();
    if catalog.contains(preferred) {
        out.push(preferred.to_string());
    }
    out.extend(
        catalog
            .speakers()
            .filter(|s| *s != preferred)
            .map(str::to_string),
    );
    out
}

/// Turns a list choice into a value, asking for free text on "other".
fn resolve_choice<F>(choice: String, custom: F) -> Result<String>
where
    F: FnOnce() -> Result<String>,
{
    let value = if choice == OTHER_OPTION { custom()? } else { choice };
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(anyhow!("An empty value is not a valid choice"));
    }
    Ok(value)
}

fn select_or_custom(prompt: &str, custom_prompt: &str, options: &[String]) -> Result<String> {
    let choice = Select::new(prompt, with_other(options)).prompt()?;
    resolve_choice(choice, || Ok(Text::new(custom_prompt).prompt()?))
}

/// Session built from config alone, for unattended runs.
pub fn unattended_session(config: &Config) -> Result<GenerationSession> {
    let pipeline = &config.pipeline;
    let character = pipeline
        .character
        .clone()
        .or_else(|| pipeline.characters.first().cloned())
        .ok_or_else(|| anyhow!("No character configured for unattended mode"))?;
    let theme = pipeline
        .theme
        .clone()
        .or_else(|| pipeline.themes.first().cloned())
        .ok_or_else(|| anyhow!("No theme configured for unattended mode"))?;
    Ok(GenerationSession::new(
        character,
        theme,
        pipeline.page_count,
        config.speech.speaker.clone(),
    ))
}

/// Collects character, theme, page count and speaker.
pub fn start_session(config: &Config, catalog: Option<&SpeakerCatalog>) -> Result<GenerationSession> {
    if config.unattended {
        return unattended_session(config);
    }

    let character = select_or_custom(
        "選擇或輸入繪本主角:",
        "請輸入自定義主角:",
        &config.pipeline.characters,
    )?;
    let theme = select_or_custom(
        "選擇或輸入繪本主題:",
        "請輸入自定義主題:",
        &config.pipeline.themes,
    )?;

    let pages: Vec<u8> = (MIN_PAGES..=MAX_PAGES).collect();
    let default_page = config.pipeline.page_count.clamp(MIN_PAGES, MAX_PAGES);
    let page_count = Select::new("選擇繪本頁數:", pages)
        .with_starting_cursor((default_page - MIN_PAGES) as usize)
        .prompt()?;

    let speaker = match catalog.filter(|c| !c.is_empty()) {
        Some(catalog) => {
            let options = speaker_options(catalog, &config.speech.speaker);
            Select::new("選擇朗讀角色:", options).prompt()?
        }
        None => config.speech.speaker.clone(),
    };

    Ok(GenerationSession::new(character, theme, page_count, speaker))
}

/// Stores the chosen plot point on the session. The sentinel is refused.
pub fn choose_plot_point(config: &Config, session: &mut GenerationSession) -> Result<()> {
    let points = session
        .plot_points
        .clone()
        .ok_or_else(|| anyhow!("No plot points have been generated yet"))?;

    if config.unattended {
        let first = points
            .as_slice()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("No plot points to choose from"))?;
        println!("Plot point: {}", first);
        session.select_plot_point(first);
        return Ok(());
    }

    loop {
        let choice = Select::new("選擇或輸入繪本故事轉折重點:", plot_point_options(&points))
            .with_starting_cursor(1)
            .prompt()?;
        if choice == PLOT_POINT_SENTINEL {
            println!("請選擇一個轉折重點或輸入自定義轉折重點。");
            continue;
        }
        let value = resolve_choice(choice, || Ok(Text::new("請輸入自定義故事轉折重點:").prompt()?))?;
        session.select_plot_point(value);
        return Ok(());
    }
}

pub fn confirm(prompt: &str, default: bool, unattended: bool) -> bool {
    if unattended {
        return default;
    }
    Confirm::new(prompt)
        .with_default(default)
        .prompt()
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_plot_point_options_wrap_sentinel_and_other() {
        let points = PlotPointSet(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            plot_point_options(&points),
            vec![PLOT_POINT_SENTINEL, "a", "b", OTHER_OPTION]
        );
    }

    #[test]
    fn test_resolve_choice() {
        assert_eq!(
            resolve_choice("貓咪".to_string(), || panic!("not asked")).unwrap(),
            "貓咪"
        );
        assert_eq!(
            resolve_choice(OTHER_OPTION.to_string(), || Ok(" 恐龍 ".to_string())).unwrap(),
            "恐龍"
        );
        assert!(resolve_choice(OTHER_OPTION.to_string(), || Ok("  ".to_string())).is_err());
    }

    #[test]
    fn test_speaker_options_put_preferred_first() {
        let mut speakers = BTreeMap::new();
        speakers.insert("a".to_string(), vec![]);
        speakers.insert("z".to_string(), vec![]);
        let catalog = SpeakerCatalog::new(speakers);
        assert_eq!(speaker_options(&catalog, "z"), vec!["z", "a"]);
        assert_eq!(speaker_options(&catalog, "missing"), vec!["a", "z"]);
    }

    #[test]
    fn test_unattended_session_uses_config() {
        let mut config: Config = serde_yaml_ng::from_str(
            "llm:\n  provider: openai\nunattended: true\npipeline:\n  theme: 冒險\n  page_count: 10\n",
        )
        .unwrap();
        let session = unattended_session(&config).unwrap();
        assert_eq!(session.character, "貓咪");
        assert_eq!(session.theme, "冒險");
        assert_eq!(session.page_count, 10);
        assert_eq!(session.speaker, config.speech.speaker);

        config.pipeline.characters.clear();
        assert!(unattended_session(&config).is_err());
    }

    #[test]
    fn test_unattended_plot_point_takes_first() {
        let config: Config =
            serde_yaml_ng::from_str("llm:\n  provider: openai\nunattended: true\n").unwrap();
        let mut session = unattended_session(&config).unwrap();
        assert!(choose_plot_point(&config, &mut session).is_err());

        session.plot_points = Some(PlotPointSet(vec!["迷路了".to_string(), "下雨".to_string()]));
        choose_plot_point(&config, &mut session).unwrap();
        assert_eq!(session.selected_plot_point.as_deref(), Some("迷路了"));
        assert!(session.parameters().is_ok());
    }
}
