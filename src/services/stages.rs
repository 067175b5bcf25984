//! Prompt templates for each generation stage and the helpers that pull the
//! useful part out of what the model sends back.

use crate::core::state::{Emotion, GenerationParameters, StoryDraft};
use log::warn;

pub const MAX_PLOT_POINTS: usize = 5;
pub const MIN_PLOT_POINTS: usize = 3;

pub const SYSTEM_AUTHOR: &str = "你是一位專業的兒童繪本作家，用繁體中文寫作，語言溫暖、簡單、適合朗讀。";
pub const SYSTEM_ILLUSTRATOR: &str = "你是一位兒童繪本插畫的美術指導。";
pub const SYSTEM_CLASSIFIER: &str =
    "You label the emotion of a sentence. Reply with exactly one word: happy, sad, angry or neutral.";

pub fn plot_points_prompt(character: &str, theme: &str) -> String {
    format!(
        "請為一本以「{}」為主角、主題是「{}」的兒童繪本，提出 3 到 5 個可能的故事轉折重點。\n\
         每個轉折一行，簡短一句話，不要加入其他說明。",
        character, theme
    )
}

pub fn story_prompt(params: &GenerationParameters) -> String {
    format!(
        "請寫一個 {pages} 頁的兒童繪本故事。\n\
         主角：{character}\n\
         主題：{theme}\n\
         故事轉折：{plot}\n\
         要求：\n\
         1. 故事需包含快樂、悲傷、生氣和平靜四種情緒段落。\n\
         2. 轉折發生在第 {twist} 頁。\n\
         3. 結局溫馨，帶出與主題相關的寓意。",
        pages = params.page_count,
        character = params.character,
        theme = params.theme,
        plot = params.plot_point,
        twist = params.twist_page(),
    )
}

pub fn paging_prompt(story: &StoryDraft, params: &GenerationParameters) -> String {
    format!(
        "請將以下故事分成 {pages} 頁，主角是「{character}」，主題是「{theme}」，轉折是「{plot}」。\n\
         只輸出一個 JSON 陣列，每個元素格式為 {{\"text\": \"該頁的文字\", \"imagePrompt\": \"該頁插圖的英文描述\"}}。\n\
         不要輸出任何其他文字。\n\n\
         故事：\n{story}",
        pages = params.page_count,
        character = params.character,
        theme = params.theme,
        plot = params.plot_point,
        story = story.0,
    )
}

pub fn style_prompt(story: &StoryDraft) -> String {
    format!(
        "根據以下故事，用一段英文描述整本繪本統一的插畫風格（畫風、色調、光線、角色外觀），\n\
         只輸出風格描述本身。\n\n故事：\n{}",
        story.0
    )
}

pub fn emotion_prompt(text: &str) -> String {
    format!("Sentence: {}\nEmotion:", text)
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    for bullet in ["-", "*", "•", "・"] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return rest.trim_start();
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        for sep in [".", ")", "、", "．", ":", "："] {
            if let Some(after) = rest.strip_prefix(sep) {
                return after.trim_start();
            }
        }
    }
    line
}

/// One plot point per non-empty line, list markers removed, at most five.
pub fn parse_plot_points(text: &str) -> Vec<String> {
    let mut points: Vec<String> = text
        .lines()
        .map(strip_list_marker)
        .map(|l| l.trim_matches(|c: char| c == '"' || c == '「' || c == '」').trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if points.len() > MAX_PLOT_POINTS {
        points.truncate(MAX_PLOT_POINTS);
    } else if !points.is_empty() && points.len() < MIN_PLOT_POINTS {
        warn!("Model offered only {} plot point(s)", points.len());
    }
    points
}

/// Reads the classifier answer. Only a bare label counts, optionally after a
/// `label:` prefix; a sentence that merely mentions an emotion is neutral.
pub fn parse_emotion(text: &str) -> Emotion {
    let answer = text
        .rsplit([':', '：'])
        .next()
        .unwrap_or(text);
    Emotion::coerce(answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plot_points_strip_markers() {
        let text = "1. 小貓迷路了\n\n2) 遇到新朋友\n- 暴風雨來了\n* 「找到回家的路」\n";
        assert_eq!(
            parse_plot_points(text),
            vec!["小貓迷路了", "遇到新朋友", "暴風雨來了", "找到回家的路"]
        );
    }

    #[test]
    fn test_plot_points_truncated_to_five() {
        let text = (1..=8).map(|i| format!("{}、轉折{}", i, i)).collect::<Vec<_>>().join("\n");
        let points = parse_plot_points(&text);
        assert_eq!(points.len(), 5);
        assert_eq!(points[4], "轉折5");
    }

    #[test]
    fn test_plot_points_empty_output() {
        assert!(parse_plot_points("\n  \n- \n").is_empty());
    }

    #[test]
    fn test_emotion_parsing() {
        assert_eq!(parse_emotion("Happy"), Emotion::Happy);
        assert_eq!(parse_emotion("Emotion: sad."), Emotion::Sad);
        assert_eq!(parse_emotion("excited"), Emotion::Neutral);
        assert_eq!(parse_emotion(""), Emotion::Neutral);
        assert_eq!(parse_emotion("情緒：angry"), Emotion::Angry);
        assert_eq!(parse_emotion("not happy"), Emotion::Neutral);
        assert_eq!(parse_emotion("The page feels sad"), Emotion::Neutral);
    }

    #[test]
    fn test_story_prompt_anchors_twist() {
        let params = GenerationParameters::new("貓咪", "友情", "迷路了", 8).unwrap();
        let prompt = story_prompt(&params);
        assert!(prompt.contains("第 5 頁"));
        assert!(prompt.contains("迷路了"));
    }
}
