//! Incremental sentence segmentation for streaming TTS.
//!
//! Text deltas are buffered and cut at sentence terminators so synthesis can
//! start before the model has finished. Long runs without a terminator are cut
//! at pause punctuation once they pass the soft cap. The first sentence must
//! reach a minimum length so replies do not open with a tiny fragment.
//! Markdown markup and emoji are stripped since TTS would read them aloud.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static MARKUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)\*\*|__|`+|^\s*#{1,6}\s+|^\s*[-*+]\s+").unwrap());
static EMOJI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\p{Emoji_Presentation}").unwrap());

const TERMINATORS: [char; 7] = ['.', '。', '!', '！', '?', '？', '\n'];
const PAUSES: [char; 6] = [',', '，', ';', '；', ':', '：'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub min_first_len: usize,
    pub soft_cap: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_first_len: 5,
            soft_cap: 100,
        }
    }
}

#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    config: SegmenterConfig,
    buffer: String,
    emitted: usize,
}

impl SentenceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            emitted: 0,
        }
    }

    /// Append a delta and return every sentence it completed.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut sentences = Vec::new();
        while let Some(cut) = self.find_cut() {
            let raw: String = self.buffer.drain(..cut).collect();
            if let Some(sentence) = speakable(&raw) {
                sentences.push(sentence);
                self.emitted += 1;
            }
        }
        sentences
    }

    /// Residue left when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let sentence = speakable(&rest)?;
        self.emitted += 1;
        Some(sentence)
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn find_cut(&self) -> Option<usize> {
        let min_len = if self.emitted == 0 {
            self.config.min_first_len
        } else {
            1
        };

        let mut count = 0;
        let mut prev: Option<char> = None;
        for (i, c) in self.buffer.char_indices() {
            count += 1;
            let end = i + c.len_utf8();

            if TERMINATORS.contains(&c) && !is_number_dot(c, prev) {
                let candidate = self.buffer[..end].trim();
                if candidate.is_empty() || candidate.chars().count() >= min_len {
                    return Some(end);
                }
            } else if PAUSES.contains(&c) && count >= self.config.soft_cap {
                return Some(end);
            }
            prev = Some(c);
        }
        None
    }
}

/// `1.` in a numbered list or the point in `3.14`.
fn is_number_dot(c: char, prev: Option<char>) -> bool {
    c == '.' && prev.is_some_and(|p| p.is_ascii_digit())
}

fn speakable(raw: &str) -> Option<String> {
    let cleaned = MARKUP_RE.replace_all(raw, "");
    let cleaned = EMOJI_RE.replace_all(&cleaned, "");
    let trimmed = cleaned.trim();
    trimmed
        .chars()
        .any(char::is_alphanumeric)
        .then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(deltas: &[&str]) -> Vec<String> {
        let mut seg = SentenceSegmenter::default();
        let mut out: Vec<String> = deltas.iter().flat_map(|d| seg.push(d)).collect();
        out.extend(seg.finish());
        out
    }

    #[test]
    fn test_splits_on_terminators_across_deltas() {
        let out = run(&["今天天气", "很好。明天", "会下雨吗？我", "不知道"]);
        assert_eq!(out, vec!["今天天气很好。", "明天会下雨吗？", "我不知道"]);
    }

    #[test]
    fn test_short_first_sentence_is_merged() {
        let out = run(&["好的。", "我来帮你查一下。"]);
        assert_eq!(out, vec!["好的。我来帮你查一下。"]);
    }

    #[test]
    fn test_short_later_sentences_are_kept() {
        let out = run(&["这是第一句话。好。"]);
        assert_eq!(out, vec!["这是第一句话。", "好。"]);
    }

    #[test]
    fn test_numbers_do_not_split() {
        let out = run(&["Pi is 3.14 roughly. Steps: 1. open it\n"]);
        assert_eq!(out, vec!["Pi is 3.14 roughly.", "Steps: 1. open it"]);
    }

    #[test]
    fn test_soft_cap_cuts_at_pause() {
        let long = "很".repeat(100);
        let text = format!("{long}，后面还有");
        let out = run(&[&text]);
        assert_eq!(out.len(), 2);
        assert!(out[0].ends_with('，'));
        assert_eq!(out[1], "后面还有");
    }

    #[test]
    fn test_pause_below_cap_does_not_cut() {
        let out = run(&["你好，世界，再见。"]);
        assert_eq!(out, vec!["你好，世界，再见。"]);
    }

    #[test]
    fn test_markup_and_emoji_are_stripped() {
        let out = run(&["## 出门提醒\n", "**重点**：记得带伞😊。", "- 穿外套\n"]);
        assert_eq!(out, vec!["出门提醒", "重点：记得带伞。", "穿外套"]);
    }

    #[test]
    fn test_punctuation_only_is_dropped() {
        let mut seg = SentenceSegmenter::new(SegmenterConfig::default());
        assert!(seg.push("\n\n").is_empty());
        assert!(seg.push("。。").is_empty());
        assert_eq!(seg.finish(), None);
        assert_eq!(seg.emitted(), 0);
    }
}
