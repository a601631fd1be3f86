use crate::settings::EffectiveSettings;
use regex::{Regex, RegexBuilder};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Count,
    RejectBanned { word: String },
    IgnoreShort { length: usize, min: usize },
    IgnoreEmptyMedia,
    Excepted { pattern: String },
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Count => "count",
            Classification::RejectBanned { .. } => "reject_banned",
            Classification::IgnoreShort { .. } => "ignore_short",
            Classification::IgnoreEmptyMedia => "ignore_empty_media",
            Classification::Excepted { .. } => "excepted",
        }
    }
}

/// Classifies one submission. The checks run in a fixed order and the first hit wins:
/// empty media, banned word, length, exclusion.
pub fn classify(
    text: &str,
    has_media_without_caption: bool,
    settings: &EffectiveSettings,
) -> Classification {
    if has_media_without_caption {
        return Classification::IgnoreEmptyMedia;
    }

    if let Some(word) = find_banned_word(text, &settings.banned_words) {
        return Classification::RejectBanned { word };
    }

    let length = text_length(text);
    if length < settings.min_length {
        return Classification::IgnoreShort {
            length,
            min: settings.min_length,
        };
    }

    if let Some(pattern) =
        matches_exclusion(text, &settings.exclusions, settings.exclusions_use_regex)
    {
        return Classification::Excepted { pattern };
    }

    Classification::Count
}

/// Character count with line breaks and tabs removed. Spaces count.
pub fn text_length(text: &str) -> usize {
    text.chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '\t'))
        .count()
}

/// Whole-word, case-insensitive search. Returns the configured word that matched.
pub fn find_banned_word(text: &str, banned_words: &[String]) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }
    let lowered = text.to_lowercase();

    for word in banned_words {
        let needle = word.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let pattern = format!(r"\b{}\b", regex::escape(&needle));
        match Regex::new(&pattern) {
            Ok(re) if re.is_match(&lowered) => return Some(word.trim().to_string()),
            Ok(_) => {}
            Err(e) => warn!("Skipping banned word '{}': {}", word, e),
        }
    }
    None
}

/// Returns the first exclusion entry found in `text`. A malformed regex entry is matched as a
/// plain substring instead.
pub fn matches_exclusion(text: &str, patterns: &[String], use_regex: bool) -> Option<String> {
    let lowered = text.to_lowercase();

    for raw in patterns {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }

        let hit = if use_regex {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => re.is_match(text),
                Err(e) => {
                    warn!(
                        "Invalid exclusion pattern '{}', falling back to substring match: {}",
                        pattern, e
                    );
                    lowered.contains(&pattern.to_lowercase())
                }
            }
        } else {
            lowered.contains(&pattern.to_lowercase())
        };

        if hit {
            return Some(pattern.to_string());
        }
    }
    None
}

/// Replaces every case-insensitive occurrence of a banned word with asterisks.
pub fn mask_banned_words(text: &str, banned_words: &[String]) -> String {
    let mut masked = text.to_string();
    for word in banned_words {
        let needle = word.trim();
        if needle.is_empty() {
            continue;
        }
        let re = match RegexBuilder::new(&regex::escape(needle))
            .case_insensitive(true)
            .build()
        {
            Ok(re) => re,
            Err(_) => continue,
        };
        let mask = "*".repeat(needle.chars().count());
        masked = re.replace_all(&masked, mask.as_str()).into_owned();
    }
    masked
}
