//! Caption rendering for reposted media.
use crate::error::ConfigurationError;
use crate::instagram::model::MediaItem;
use crate::model::{CaptionMode, HashtagPolicy, PairingOptions};
use once_cell::sync::Lazy;
use regex::Regex;

/// Platform limit on caption length, in characters.
pub const MAX_CAPTION_CHARS: usize = 2200;

const PLACEHOLDERS: &[&str] = &["caption", "source", "hashtags"];

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_]+)\}").expect("valid placeholder regex"));
static HASHTAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#[\p{L}\p{N}_]+").expect("valid hashtag regex"));
static SPACES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("valid whitespace regex"));

/// Reject templates that are blank or use placeholders we cannot fill.
pub fn validate_template(template: &str) -> Result<(), ConfigurationError> {
    if template.trim().is_empty() {
        return Err(ConfigurationError::EmptyTemplate);
    }
    for cap in PLACEHOLDER_RE.captures_iter(template) {
        let name = &cap[1];
        if !PLACEHOLDERS.contains(&name) {
            return Err(ConfigurationError::UnknownPlaceholder(name.to_string()));
        }
    }
    Ok(())
}

/// Hashtags found in `text`, in order of appearance.
pub fn hashtags(text: &str) -> Vec<&str> {
    HASHTAG_RE.find_iter(text).map(|m| m.as_str()).collect()
}

/// Remove hashtags and tidy the whitespace left behind.
pub fn strip_hashtags(text: &str) -> String {
    let stripped = HASHTAG_RE.replace_all(text, "");
    let lines: Vec<String> = stripped
        .lines()
        .map(|line| SPACES_RE.replace_all(line.trim_end(), " ").into_owned())
        .collect();
    lines.join("\n").trim().to_string()
}

/// Build the caption for `item` according to the pairing options.
pub fn render(options: &PairingOptions, item: &MediaItem, source_account: &str) -> String {
    let original = item.caption.as_deref().unwrap_or("");
    let tags = hashtags(original).join(" ");
    let body = match options.hashtags {
        HashtagPolicy::Keep => original.trim().to_string(),
        HashtagPolicy::Strip => strip_hashtags(original),
    };

    let rendered = match &options.caption {
        CaptionMode::Original => body,
        CaptionMode::Template(template) => PLACEHOLDER_RE
            .replace_all(template, |cap: &regex::Captures<'_>| match &cap[1] {
                "caption" => body.clone(),
                "source" => source_account.to_string(),
                "hashtags" => tags.clone(),
                other => format!("{{{}}}", other),
            })
            .trim()
            .to_string(),
    };
    truncate_chars(&rendered, MAX_CAPTION_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
