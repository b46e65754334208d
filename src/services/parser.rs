//! Tolerant parsing of vision model output.
//!
//! Models do not reliably follow the output directive, so parsing falls back
//! in stages: strict JSON, then the first JSON object embedded in the text,
//! then the raw text itself as the caption.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::models::result::QualityScores;

/// Leading labels models like to put in front of a plain-text caption.
const CAPTION_LABELS: &[&str] = &["caption:", "description:", "output:", "answer:"];

/// Structured caption extracted from a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCaption {
    pub caption: String,
    pub quality: Option<QualityScores>,
    pub flags: BTreeSet<String>,
    /// Caption text was salvaged but no quality assessment was found.
    pub degraded: bool,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("empty response")]
    EmptyResponse,
}

/// Parse raw model text into a caption with optional quality data.
pub fn parse_response(raw: &str) -> Result<ParsedCaption, ParseError> {
    let text = strip_code_fence(raw.trim());

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(parsed) = from_json(&value) {
            return Ok(parsed);
        }
    }

    if let Some(value) = first_json_object(text) {
        if let Some(parsed) = from_json(&value) {
            return Ok(parsed);
        }
    }

    let caption = strip_label(text);
    if caption.is_empty() {
        return Err(ParseError::EmptyResponse);
    }
    Ok(ParsedCaption {
        caption: caption.to_string(),
        quality: None,
        flags: BTreeSet::new(),
        degraded: true,
    })
}

/// Remove a surrounding markdown code fence, with or without a language tag.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Map a JSON value onto the caption schema. `None` when there is no usable caption.
fn from_json(value: &Value) -> Option<ParsedCaption> {
    let object = value.as_object()?;
    let caption = object.get("caption")?.as_str()?.trim();
    if caption.is_empty() {
        return None;
    }

    let quality = object
        .get("quality")
        .and_then(|q| serde_json::from_value::<QualityScores>(q.clone()).ok())
        .map(QualityScores::clamped);

    let flags = object
        .get("flags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(ParsedCaption {
        caption: caption.to_string(),
        degraded: quality.is_none(),
        quality,
        flags,
    })
}

/// Find the first well-formed JSON object inside arbitrary text.
fn first_json_object(text: &str) -> Option<Value> {
    text.match_indices('{').find_map(|(idx, _)| {
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) if value.is_object() => Some(value),
            _ => None,
        }
    })
}

fn strip_label(text: &str) -> &str {
    let trimmed = text.trim();
    for label in CAPTION_LABELS {
        let matches = trimmed
            .get(..label.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(label));
        if matches {
            return trimmed[label.len()..].trim();
        }
    }
    trimmed
}
