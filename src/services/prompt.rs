//! Prompt construction for caption requests.
//!
//! A prompt is assembled in a fixed order: the creative prompt for the
//! caption style, an optional trigger-phrase instruction, an optional length
//! ceiling, and finally the output directive. The directive is identical for
//! every style so the response parser always has the same target.

use crate::models::prompt::{CaptionSetPromptConfig, CaptionStyle};

const NATURAL_PROMPT: &str = concat!(
    "Describe this image in one or two natural sentences suitable as a training caption. ",
    "Mention the main subject, what it is doing, and the setting. ",
    "Do not speculate about things that are not visible."
);

const DETAILED_PROMPT: &str = concat!(
    "Write a detailed description of this image suitable as a training caption. ",
    "Cover the main subject, pose and expression, clothing, background, lighting, ",
    "color palette, camera angle and overall composition. ",
    "Describe only what is visible."
);

const TAGS_PROMPT: &str = concat!(
    "List comma-separated tags describing this image, most important first. ",
    "Include subject, attributes, clothing, setting, lighting and style. ",
    "Use short lowercase tags without sentences."
);

/// Fixed output directive appended to every prompt.
pub const OUTPUT_DIRECTIVE: &str = concat!(
    "Respond with ONLY a JSON object and no other text, using exactly these keys:\n",
    "{\"caption\": string, ",
    "\"quality\": {\"sharpness\": number, \"clarity\": number, \"composition\": number, ",
    "\"exposure\": number, \"overall\": number}, ",
    "\"flags\": [string]}\n",
    "Every quality value must be between 0.0 and 1.0. ",
    "Use flags for short notes on problems such as \"blurry\", \"watermark\", \"cropped\" or \"low_light\"; ",
    "use an empty array when there are none."
);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PromptError {
    #[error("custom caption style requires a non-empty custom prompt")]
    MissingCustomPrompt,
}

/// Build the full prompt text for a caption set configuration.
pub fn build_prompt(config: &CaptionSetPromptConfig) -> Result<String, PromptError> {
    let creative = match config.style {
        CaptionStyle::Natural => NATURAL_PROMPT.to_string(),
        CaptionStyle::Detailed => DETAILED_PROMPT.to_string(),
        CaptionStyle::Tags => TAGS_PROMPT.to_string(),
        CaptionStyle::Custom => config
            .custom_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or(PromptError::MissingCustomPrompt)?
            .to_string(),
    };

    let mut sections = vec![creative];
    if let Some(trigger) = config.trigger() {
        sections.push(trigger_instruction(config.style, trigger));
    }
    if let Some(max) = config.max_length {
        sections.push(length_instruction(max));
    }
    sections.push(OUTPUT_DIRECTIVE.to_string());

    Ok(sections.join("\n\n"))
}

/// Instruction forcing the caption to open with the trigger phrase.
pub fn trigger_instruction(style: CaptionStyle, trigger: &str) -> String {
    if style.is_tag_list() {
        format!(
            "The first tag of the caption must be exactly \"{}\", followed by the remaining tags.",
            trigger
        )
    } else {
        format!(
            "The caption must begin with exactly \"{}\" as the start of its first sentence.",
            trigger
        )
    }
}

pub fn length_instruction(max_length: u32) -> String {
    format!("Keep the caption under {} characters.", max_length)
}

/// Apply the caption set's trigger phrase and length ceiling to a model caption.
///
/// Returns the adjusted caption and whether it had to be truncated.
pub fn finish_caption(caption: &str, config: &CaptionSetPromptConfig) -> (String, bool) {
    let mut text = caption.trim().to_string();

    if let Some(trigger) = config.trigger() {
        let starts_with_trigger = text
            .get(..trigger.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(trigger));
        if !starts_with_trigger {
            text = format!("{}, {}", trigger, text);
        }
    }

    let Some(max) = config.max_length.map(|m| m as usize) else {
        return (text, false);
    };
    if text.chars().count() <= max {
        return (text, false);
    }

    let cut: String = text.chars().take(max).collect();
    let truncated = match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx].trim_end_matches([',', ';', ' ']).to_string(),
        _ => cut,
    };
    (truncated, true)
}
