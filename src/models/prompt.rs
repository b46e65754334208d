use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Caption style of a caption set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CaptionStyle {
    #[default]
    Natural,
    Detailed,
    Tags,
    Custom,
}

impl CaptionStyle {
    /// Tag-style captions are comma-separated lists rather than sentences.
    pub fn is_tag_list(self) -> bool {
        matches!(self, CaptionStyle::Tags)
    }
}

/// Prompt configuration of a caption set, read from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Default)]
pub struct CaptionSetPromptConfig {
    #[garde(skip)]
    #[serde(default)]
    pub style: CaptionStyle,

    #[garde(skip)]
    #[serde(default)]
    pub custom_prompt: Option<String>,

    #[garde(length(max = 500))]
    #[serde(default)]
    pub trigger_phrase: Option<String>,

    #[garde(range(min = 10, max = 10000))]
    #[serde(default)]
    pub max_length: Option<u32>,
}

impl CaptionSetPromptConfig {
    /// Trigger phrase with surrounding whitespace removed; blank counts as unset.
    pub fn trigger(&self) -> Option<&str> {
        self.trigger_phrase
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}
