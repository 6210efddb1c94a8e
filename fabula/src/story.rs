//! Story session types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Memory;

pub const DEFAULT_GENRE: &str = "wuxia";
pub const DEFAULT_TONE: &str = "epic";
pub const DEFAULT_STYLE: &str = "classical";

/// Creation-time settings; empty fields fall back to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorySettings {
    #[serde(default)]
    pub protagonist: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub style: String,
}

impl StorySettings {
    pub fn with_defaults(mut self) -> Self {
        if self.genre.is_empty() {
            self.genre = DEFAULT_GENRE.into();
        }
        if self.tone.is_empty() {
            self.tone = DEFAULT_TONE.into();
        }
        if self.style.is_empty() {
            self.style = DEFAULT_STYLE.into();
        }
        self
    }
}

/// One selectable branch presented to the audience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryOption {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl StoryOption {
    pub fn new(id: impl Into<String>, text: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            description: description.into(),
            next_node: None,
            metadata: None,
        }
    }
}

/// Mutable state of one running story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryState {
    pub current_node: String,
    pub current_scene: String,
    pub previous_text: String,
    pub summary: String,
    pub protagonist: String,
    pub npcs: String,
    pub genre: String,
    pub tone: String,
    pub style: String,
    #[serde(default)]
    pub options: Vec<StoryOption>,
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}

impl StoryState {
    pub fn new(protagonist: &str, genre: &str, tone: &str, style: &str) -> Self {
        Self {
            current_node: "start".into(),
            current_scene: "The story begins".into(),
            previous_text: String::new(),
            summary: format!("A {genre} tale of {protagonist} begins"),
            protagonist: protagonist.into(),
            npcs: String::new(),
            genre: genre.into(),
            tone: tone.into(),
            style: style.into(),
            options: Vec::new(),
            custom: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &StorySettings) -> Self {
        Self::new(
            &settings.protagonist,
            &settings.genre,
            &settings.tone,
            &settings.style,
        )
    }
}

/// One generated story step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryResponse {
    pub text: String,
    pub scene: String,
    pub options: Vec<StoryOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node: Option<String>,
    #[serde(default)]
    pub visual_prompt: String,
    #[serde(default)]
    pub related_memories: Vec<Memory>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_settings_take_defaults() {
        let settings = StorySettings {
            protagonist: "Li".into(),
            ..Default::default()
        }
        .with_defaults();
        assert_eq!(settings.genre, "wuxia");
        assert_eq!(settings.tone, "epic");
        assert_eq!(settings.style, "classical");
    }

    #[test]
    fn provided_settings_are_kept() {
        let settings = StorySettings {
            protagonist: "Li".into(),
            genre: "xianxia".into(),
            tone: "somber".into(),
            style: "modern".into(),
        }
        .with_defaults();
        assert_eq!(settings.genre, "xianxia");
        assert_eq!(settings.tone, "somber");
        assert_eq!(settings.style, "modern");
    }
}
