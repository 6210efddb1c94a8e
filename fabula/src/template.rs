//! Named prompt templates with `{{var}}` substitution.
//!
//! Rendering replaces each `{{name}}` placeholder with the matching
//! context value; placeholders with no value stay verbatim so a
//! half-filled prompt is visible instead of silently blank.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::story::StoryState;
use crate::{Error, Result};

static VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").unwrap());

/// Values available to a render call.
pub type TemplateVars = BTreeMap<String, String>;

/// A named template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Registry of templates, pre-seeded with the story defaults.
pub struct TemplateEngine {
    templates: RwLock<HashMap<String, Template>>,
}

impl TemplateEngine {
    /// Engine with the default story templates registered.
    pub fn new() -> Self {
        let engine = Self {
            templates: RwLock::new(HashMap::new()),
        };
        for template in default_templates() {
            engine.register(template);
        }
        engine
    }

    /// Empty engine, for callers bringing their own templates.
    pub fn empty() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, mut template: Template) {
        if template.variables.is_empty() {
            template.variables = template_variables(&template.content);
        }
        self.templates
            .write()
            .unwrap()
            .insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Result<Template> {
        self.templates
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("template {name}")))
    }

    /// Render a registered template against `vars`.
    pub fn render(&self, name: &str, vars: &TemplateVars) -> Result<String> {
        let template = self.get(name)?;
        Ok(render_str(&template.content, vars))
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.read().unwrap().keys().cloned().collect()
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Substitute `{{name}}` placeholders in `content`.
pub fn render_str(content: &str, vars: &TemplateVars) -> String {
    VAR_RE
        .replace_all(content, |caps: &regex::Captures<'_>| {
            match vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Distinct placeholder names in a template body, in first-seen order.
pub fn template_variables(content: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in VAR_RE.captures_iter(content) {
        let name = caps[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Assemble the render context for the continuation template.
pub fn story_context(
    state: &StoryState,
    player_action: &str,
    related_memories: &[String],
    related_decisions: &[String],
) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.insert("current_scene".into(), state.current_scene.clone());
    vars.insert("player_action".into(), player_action.to_string());
    vars.insert("previous_text".into(), state.previous_text.clone());
    vars.insert("story_summary".into(), state.summary.clone());
    vars.insert("protagonist".into(), state.protagonist.clone());
    vars.insert("npcs".into(), state.npcs.clone());
    vars.insert("related_memories".into(), related_memories.join("\n"));
    vars.insert("related_decisions".into(), related_decisions.join("\n"));
    vars.insert("genre".into(), state.genre.clone());
    vars.insert("tone".into(), state.tone.clone());
    vars.insert("style".into(), state.style.clone());
    for (key, value) in &state.custom {
        if let Some(text) = value.as_str() {
            vars.entry(key.clone()).or_insert_with(|| text.to_string());
        }
    }
    vars
}

/// Context for rendering an image prompt.
#[derive(Debug, Clone, Default)]
pub struct ImagePromptContext {
    pub scene_description: String,
    pub style: String,
    pub characters: Vec<String>,
    pub mood: String,
    pub time_of_day: String,
    pub weather: String,
}

impl ImagePromptContext {
    /// Flatten into render vars; the scene description is enriched
    /// with characters, mood, time and weather when present.
    pub fn to_vars(&self) -> TemplateVars {
        let mut scene = self.scene_description.clone();
        if !self.characters.is_empty() {
            scene.push_str(", with ");
            scene.push_str(&self.characters.join(" and "));
        }
        if !self.mood.is_empty() {
            scene.push_str(&format!(", {} mood", self.mood));
        }
        if !self.time_of_day.is_empty() {
            scene.push_str(&format!(", {}", self.time_of_day));
        }
        if !self.weather.is_empty() {
            scene.push_str(&format!(", {}", self.weather));
        }
        let mut vars = TemplateVars::new();
        vars.insert("scene_description".into(), scene);
        vars.insert("style".into(), self.style.clone());
        vars.insert("characters".into(), self.characters.join(", "));
        vars.insert("mood".into(), self.mood.clone());
        vars.insert("time_of_day".into(), self.time_of_day.clone());
        vars.insert("weather".into(), self.weather.clone());
        vars
    }
}

pub const STORY_CONTINUATION: &str = "story_continuation";
pub const SCENE_DESCRIPTION: &str = "scene_description";
pub const IMAGE_GENERATION: &str = "image_generation";
pub const NPC_RESPONSE: &str = "npc_response";
pub const DECISION_SUMMARY: &str = "decision_summary";

fn default_templates() -> Vec<Template> {
    vec![
        Template {
            name: STORY_CONTINUATION.into(),
            description: "Main template for continuing the story".into(),
            content: "You are a novelist steeped in classical wuxia, writing a live \
interactive jianghu tale.\n\n\
## Background\n{{story_summary}}\n\n\
## Current scene\n{{current_scene}}\n\n\
## Previous passage\n{{previous_text}}\n\n\
## The audience's action\n{{player_action}}\n\n\
## Related memories and decisions\n{{related_memories}}\n\n{{related_decisions}}\n\n\
## Requirements\n\
1. Write in a {{genre}} register and keep the {{tone}} tone throughout.\n\
2. No modern technology, machines or science-fiction concepts of any kind.\n\
3. Scenery draws on inns, teahouses, temples, bamboo groves, mountain passes and sects.\n\
4. Weapons stay classical: sabres, swords, staves, whips, fans, hidden darts.\n\
5. Ground the protagonist {{protagonist}}'s behaviour in their established character.\n\
6. Answer the audience's action with a plausible branch of the plot.\n\
7. Keep the passage between 300 and 500 words.\n\
8. Close with two or three choices for the audience, numbered 1. 2. 3.\n\n\
Continue the story:"
                .into(),
            variables: Vec::new(),
        },
        Template {
            name: SCENE_DESCRIPTION.into(),
            description: "Template for describing a scene".into(),
            content: "Write a vivid scene description of 100 to 200 words.\n\n\
Scene: {{scene_name}}\nTime: {{time_of_day}}\nWeather: {{weather}}\n\
Surroundings: {{environment}}\nMood: {{mood}}\n\n\
Use wuxia-flavoured language across sight, sound and smell, staying true \
to the {{genre}} register."
                .into(),
            variables: Vec::new(),
        },
        Template {
            name: IMAGE_GENERATION.into(),
            description: "Template for generating image prompts".into(),
            content: "Generate a detailed image prompt for a {{genre}} style scene.\n\n\
Scene: {{scene_description}}\nStyle: {{style}}\nCharacters: {{characters}}\n\
Mood: {{mood}}\nTime of day: {{time_of_day}}\nWeather: {{weather}}\n\n\
The image should have:\n\
- High quality, detailed art style\n\
- Atmospheric lighting appropriate for the mood\n\
- Character designs consistent with wuxia aesthetics\n\
- Rich background details matching the scene description\n\n\
Do not include any text in the image."
                .into(),
            variables: Vec::new(),
        },
        Template {
            name: NPC_RESPONSE.into(),
            description: "Template for NPC dialogue".into(),
            content: "## NPC reply\n\n\
NPC: {{npc_name}}\nTemperament: {{npc_personality}}\n\
Manner of speech: {{npc_speaking_style}}\nSituation: {{current_situation}}\n\
The audience's action: {{player_action}}\n\n\
Write the NPC's reply in 50 to 100 words, in character, answering the \
action, in the {{genre}} register with a {{mood}} colouring."
                .into(),
            variables: Vec::new(),
        },
        Template {
            name: DECISION_SUMMARY.into(),
            description: "Template for summarizing audience decisions".into(),
            content: "## Decision summary\n\nStory node: {{story_node}}\n\
Choice made: {{player_choice}}\nStated reason: {{choice_reason}}\n\n\
Summarize the significance of this decision in under 50 words:"
                .into(),
            variables: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_placeholders() {
        let mut vars = TemplateVars::new();
        vars.insert("name".into(), "Li".into());
        assert_eq!(render_str("Hello {{name}}!", &vars), "Hello Li!");
    }

    #[test]
    fn unknown_placeholders_stay_verbatim() {
        let vars = TemplateVars::new();
        assert_eq!(render_str("Hello {{name}}!", &vars), "Hello {{name}}!");
    }

    #[test]
    fn variables_are_extracted_in_order_without_repeats() {
        let vars = template_variables("{{b}} and {{a}} and {{b}}");
        assert_eq!(vars, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn default_templates_are_registered() {
        let engine = TemplateEngine::new();
        for name in [
            STORY_CONTINUATION,
            SCENE_DESCRIPTION,
            IMAGE_GENERATION,
            NPC_RESPONSE,
            DECISION_SUMMARY,
        ] {
            let template = engine.get(name).unwrap();
            assert!(!template.variables.is_empty(), "{name} has no variables");
        }
    }

    #[test]
    fn continuation_template_renders_from_state() {
        let engine = TemplateEngine::new();
        let state = StoryState::new("Li", "wuxia", "epic", "classical");
        let vars = story_context(&state, "enter the tavern", &[], &[]);
        let prompt = engine.render(STORY_CONTINUATION, &vars).unwrap();
        assert!(prompt.contains("enter the tavern"));
        assert!(prompt.contains("Li"));
        assert!(!prompt.contains("{{player_action}}"));
    }

    #[test]
    fn image_context_enriches_the_scene() {
        let ctx = ImagePromptContext {
            scene_description: "a moonlit courtyard".into(),
            mood: "tense".into(),
            characters: vec!["a swordsman".into()],
            ..Default::default()
        };
        let vars = ctx.to_vars();
        let scene = vars.get("scene_description").unwrap();
        assert!(scene.contains("a moonlit courtyard"));
        assert!(scene.contains("with a swordsman"));
        assert!(scene.contains("tense mood"));
    }
}
