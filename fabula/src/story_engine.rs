//! Story state machine.
//!
//! Owns the active-story map. Mutating operations hold the story's own
//! lock for their whole duration, so two requests against one story
//! serialize while distinct stories run in parallel. Retrieval feeds
//! the continuation prompt; retrieval failures degrade to an empty
//! context rather than failing the step. Memory and snapshot
//! persistence run on background tasks and never fail the call.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;

use crate::llm::{ChatMessage, ChatRequest, LanguageModel};
use crate::memory::{memory_id, DecisionMemory, Memory, MemoryKind, MemoryStore};
use crate::session_store::{DecisionRecord, SessionStore};
use crate::story::{StoryOption, StoryResponse, StorySettings, StoryState};
use crate::template::{
    story_context, ImagePromptContext, TemplateEngine, IMAGE_GENERATION, STORY_CONTINUATION,
};
use crate::{Error, Result};

const STORY_TEMPERATURE: f32 = 0.7;
const STORY_MAX_TOKENS: u32 = 1000;
const RELATED_LIMIT: usize = 10;
const DECISION_LIMIT: usize = 5;

/// Marker families probed when extracting options from model text.
const OPTION_FAMILIES: [[&str; 3]; 3] = [
    ["1.", "2.", "3."],
    ["A.", "B.", "C."],
    ["一、", "二、", "三、"],
];

type StoryHandle = Arc<Mutex<StoryState>>;

/// Per-session narrative orchestration.
pub struct StoryEngine {
    llm: Arc<dyn LanguageModel>,
    memories: Arc<MemoryStore>,
    templates: Arc<TemplateEngine>,
    sessions: Option<Arc<SessionStore>>,
    stories: RwLock<HashMap<String, StoryHandle>>,
}

impl StoryEngine {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        memories: Arc<MemoryStore>,
        templates: Arc<TemplateEngine>,
    ) -> Self {
        Self {
            llm,
            memories,
            templates,
            sessions: None,
            stories: RwLock::new(HashMap::new()),
        }
    }

    /// Also snapshot stories and decisions to a durable store.
    pub fn with_session_store(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Start a story and generate its opening segment.
    pub async fn create(&self, story_id: &str, settings: StorySettings) -> Result<StoryState> {
        let settings = settings.with_defaults();
        let handle: StoryHandle = {
            let mut stories = self.stories.write().unwrap();
            if stories.contains_key(story_id) {
                return Err(Error::Conflict(format!("story {story_id} already exists")));
            }
            let handle = Arc::new(Mutex::new(StoryState::from_settings(&settings)));
            stories.insert(story_id.to_string(), handle.clone());
            handle
        };

        let mut state = handle.lock().await;
        let response = match self.generate_step(story_id, &mut state, "").await {
            Ok(response) => response,
            Err(e) => {
                self.stories.write().unwrap().remove(story_id);
                return Err(e);
            }
        };
        state.current_scene = response.scene.clone();

        self.spawn_store_memory(Memory {
            id: memory_id(MemoryKind::StoryState, story_id),
            kind: MemoryKind::StoryState,
            content: state.summary.clone(),
            timestamp: Utc::now().timestamp(),
            story_id: story_id.to_string(),
            metadata: [
                ("genre".to_string(), json!(state.genre)),
                ("protagonist".to_string(), json!(state.protagonist)),
            ]
            .into_iter()
            .collect(),
        });
        self.spawn_snapshot(story_id, state.clone());
        Ok(state.clone())
    }

    /// Advance a story with a free-text audience action.
    pub async fn advance(&self, story_id: &str, action: &str) -> Result<StoryResponse> {
        let handle = self.handle(story_id)?;
        let mut state = handle.lock().await;
        let response = self.generate_step(story_id, &mut state, action).await?;

        if !action.is_empty() {
            self.spawn_store_memory(Memory {
                id: memory_id(MemoryKind::PlayerAction, story_id),
                kind: MemoryKind::PlayerAction,
                content: action.to_string(),
                timestamp: Utc::now().timestamp(),
                story_id: story_id.to_string(),
                metadata: [("current_node".to_string(), json!(state.current_node))]
                    .into_iter()
                    .collect(),
            });
        }
        self.spawn_snapshot(story_id, state.clone());
        Ok(response)
    }

    /// Apply a selected option and continue the story from it.
    pub async fn choose(
        &self,
        story_id: &str,
        option_id: &str,
        choice_text: &str,
    ) -> Result<StoryResponse> {
        let handle = self.handle(story_id)?;
        let mut state = handle.lock().await;

        let decision = DecisionMemory {
            memory: Memory {
                id: memory_id(MemoryKind::Decision, story_id),
                kind: MemoryKind::Decision,
                content: format!("Chose option {option_id}: {choice_text}"),
                timestamp: Utc::now().timestamp(),
                story_id: story_id.to_string(),
                metadata: Default::default(),
            },
            option_id: option_id.to_string(),
            choice_text: choice_text.to_string(),
            reason: String::new(),
        };
        self.spawn_store_decision(decision);
        if let Some(sessions) = &self.sessions {
            let sessions = sessions.clone();
            let record = DecisionRecord::new(story_id, option_id, choice_text);
            tokio::spawn(async move {
                if let Err(e) = sessions.record_decision(&record).await {
                    tracing::warn!(error = %e, "failed to record decision");
                }
            });
        }

        let response = self.generate_step(story_id, &mut state, choice_text).await?;
        self.spawn_snapshot(story_id, state.clone());
        Ok(response)
    }

    /// Deep copy of a story's current state.
    pub async fn state(&self, story_id: &str) -> Result<StoryState> {
        let handle = self.handle(story_id)?;
        let state = handle.lock().await;
        Ok(state.clone())
    }

    /// Finish a story, optionally keeping its durable snapshot.
    pub async fn end(&self, story_id: &str, save: bool) -> Result<()> {
        let handle = {
            let mut stories = self.stories.write().unwrap();
            stories
                .remove(story_id)
                .ok_or_else(|| Error::NotFound(format!("story {story_id}")))?
        };
        let state = handle.lock().await;

        self.spawn_store_memory(Memory {
            id: memory_id(MemoryKind::StoryState, story_id),
            kind: MemoryKind::StoryState,
            content: format!("The story ends. Final scene: {}", state.current_scene),
            timestamp: Utc::now().timestamp(),
            story_id: story_id.to_string(),
            metadata: [("final".to_string(), json!(true))].into_iter().collect(),
        });

        if let Some(sessions) = &self.sessions {
            if save {
                if let Err(e) = sessions.save_story(story_id, &state).await {
                    tracing::warn!(error = %e, story = story_id, "failed to save final snapshot");
                }
            } else if let Err(e) = sessions.delete_story(story_id).await {
                tracing::warn!(error = %e, story = story_id, "failed to drop snapshot");
            }
        }
        Ok(())
    }

    /// Ids of the currently active stories.
    pub fn active_stories(&self) -> Vec<String> {
        self.stories.read().unwrap().keys().cloned().collect()
    }

    fn handle(&self, story_id: &str) -> Result<StoryHandle> {
        self.stories
            .read()
            .unwrap()
            .get(story_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("story {story_id}")))
    }

    async fn generate_step(
        &self,
        story_id: &str,
        state: &mut StoryState,
        action: &str,
    ) -> Result<StoryResponse> {
        // Retrieval runs both searches concurrently and tolerates
        // failure; the prompt just sees an empty context.
        let query = if action.is_empty() {
            state.summary.clone()
        } else {
            action.to_string()
        };
        let (related, decisions) = tokio::join!(
            self.memories.search_related(
                &query,
                RELATED_LIMIT,
                &[
                    MemoryKind::PlayerAction,
                    MemoryKind::Decision,
                    MemoryKind::Npc,
                ],
            ),
            self.memories.search_recent_decisions(story_id, DECISION_LIMIT),
        );
        let related = related.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "memory retrieval failed, continuing without");
            Vec::new()
        });
        let decisions = decisions.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "decision retrieval failed, continuing without");
            Vec::new()
        });

        let memory_lines: Vec<String> = related
            .iter()
            .map(|m| format!("[{}] {}", m.kind, m.content))
            .collect();
        let decision_lines: Vec<String> = decisions
            .iter()
            .map(|d| format!("[decision] {}: {}", d.option_id, d.choice_text))
            .collect();

        let vars = story_context(state, action, &memory_lines, &decision_lines);
        let prompt = self.templates.render(STORY_CONTINUATION, &vars)?;

        let request = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            model: String::new(),
            temperature: Some(STORY_TEMPERATURE),
            max_tokens: Some(STORY_MAX_TOKENS),
            stream: None,
        };
        let completion = self.llm.chat(&request).await?;
        let text = completion
            .first_text()
            .map(str::to_string)
            .ok_or_else(|| Error::Upstream("no choices returned from model".into()))?;

        let mut options = parse_options(&text);
        if options.is_empty() {
            options = default_options();
        }
        let scene = extract_scene(&text);

        let mut image_vars = ImagePromptContext {
            scene_description: scene.clone(),
            style: state.style.clone(),
            mood: state.tone.clone(),
            ..Default::default()
        }
        .to_vars();
        image_vars.insert("genre".into(), state.genre.clone());
        let visual_prompt = self
            .templates
            .render(IMAGE_GENERATION, &image_vars)
            .unwrap_or_default();

        state.previous_text = text.clone();
        state.options = options.clone();

        Ok(StoryResponse {
            text,
            scene,
            options,
            next_node: None,
            visual_prompt,
            related_memories: related,
        })
    }

    fn spawn_store_memory(&self, memory: Memory) {
        let store = self.memories.clone();
        tokio::spawn(async move {
            if let Err(e) = store.store_memory(&memory).await {
                tracing::warn!(error = %e, id = %memory.id, "memory persistence failed");
            }
        });
    }

    fn spawn_store_decision(&self, decision: DecisionMemory) {
        let store = self.memories.clone();
        tokio::spawn(async move {
            if let Err(e) = store.store_decision(&decision).await {
                tracing::warn!(error = %e, "decision persistence failed");
            }
        });
    }

    fn spawn_snapshot(&self, story_id: &str, state: StoryState) {
        if let Some(sessions) = &self.sessions {
            let sessions = sessions.clone();
            let story_id = story_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = sessions.save_story(&story_id, &state).await {
                    tracing::warn!(error = %e, story = %story_id, "snapshot failed");
                }
            });
        }
    }
}

/// Extract options from model text.
///
/// Probes `1.`/`2.`/`3.`, then `A.`/`B.`/`C.`, then `一、`/`二、`/`三、`,
/// keeping the first family with at least two markers. An option's
/// description is the text between its marker and the next marker or
/// newline.
pub fn parse_options(text: &str) -> Vec<StoryOption> {
    for family in OPTION_FAMILIES {
        let mut found: Vec<(usize, usize)> = Vec::new();
        let mut search_from = 0;
        for (rank, marker) in family.iter().enumerate() {
            if let Some(pos) = text[search_from..].find(marker) {
                let absolute = search_from + pos;
                found.push((rank, absolute));
                search_from = absolute + marker.len();
            }
        }
        if found.len() < 2 {
            continue;
        }
        let mut options = Vec::new();
        for (i, (rank, pos)) in found.iter().enumerate() {
            let marker = family[*rank];
            let start = pos + marker.len();
            let end = found.get(i + 1).map(|(_, p)| *p).unwrap_or(text.len());
            let description = text[start..end]
                .split('\n')
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            options.push(StoryOption::new(
                (rank + 1).to_string(),
                format!("{marker} {description}").trim().to_string(),
                description,
            ));
        }
        return options;
    }
    Vec::new()
}

/// Fallback choices so a session never stalls on unparseable output.
pub fn default_options() -> Vec<StoryOption> {
    vec![
        StoryOption::new("1", "Continue", "Press on through the current scene"),
        StoryOption::new("2", "Observe", "Take a careful look around"),
        StoryOption::new("3", "Ask the NPC", "Talk to someone nearby"),
    ]
}

/// First substantial line of the generated text.
pub fn extract_scene(text: &str) -> String {
    let mut first_non_empty = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if first_non_empty.is_none() {
            first_non_empty = Some(line);
        }
        if line.chars().count() > 10 {
            return line.to_string();
        }
    }
    first_non_empty.unwrap_or(text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_options_parse_with_descriptions() {
        let options = parse_options("You step inside… 1. Sit 2. Ask 3. Leave");
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].id, "1");
        assert_eq!(options[0].description, "Sit");
        assert_eq!(options[1].description, "Ask");
        assert_eq!(options[2].description, "Leave");
    }

    #[test]
    fn lettered_family_is_probed_second() {
        let options = parse_options("Pick one:\nA. Fight the bandit\nB. Flee the inn");
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].id, "1");
        assert_eq!(options[0].description, "Fight the bandit");
        assert_eq!(options[1].description, "Flee the inn");
    }

    #[test]
    fn locale_family_is_probed_last() {
        let options = parse_options("抉择：一、拔剑 二、退让 三、喝茶");
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].description, "拔剑");
        assert_eq!(options[2].description, "喝茶");
    }

    #[test]
    fn a_single_marker_is_not_enough() {
        assert!(parse_options("Just 1. one marker here").is_empty());
    }

    #[test]
    fn prose_without_markers_parses_to_nothing() {
        assert!(parse_options("The rain kept falling on the old roof.").is_empty());
    }

    #[test]
    fn fallback_options_are_the_canned_three() {
        let options = default_options();
        let texts: Vec<_> = options.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, vec!["Continue", "Observe", "Ask the NPC"]);
    }

    #[test]
    fn scene_is_the_first_substantial_line() {
        assert_eq!(
            extract_scene("\nOk.\nThe tavern door creaks open wide.\nMore."),
            "The tavern door creaks open wide."
        );
        assert_eq!(extract_scene("Short."), "Short.");
    }
}
