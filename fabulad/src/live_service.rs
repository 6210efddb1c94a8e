//! Live connection ownership and the inbound forward loop.
//!
//! One service owns at most one platform session. Messages flow
//! through dedup, then out to the hub, the recent-message store and,
//! when they parse as commands, into the story engine.

use std::sync::{Arc, Mutex as StdMutex};

use fabula::{
    adapter_for, ConnectOptions, Danmaku, DanmakuParser, DedupFilter, Error, Hub, LiveAdapter,
    ParsedCommand, Platform, RecentMessages, Result, StoryEngine,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::media::MediaPipeline;

/// Connection state reported over the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub client_count: usize,
}

struct Active {
    adapter: Arc<dyn LiveAdapter>,
    platform: Platform,
    room_id: String,
}

/// Manages the upstream live session.
pub struct LiveService {
    hub: Arc<Hub>,
    recent: Arc<RecentMessages>,
    engine: Arc<StoryEngine>,
    parser: DanmakuParser,
    dedup: Arc<StdMutex<DedupFilter>>,
    story_id: String,
    media: Option<Arc<MediaPipeline>>,
    active: Mutex<Option<Active>>,
}

impl LiveService {
    pub fn new(
        hub: Arc<Hub>,
        recent: Arc<RecentMessages>,
        engine: Arc<StoryEngine>,
        dedup: DedupFilter,
        story_id: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            recent,
            engine,
            parser: DanmakuParser::new(),
            dedup: Arc::new(StdMutex::new(dedup)),
            story_id: story_id.into(),
            media: None,
            active: Mutex::new(None),
        }
    }

    /// Also generate scene art and narration for chat-driven updates.
    pub fn with_media(mut self, media: Arc<MediaPipeline>) -> Self {
        self.media = Some(media);
        self
    }

    /// Connect to a live room and start forwarding its messages.
    pub async fn connect(&self, platform: &str, room_id: &str, cookie: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::Conflict("already connected".into()));
        }
        let platform: Platform = platform.parse()?;
        let adapter = adapter_for(platform);
        adapter
            .connect(&ConnectOptions {
                room_id: room_id.to_string(),
                cookie: cookie.to_string(),
            })
            .await?;
        let messages = adapter.subscribe_danmaku().await?;

        tokio::spawn(forward_loop(
            messages,
            self.hub.clone(),
            self.recent.clone(),
            self.engine.clone(),
            self.parser.clone(),
            self.dedup.clone(),
            self.story_id.clone(),
            self.media.clone(),
        ));

        *active = Some(Active {
            adapter,
            platform,
            room_id: room_id.to_string(),
        });
        tracing::info!(platform = platform.as_str(), room = room_id, "live session connected");
        Ok(())
    }

    /// Tear the session down. A no-op when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(active) = active.take() {
            if let Err(e) = active.adapter.disconnect().await {
                tracing::warn!(error = %e, "disconnect reported an error");
            }
            tracing::info!("live session disconnected");
        }
        Ok(())
    }

    pub async fn status(&self) -> LiveStatus {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(active) => LiveStatus {
                connected: true,
                platform: Some(active.platform.as_str().to_string()),
                room_id: Some(active.room_id.clone()),
                client_count: self.hub.count(),
            },
            None => LiveStatus {
                client_count: self.hub.count(),
                ..Default::default()
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_loop(
    mut messages: mpsc::Receiver<Danmaku>,
    hub: Arc<Hub>,
    recent: Arc<RecentMessages>,
    engine: Arc<StoryEngine>,
    parser: DanmakuParser,
    dedup: Arc<StdMutex<DedupFilter>>,
    story_id: String,
    media: Option<Arc<MediaPipeline>>,
) {
    while let Some(danmaku) = messages.recv().await {
        if !dedup.lock().unwrap().observe(&danmaku.content) {
            continue;
        }
        hub.broadcast("danmaku", &danmaku);
        recent.push(danmaku.clone());

        match parser.parse(&danmaku) {
            ParsedCommand::None { .. } => {}
            ParsedCommand::Action { verb, params } => {
                let action = rebuild_action(&verb, &params);
                let engine = engine.clone();
                let hub = hub.clone();
                let story = story_id.clone();
                let media = media.clone();
                tokio::spawn(async move {
                    match engine.advance(&story, &action).await {
                        Ok(response) => {
                            hub.broadcast("story", &response);
                            if let Some(media) = &media {
                                media.spawn_for_response(&story, &response);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "command did not advance the story"),
                    }
                });
            }
            ParsedCommand::Vote { option_id } => {
                let engine = engine.clone();
                let story = story_id.clone();
                let hub = hub.clone();
                let media = media.clone();
                tokio::spawn(async move {
                    let choice_text = match engine.state(&story).await {
                        Ok(state) => state
                            .options
                            .iter()
                            .find(|o| o.id == option_id)
                            .map(|o| o.text.clone())
                            .unwrap_or_else(|| format!("Option {option_id}")),
                        Err(_) => format!("Option {option_id}"),
                    };
                    match engine.choose(&story, &option_id, &choice_text).await {
                        Ok(response) => {
                            hub.broadcast("story", &response);
                            if let Some(media) = &media {
                                media.spawn_for_response(&story, &response);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "vote did not advance the story"),
                    }
                });
            }
        }
    }
    tracing::info!("danmaku stream ended");
}

/// Reassemble a command into the free-text action the engine sees:
/// positional parameters in order, then `key=value` pairs.
fn rebuild_action(verb: &str, params: &std::collections::BTreeMap<String, String>) -> String {
    let mut parts = vec![verb.to_string()];
    let mut positional: Vec<(usize, &String)> = params
        .iter()
        .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
        .collect();
    positional.sort_by_key(|(i, _)| *i);
    parts.extend(positional.into_iter().map(|(_, v)| v.clone()));
    for (key, value) in params {
        if key.parse::<usize>().is_err() {
            parts.push(format!("{key}={value}"));
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn actions_rebuild_in_positional_then_named_order() {
        let mut params = BTreeMap::new();
        params.insert("0".to_string(), "dragon".to_string());
        params.insert("weapon".to_string(), "sword".to_string());
        assert_eq!(rebuild_action("attack", &params), "attack dragon weapon=sword");
        assert_eq!(rebuild_action("look", &BTreeMap::new()), "look");
    }
}
