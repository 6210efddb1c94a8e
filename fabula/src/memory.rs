//! Story memory over the vector store.
//!
//! Every memory is one point: the embedded content plus a payload
//! carrying kind, story id, timestamp and free-form metadata. Retrieval
//! is similarity search scoped by payload filters.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::embedding::EmbeddingService;
use crate::qdrant_store::{
    Condition, Filter, ScoredPoint, SearchOptions, VectorStore, MEMORY_COLLECTION,
};
use crate::Result;

/// What a memory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    PlayerAction,
    StoryState,
    Npc,
    Decision,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::PlayerAction => "player_action",
            MemoryKind::StoryState => "story_state",
            MemoryKind::Npc => "npc",
            MemoryKind::Decision => "decision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "player_action" => Some(MemoryKind::PlayerAction),
            "story_state" => Some(MemoryKind::StoryState),
            "npc" => Some(MemoryKind::Npc),
            "decision" => Some(MemoryKind::Decision),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub story_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A viewer decision with its option context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub option_id: String,
    pub choice_text: String,
    #[serde(default)]
    pub reason: String,
}

/// Build a practically-unique memory id.
pub fn memory_id(kind: MemoryKind, story_id: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{kind}_{story_id}_{nanos}")
}

/// Memory persistence and retrieval.
pub struct MemoryStore {
    embedding: Arc<EmbeddingService>,
    store: Arc<dyn VectorStore>,
    collection: String,
}

impl MemoryStore {
    pub fn new(embedding: Arc<EmbeddingService>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedding,
            store,
            collection: MEMORY_COLLECTION.to_string(),
        }
    }

    /// Embed and upsert one memory.
    pub async fn store_memory(&self, memory: &Memory) -> Result<()> {
        let vector = self.embedding.embed(&memory.content).await?;
        let mut payload = memory.metadata.clone();
        payload.insert("type".into(), json!(memory.kind.as_str()));
        payload.insert("content".into(), json!(memory.content));
        payload.insert("timestamp".into(), json!(memory.timestamp));
        payload.insert("story_id".into(), json!(memory.story_id));
        self.store
            .upsert(
                &self.collection,
                vec![crate::qdrant_store::PointRecord {
                    id: memory.id.clone(),
                    vector,
                    payload,
                }],
            )
            .await
    }

    /// Store a decision; the option context rides in the metadata.
    pub async fn store_decision(&self, decision: &DecisionMemory) -> Result<()> {
        let mut memory = decision.memory.clone();
        memory.kind = MemoryKind::Decision;
        memory
            .metadata
            .insert("option_id".into(), json!(decision.option_id));
        memory
            .metadata
            .insert("choice_text".into(), json!(decision.choice_text));
        if !decision.reason.is_empty() {
            memory.metadata.insert("reason".into(), json!(decision.reason));
        }
        self.store_memory(&memory).await
    }

    /// Memories similar to `query`, restricted to the given kinds, with
    /// a 0.7 score floor.
    pub async fn search_related(
        &self,
        query: &str,
        limit: usize,
        kinds: &[MemoryKind],
    ) -> Result<Vec<Memory>> {
        let vector = self.embedding.embed(query).await?;
        let filter = if kinds.is_empty() {
            None
        } else {
            Some(Filter {
                must: vec![Condition::match_any(
                    "type",
                    kinds.iter().map(|k| json!(k.as_str())).collect(),
                )],
                ..Default::default()
            })
        };
        let hits = self
            .store
            .search(
                &self.collection,
                &vector,
                &SearchOptions {
                    limit,
                    score_threshold: Some(0.7),
                    filter,
                    ..Default::default()
                },
            )
            .await?;
        Ok(hits.iter().filter_map(point_to_memory).collect())
    }

    /// Latest decisions inside one story, newest first.
    pub async fn search_recent_decisions(
        &self,
        story_id: &str,
        limit: usize,
    ) -> Result<Vec<DecisionMemory>> {
        let vector = self.embedding.embed("player decision").await?;
        let mut must = vec![Condition::matches("type", MemoryKind::Decision.as_str())];
        if !story_id.is_empty() {
            must.push(Condition::matches("story_id", story_id));
        }
        let hits = self
            .store
            .search(
                &self.collection,
                &vector,
                &SearchOptions {
                    // Over-fetch so recency ordering has candidates.
                    limit: limit.max(1) * 4,
                    filter: Some(Filter {
                        must,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        let mut decisions: Vec<DecisionMemory> = hits
            .iter()
            .filter_map(point_to_memory)
            .filter(|m| m.kind == MemoryKind::Decision)
            .map(|memory| {
                let get = |key: &str| {
                    memory
                        .metadata
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                DecisionMemory {
                    option_id: get("option_id"),
                    choice_text: get("choice_text"),
                    reason: get("reason"),
                    memory,
                }
            })
            .collect();
        decisions.sort_by_key(|d| std::cmp::Reverse(d.memory.timestamp));
        decisions.truncate(limit);
        Ok(decisions)
    }

    /// Memories of one kind, optionally scoped to a story.
    pub async fn memories_by_kind(
        &self,
        kind: MemoryKind,
        story_id: &str,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let vector = self.embedding.embed(kind.as_str()).await?;
        let mut must = vec![Condition::matches("type", kind.as_str())];
        if !story_id.is_empty() {
            must.push(Condition::matches("story_id", story_id));
        }
        let hits = self
            .store
            .search(
                &self.collection,
                &vector,
                &SearchOptions {
                    limit,
                    filter: Some(Filter {
                        must,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        Ok(hits
            .iter()
            .filter_map(point_to_memory)
            .filter(|m| m.kind == kind)
            .collect())
    }

    /// Stored point total, from the collection metadata.
    pub async fn count(&self) -> Result<u64> {
        Ok(self.store.collection_info(&self.collection).await?.points_count)
    }
}

fn point_to_memory(point: &ScoredPoint) -> Option<Memory> {
    let kind = point
        .payload
        .get("type")
        .and_then(Value::as_str)
        .and_then(MemoryKind::parse)?;
    let content = point.payload.get("content")?.as_str()?.to_string();
    let story_id = point
        .payload
        .get("story_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let timestamp = point
        .payload
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or_default();
    Some(Memory {
        id: point.id.clone(),
        kind,
        content,
        timestamp,
        story_id,
        metadata: point.payload.clone(),
    })
}

/// Render memories as numbered, kind-prefixed lines for a prompt.
pub fn context_summary(memories: &[Memory], max: usize) -> String {
    if memories.is_empty() {
        return "(no related memories)".to_string();
    }
    memories
        .iter()
        .take(max)
        .enumerate()
        .map(|(i, m)| {
            let label = match m.kind {
                MemoryKind::PlayerAction => "player action",
                MemoryKind::StoryState => "story state",
                MemoryKind::Npc => "npc",
                MemoryKind::Decision => "decision",
            };
            format!("{}. [{label}] {}", i + 1, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_embed_kind_story_and_time() {
        let id = memory_id(MemoryKind::PlayerAction, "s1");
        assert!(id.starts_with("player_action_s1_"));
        let id2 = memory_id(MemoryKind::PlayerAction, "s1");
        assert_ne!(id, id2);
    }

    #[test]
    fn kinds_round_trip_their_names() {
        for kind in [
            MemoryKind::PlayerAction,
            MemoryKind::StoryState,
            MemoryKind::Npc,
            MemoryKind::Decision,
        ] {
            assert_eq!(MemoryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MemoryKind::parse("other"), None);
    }

    #[test]
    fn summary_numbers_and_labels_memories() {
        let memories = vec![
            Memory {
                id: "1".into(),
                kind: MemoryKind::PlayerAction,
                content: "entered the tavern".into(),
                timestamp: 1,
                story_id: "s1".into(),
                metadata: Map::new(),
            },
            Memory {
                id: "2".into(),
                kind: MemoryKind::Decision,
                content: "chose to fight".into(),
                timestamp: 2,
                story_id: "s1".into(),
                metadata: Map::new(),
            },
        ];
        let summary = context_summary(&memories, 10);
        assert!(summary.contains("1. [player action] entered the tavern"));
        assert!(summary.contains("2. [decision] chose to fight"));
        assert_eq!(context_summary(&[], 10), "(no related memories)");
    }
}
