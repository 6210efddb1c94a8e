//! End-to-end exercises of the story state machine against scripted
//! model and vector-store doubles.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fabula::qdrant_store::{
    CollectionInfo, ConditionOp, Filter, PointRecord, ScoredPoint, SearchOptions, VectorStore,
};
use fabula::{
    ChatRequest, ChatResponse, EmbeddingService, Error, LanguageModel, MemoryKind, MemoryStore,
    Result, StoryEngine, StorySettings, TemplateEngine,
};
use serde_json::Value;

const DIM: usize = 8;

/// Chat model that replays scripted responses, optionally delayed.
struct ScriptedModel {
    responses: Mutex<VecDeque<(Duration, Result<String>)>>,
}

impl ScriptedModel {
    fn new(responses: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|r| (Duration::ZERO, r))
                    .collect(),
            ),
        })
    }

    fn with_delays(responses: Vec<(Duration, Result<String>)>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        let (delay, scripted) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((Duration::ZERO, Err(Error::Upstream("script ran dry".into()))));
        tokio::time::sleep(delay).await;
        let text = scripted?;
        Ok(serde_json::from_value(serde_json::json!({
            "id": "scripted",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text}}],
        }))
        .unwrap())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.5; DIM];
                for (i, b) in t.bytes().enumerate() {
                    v[i % DIM] += b as f64 / 255.0;
                }
                v
            })
            .collect())
    }
}

/// Vector store keeping points in memory with real cosine ranking.
#[derive(Default)]
struct FakeVectorStore {
    points: Mutex<HashMap<String, PointRecord>>,
    fail_search: bool,
}

impl FakeVectorStore {
    fn failing() -> Self {
        Self {
            fail_search: true,
            ..Default::default()
        }
    }

    fn stored(&self) -> Vec<PointRecord> {
        self.points.lock().unwrap().values().cloned().collect()
    }
}

fn matches_condition(payload: &serde_json::Map<String, Value>, op: &ConditionOp, key: &str) -> bool {
    let value = payload.get(key);
    match op {
        ConditionOp::Match(expected) => value == Some(expected),
        ConditionOp::MatchAny(options) => value.map(|v| options.contains(v)).unwrap_or(false),
        ConditionOp::Range { gte, lte } => {
            let Some(number) = value.and_then(Value::as_f64) else {
                return false;
            };
            gte.map(|g| number >= g).unwrap_or(true) && lte.map(|l| number <= l).unwrap_or(true)
        }
    }
}

fn matches_filter(payload: &serde_json::Map<String, Value>, filter: &Filter) -> bool {
    filter
        .must
        .iter()
        .all(|c| matches_condition(payload, &c.op, &c.key))
        && !filter
            .must_not
            .iter()
            .any(|c| matches_condition(payload, &c.op, &c.key))
}

#[async_trait]
impl VectorStore for FakeVectorStore {
    async fn ensure_collection(&self, _name: &str, _vector_size: usize) -> Result<()> {
        Ok(())
    }

    async fn collection_exists(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn upsert(&self, _collection: &str, points: Vec<PointRecord>) -> Result<()> {
        let mut stored = self.points.lock().unwrap();
        for point in points {
            stored.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        _collection: &str,
        vector: &[f64],
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredPoint>> {
        if self.fail_search {
            return Err(Error::Unavailable("search is down".into()));
        }
        let points = self.points.lock().unwrap();
        let mut hits: Vec<ScoredPoint> = points
            .values()
            .filter(|p| {
                opts.filter
                    .as_ref()
                    .map(|f| {
                        let mut payload = p.payload.clone();
                        payload.insert("id".into(), Value::String(p.id.clone()));
                        matches_filter(&payload, f)
                    })
                    .unwrap_or(true)
            })
            .map(|p| {
                let score = p
                    .vector
                    .iter()
                    .zip(vector)
                    .map(|(a, b)| a * b)
                    .sum::<f64>();
                let mut payload = p.payload.clone();
                payload.insert("id".into(), Value::String(p.id.clone()));
                ScoredPoint {
                    id: p.id.clone(),
                    score,
                    payload,
                    vector: None,
                }
            })
            .filter(|hit| hit.score >= opts.score_threshold.unwrap_or(f64::MIN))
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(opts.limit);
        Ok(hits)
    }

    async fn delete(&self, _collection: &str, ids: &[String]) -> Result<()> {
        let mut stored = self.points.lock().unwrap();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        Ok(CollectionInfo {
            name: name.to_string(),
            vector_size: DIM,
            points_count: self.points.lock().unwrap().len() as u64,
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn engine_with(
    llm: Arc<ScriptedModel>,
    store: Arc<FakeVectorStore>,
) -> StoryEngine {
    let embedding = Arc::new(EmbeddingService::new(llm.clone(), DIM));
    let memories = Arc::new(MemoryStore::new(embedding, store));
    StoryEngine::new(llm, memories, Arc::new(TemplateEngine::new()))
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn advancing_parses_options_and_persists_the_action() {
    let llm = ScriptedModel::new(vec![
        Ok("The valley lies quiet under dusk. 1. Walk on 2. Make camp".into()),
        Ok("You step inside… 1. Sit 2. Ask 3. Leave".into()),
    ]);
    let store = Arc::new(FakeVectorStore::default());
    let engine = engine_with(llm, store.clone());

    let state = engine
        .create(
            "s1",
            StorySettings {
                protagonist: "Li".into(),
                genre: "wuxia".into(),
                tone: "epic".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(state.options.len(), 2);

    let response = engine.advance("s1", "enter the tavern").await.unwrap();
    let ids: Vec<_> = response.options.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(response.options[0].description, "Sit");
    assert!(response.text.starts_with("You step inside"));
    assert!(!response.visual_prompt.is_empty());

    // The action memory is stored on a background task.
    wait_for("player_action memory", || {
        store.stored().iter().any(|p| {
            p.payload.get("type").and_then(Value::as_str) == Some("player_action")
                && p.payload.get("content").and_then(Value::as_str) == Some("enter the tavern")
        })
    })
    .await;

    let current = engine.state("s1").await.unwrap();
    assert_eq!(current.previous_text, response.text);
    assert_eq!(current.options, response.options);
}

#[tokio::test]
async fn unparseable_output_falls_back_to_canned_options() {
    let llm = ScriptedModel::new(vec![
        Ok("An opening passage with choices 1. a 2. b".into()),
        Ok("The rain keeps falling, and nobody offers a single path forward.".into()),
    ]);
    let engine = engine_with(llm, Arc::new(FakeVectorStore::default()));

    engine.create("s1", StorySettings::default()).await.unwrap();
    let response = engine.advance("s1", "wait").await.unwrap();
    let texts: Vec<_> = response.options.iter().map(|o| o.text.as_str()).collect();
    assert_eq!(texts, vec!["Continue", "Observe", "Ask the NPC"]);
}

#[tokio::test]
async fn choosing_persists_a_decision_memory() {
    let llm = ScriptedModel::new(vec![
        Ok("Opening. 1. Fight 2. Flee".into()),
        Ok("Steel rings in the courtyard. 1. Press 2. Yield".into()),
    ]);
    let store = Arc::new(FakeVectorStore::default());
    let engine = engine_with(llm, store.clone());

    engine.create("s1", StorySettings::default()).await.unwrap();
    let response = engine.choose("s1", "1", "Fight").await.unwrap();
    assert_eq!(response.options.len(), 2);

    wait_for("decision memory", || {
        store.stored().iter().any(|p| {
            p.payload.get("type").and_then(Value::as_str) == Some("decision")
                && p.payload.get("option_id").and_then(Value::as_str) == Some("1")
                && p.payload.get("choice_text").and_then(Value::as_str) == Some("Fight")
        })
    })
    .await;
}

#[tokio::test]
async fn retrieval_failure_degrades_to_empty_context() {
    let llm = ScriptedModel::new(vec![
        Ok("Opening. 1. a 2. b".into()),
        Ok("Still fine. 1. c 2. d".into()),
    ]);
    let engine = engine_with(llm, Arc::new(FakeVectorStore::failing()));

    engine.create("s1", StorySettings::default()).await.unwrap();
    let response = engine.advance("s1", "look around").await.unwrap();
    assert!(response.related_memories.is_empty());
    assert_eq!(response.options.len(), 2);
}

#[tokio::test]
async fn model_failure_surfaces_and_failed_create_rolls_back() {
    let llm = ScriptedModel::new(vec![Err(Error::Upstream("model offline".into()))]);
    let engine = engine_with(llm, Arc::new(FakeVectorStore::default()));

    let err = engine.create("s1", StorySettings::default()).await.unwrap_err();
    assert!(matches!(err, Error::Upstream(_)));
    assert!(engine.active_stories().is_empty());
    assert!(matches!(
        engine.state("s1").await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn duplicate_create_conflicts_and_end_removes() {
    let llm = ScriptedModel::new(vec![
        Ok("Opening. 1. a 2. b".into()),
        Ok("unused".into()),
    ]);
    let engine = engine_with(llm, Arc::new(FakeVectorStore::default()));

    engine.create("s1", StorySettings::default()).await.unwrap();
    assert!(matches!(
        engine.create("s1", StorySettings::default()).await.unwrap_err(),
        Error::Conflict(_)
    ));

    engine.end("s1", false).await.unwrap();
    assert!(engine.active_stories().is_empty());
    assert!(matches!(
        engine.end("s1", false).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn operations_on_one_story_serialize() {
    let llm = ScriptedModel::with_delays(vec![
        (Duration::ZERO, Ok("Opening. 1. a 2. b".into())),
        (
            Duration::from_millis(120),
            Ok("First finishes late. 1. a 2. b".into()),
        ),
        (
            Duration::from_millis(5),
            Ok("Second runs after. 1. c 2. d".into()),
        ),
    ]);
    let engine = Arc::new(engine_with(llm, Arc::new(FakeVectorStore::default())));
    engine.create("s1", StorySettings::default()).await.unwrap();

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.advance("s1", "first").await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let fast = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.advance("s1", "second").await.unwrap() })
    };

    let (slow, fast) = (slow.await.unwrap(), fast.await.unwrap());
    assert!(slow.text.starts_with("First finishes late"));
    assert!(fast.text.starts_with("Second runs after"));

    // The second request observed the state only after the first
    // completed, so the final state is the second response.
    let state = engine.state("s1").await.unwrap();
    assert_eq!(state.previous_text, fast.text);
}

#[tokio::test]
async fn state_returns_an_isolated_copy() {
    let llm = ScriptedModel::new(vec![Ok("Opening. 1. a 2. b".into())]);
    let engine = engine_with(llm, Arc::new(FakeVectorStore::default()));
    engine.create("s1", StorySettings::default()).await.unwrap();

    let mut copy = engine.state("s1").await.unwrap();
    copy.previous_text = "tampered".into();
    copy.options.clear();

    let fresh = engine.state("s1").await.unwrap();
    assert_ne!(fresh.previous_text, "tampered");
    assert_eq!(fresh.options.len(), 2);
}

#[tokio::test]
async fn related_memories_feed_back_into_responses() {
    let llm = ScriptedModel::new(vec![
        Ok("Opening. 1. a 2. b".into()),
        Ok("One. 1. a 2. b".into()),
        Ok("Two. 1. a 2. b".into()),
    ]);
    let store = Arc::new(FakeVectorStore::default());
    let engine = engine_with(llm, store.clone());

    engine.create("s1", StorySettings::default()).await.unwrap();
    engine.advance("s1", "drink the tea").await.unwrap();
    wait_for("stored action", || !store.stored().is_empty()).await;

    // An action similar to the stored one should surface it.
    let response = engine.advance("s1", "drink the tea").await.unwrap();
    assert!(response
        .related_memories
        .iter()
        .any(|m| m.kind == MemoryKind::PlayerAction && m.content == "drink the tea"));
}
