//! Core orchestration fabric for a danmaku-driven interactive story
//! server.
//!
//! The crate ties four subsystems together: a binary live-platform
//! adapter emitting normalized chat messages, a fan-out hub for
//! front-end sessions, a RAG-augmented story state machine, and a
//! content-addressed asset cache with a coalescing work queue over
//! external image and speech back-ends.
//!
//! Everything here is transport-agnostic: the `fabulad` daemon wires
//! these pieces behind its HTTP and WebSocket surface.

pub mod asset_cache;
pub mod bilibili;
pub mod comfy_client;
pub mod command;
pub mod dedup;
pub mod douyin;
pub mod embedding;
mod error;
pub mod hub;
pub mod live;
pub mod llm;
pub mod lora;
pub mod memory;
pub mod packet;
pub mod process_manager;
pub mod qdrant_store;
pub mod recent_log;
pub mod retry;
pub mod session_store;
pub mod shutdown;
pub mod sovits_client;
pub mod story;
pub mod story_engine;
pub mod template;
pub mod work_queue;

pub use asset_cache::{fingerprint, AssetCache, CacheEntry, CacheStats};
pub use bilibili::BilibiliAdapter;
pub use comfy_client::{image_fingerprint, ComfyClient, ImageOptions};
pub use command::{DanmakuParser, ParsedCommand};
pub use dedup::DedupFilter;
pub use douyin::DouyinAdapter;
pub use embedding::{cosine_similarity, normalize, EmbeddingService, DEFAULT_DIMENSION};
pub use error::{Error, Result};
pub use hub::{spawn_dispatcher, Hub, HubSender, HubStats, SubscriberId};
pub use live::{adapter_for, ConnectOptions, Danmaku, LiveAdapter, Platform, SessionState};
pub use llm::{ChatMessage, ChatRequest, ChatResponse, GlmClient, LanguageModel};
pub use lora::{LoraModel, LoraRegistry};
pub use memory::{
    context_summary, memory_id, DecisionMemory, Memory, MemoryKind, MemoryStore,
};
pub use process_manager::{InferenceProcess, ProcessConfig, ProcessStatus};
pub use qdrant_store::{
    Condition, Filter, PointRecord, QdrantStore, ScoredPoint, SearchOptions, VectorStore,
};
pub use recent_log::RecentMessages;
pub use retry::RetryPolicy;
pub use session_store::{DecisionRecord, SessionStore};
pub use shutdown::{shutdown_signal, Shutdown};
pub use sovits_client::{
    audio_fingerprint, audio_format_of, SovitsClient, TtsOptions, VoiceModel, VoiceRegistry,
};
pub use story::{StoryOption, StoryResponse, StorySettings, StoryState};
pub use story_engine::StoryEngine;
pub use template::{render_str, story_context, Template, TemplateEngine, TemplateVars};
pub use work_queue::{
    AssetGenerator, GenQueue, GeneratedAsset, ProducedAsset, Producer, WorkOutcome,
    DEFAULT_WORKERS,
};
