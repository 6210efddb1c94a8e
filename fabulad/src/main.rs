use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fabula::{
    asset_cache::spawn_sweeper, process_manager::spawn_watchdog, shutdown_signal, AssetCache,
    AssetGenerator, ComfyClient, DedupFilter, EmbeddingService, GenQueue, GlmClient, Hub,
    InferenceProcess, LanguageModel, LoraRegistry, MemoryStore, ProcessConfig, QdrantStore,
    RecentMessages, SessionStore, Shutdown, SovitsClient, StoryEngine, TemplateEngine,
};
use fabula::VoiceRegistry;
use fabulad::live_service::LiveService;
use fabulad::media::MediaPipeline;
use fabulad::{args::Args, logger, server, AppState};

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let args = Args::parse().apply_env_overrides();
    if args.glm_api_key.is_empty() {
        tracing::warn!("no provider api key configured; story generation will fail");
    }

    let shutdown = Shutdown::new();

    let llm: Arc<dyn LanguageModel> = Arc::new(
        GlmClient::new(args.glm_base_url.as_str(), args.glm_api_key.as_str())
            .with_chat_model(args.glm_model.as_str())
            .with_embedding_model(args.embedding_model.as_str()),
    );
    let embedding = Arc::new(EmbeddingService::new(llm.clone(), args.embedding_dimension));

    let qdrant = Arc::new(QdrantStore::new(
        args.qdrant_url.as_str(),
        (!args.qdrant_api_key.is_empty()).then(|| args.qdrant_api_key.clone()),
    ));
    if let Err(e) = qdrant
        .ensure_default_collections(args.embedding_dimension)
        .await
    {
        tracing::warn!(error = %e, "vector store collections unavailable at start-up");
    }
    let memories = Arc::new(MemoryStore::new(embedding.clone(), qdrant.clone()));

    let sessions = Arc::new(SessionStore::new(format!("{}/sessions", args.data_dir)));
    let engine = Arc::new(
        StoryEngine::new(llm.clone(), memories.clone(), Arc::new(TemplateEngine::new()))
            .with_session_store(sessions),
    );

    let hub = Arc::new(Hub::new(args.subscriber_queue));
    let recent = Arc::new(RecentMessages::new());

    let cache_ttl = chrono::Duration::hours(args.cache_ttl_hours);
    let image_cache = Arc::new(AssetCache::new(
        format!("{}/image_cache", args.data_dir),
        args.cache_max_entries,
        cache_ttl,
    ));
    match image_cache.initialize() {
        Ok(count) => tracing::info!(count, "image cache loaded"),
        Err(e) => tracing::warn!(error = %e, "image cache unavailable"),
    }
    spawn_sweeper(image_cache.clone(), SWEEP_INTERVAL, shutdown.subscribe());

    let audio_cache = Arc::new(AssetCache::new(
        format!("{}/audio_cache", args.data_dir),
        args.cache_max_entries,
        cache_ttl,
    ));
    match audio_cache.initialize() {
        Ok(count) => tracing::info!(count, "audio cache loaded"),
        Err(e) => tracing::warn!(error = %e, "audio cache unavailable"),
    }
    spawn_sweeper(audio_cache.clone(), SWEEP_INTERVAL, shutdown.subscribe());

    let loras = Arc::new(LoraRegistry::new(format!("{}/lora_models", args.data_dir)));
    match loras.load() {
        Ok(count) => tracing::info!(count, "lora adapters loaded"),
        Err(e) => tracing::warn!(error = %e, "lora directory unavailable"),
    }
    let voices = Arc::new(VoiceRegistry::new());

    let comfy = Arc::new(ComfyClient::new(args.comfyui_url.as_str()));
    let images = Arc::new(AssetGenerator::new(
        GenQueue::start(comfy, args.queue_workers, args.queue_capacity),
        image_cache,
    ));
    let sovits = Arc::new(SovitsClient::new(args.sovits_url.as_str()));
    let audio = Arc::new(AssetGenerator::new(
        GenQueue::start(sovits, args.queue_workers, args.queue_capacity),
        audio_cache,
    ));

    let supervisor = if !args.comfyui_python.is_empty() && !args.comfyui_dir.is_empty() {
        let process = Arc::new(InferenceProcess::new(ProcessConfig::new(
            &args.comfyui_python,
            &args.comfyui_dir,
            8188,
        )));
        spawn_watchdog(process.clone(), WATCHDOG_INTERVAL, shutdown.subscribe());
        if let Err(e) = process.start().await {
            tracing::warn!(error = %e, "co-located image tool did not start");
        }
        Some(process)
    } else {
        None
    };

    let media = args.auto_media.then(|| {
        Arc::new(MediaPipeline::new(
            hub.clone(),
            images.clone(),
            audio.clone(),
            args.image_model.clone(),
            args.narration_voice.clone(),
        ))
    });

    let dedup = DedupFilter::new(
        chrono::Duration::seconds(args.dedup_window_secs),
        args.banned_words.clone(),
    );
    let mut live = LiveService::new(
        hub.clone(),
        recent.clone(),
        engine.clone(),
        dedup,
        args.live_story_id.clone(),
    );
    if let Some(media) = &media {
        live = live.with_media(media.clone());
    }
    let live = Arc::new(live);

    let state = AppState {
        hub,
        live: live.clone(),
        engine,
        recent,
        images,
        audio,
        media,
        voices,
        loras,
        supervisor: supervisor.clone(),
        default_image_model: args.image_model.clone(),
    };
    let app = server::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    shutdown.trigger();
    if let Err(e) = live.disconnect().await {
        tracing::warn!(error = %e, "live session teardown failed");
    }
    if let Some(process) = supervisor {
        if let Err(e) = process.stop().await {
            tracing::warn!(error = %e, "supervised process teardown failed");
        }
    }
    Ok(())
}
