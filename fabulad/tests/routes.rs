//! Router-level tests against stub back-ends.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fabula::{
    AssetCache, AssetGenerator, ComfyClient, DedupFilter, EmbeddingService, GenQueue, GlmClient,
    Hub, LanguageModel, LoraRegistry, MemoryStore, QdrantStore, RecentMessages, SovitsClient,
    StoryEngine, TemplateEngine, VoiceRegistry,
};
use fabulad::live_service::LiveService;
use fabulad::{router, AppState};
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_state(dir: &std::path::Path) -> AppState {
    // Back-ends point at closed ports; the routes under test never
    // reach them.
    let llm: Arc<dyn LanguageModel> = Arc::new(GlmClient::new("http://127.0.0.1:1", "key"));
    let embedding = Arc::new(EmbeddingService::new(llm.clone(), 8));
    let qdrant = Arc::new(QdrantStore::new("http://127.0.0.1:1", None));
    let memories = Arc::new(MemoryStore::new(embedding, qdrant));
    let engine = Arc::new(StoryEngine::new(
        llm,
        memories,
        Arc::new(TemplateEngine::new()),
    ));
    let hub = Arc::new(Hub::new(8));
    let recent = Arc::new(RecentMessages::new());
    let live = Arc::new(LiveService::new(
        hub.clone(),
        recent.clone(),
        engine.clone(),
        DedupFilter::default(),
        "live",
    ));

    let image_cache = Arc::new(AssetCache::new(
        dir.join("image_cache"),
        10,
        chrono::Duration::hours(1),
    ));
    let audio_cache = Arc::new(AssetCache::new(
        dir.join("audio_cache"),
        10,
        chrono::Duration::hours(1),
    ));
    let images = Arc::new(AssetGenerator::new(
        GenQueue::start(Arc::new(ComfyClient::new("http://127.0.0.1:1")), 1, 4),
        image_cache,
    ));
    let audio = Arc::new(AssetGenerator::new(
        GenQueue::start(Arc::new(SovitsClient::new("http://127.0.0.1:1")), 1, 4),
        audio_cache,
    ));

    AppState {
        hub,
        live,
        engine,
        recent,
        images,
        audio,
        media: None,
        voices: Arc::new(VoiceRegistry::new()),
        loras: Arc::new(LoraRegistry::new(dir.join("lora_models"))),
        supervisor: None,
        default_image_model: "sdxl.safetensors".into(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_story_maps_to_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));
    let response = app
        .oneshot(
            Request::get("/api/v1/story/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn blank_story_id_maps_to_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));
    let request = Request::post("/api/v1/story/continue")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"story_id": "", "action": "go"}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsupported_platform_maps_to_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));
    let request = Request::post("/api/v1/live/connect")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"platform": "twitch", "room_id": "1"}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn status_starts_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));
    let response = app
        .oneshot(
            Request::get("/api/v1/live/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["connected"], false);
    assert_eq!(body["client_count"], 0);
}

#[tokio::test]
async fn voices_and_stories_list() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/v1/audio/voices")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["voices"].as_array().unwrap().len(), 3);

    let response = app
        .oneshot(Request::get("/api/v1/story").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn websocket_subscribers_receive_broadcast_frames() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let hub = state.hub.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let url = format!("ws://{addr}/api/v1/live/danmaku");
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    // Registration is asynchronous to the upgrade; wait for it.
    for _ in 0..100 {
        if hub.count() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(hub.count(), 1);

    hub.broadcast("danmaku", &json!({"content": "hi", "username": "alice"}));
    let frame = loop {
        match socket.next().await.expect("frame").expect("ws ok") {
            tokio_tungstenite::tungstenite::Message::Text(text) => break text,
            _ => continue,
        }
    };
    let value: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["type"], "danmaku");
    assert_eq!(value["data"]["content"], "hi");

    drop(socket);
    for _ in 0..100 {
        if hub.count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(hub.count(), 0);
}
