//! HTTP surface: router, handlers and the error-to-status mapping.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use fabula::{
    ComfyClient, Error, Hub, ImageOptions, InferenceProcess, LoraRegistry, RecentMessages,
    SovitsClient, StoryEngine, StorySettings, TtsOptions, VoiceRegistry,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::live_service::LiveService;
use crate::media::MediaPipeline;
use crate::ws::subscriber_session;

/// Shared handler context.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub live: Arc<LiveService>,
    pub engine: Arc<StoryEngine>,
    pub recent: Arc<RecentMessages>,
    pub images: Arc<fabula::AssetGenerator<ComfyClient>>,
    pub audio: Arc<fabula::AssetGenerator<SovitsClient>>,
    pub media: Option<Arc<MediaPipeline>>,
    pub voices: Arc<VoiceRegistry>,
    pub loras: Arc<LoraRegistry>,
    pub supervisor: Option<Arc<InferenceProcess>>,
    pub default_image_model: String,
}

/// Error wrapper carrying the HTTP mapping.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::CacheMiss(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Unavailable(_) | Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream(_) | Error::Protocol(_) | Error::Io(_) | Error::Http(_)
            | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({"success": false, "error": self.0.to_string()}));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the public router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/live/connect", post(live_connect))
        .route("/api/v1/live/disconnect", post(live_disconnect))
        .route("/api/v1/live/status", get(live_status))
        .route("/api/v1/live/danmaku", get(danmaku_ws))
        .route("/api/v1/live/recent", get(live_recent))
        .route("/api/v1/story", get(story_list))
        .route("/api/v1/story/create", post(story_create))
        .route("/api/v1/story/continue", post(story_continue))
        .route("/api/v1/story/select", post(story_select))
        .route("/api/v1/story/:id", get(story_get))
        .route("/api/v1/image/generate", post(image_generate))
        .route("/api/v1/image/loras", get(lora_list))
        .route("/api/v1/audio/generate", post(audio_generate))
        .route("/api/v1/audio/voices", get(voice_list))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let inference = state
        .supervisor
        .as_ref()
        .map(|s| format!("{:?}", s.status()).to_lowercase());
    Json(json!({
        "status": "ok",
        "subscribers": state.hub.count(),
        "inference": inference,
    }))
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    platform: String,
    room_id: String,
    #[serde(default)]
    cookie: String,
}

#[derive(Debug, Serialize)]
struct ConnectResponse {
    success: bool,
    platform: String,
    room_id: String,
    connected: bool,
}

async fn live_connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<Json<ConnectResponse>> {
    state
        .live
        .connect(&req.platform, &req.room_id, &req.cookie)
        .await?;
    Ok(Json(ConnectResponse {
        success: true,
        platform: req.platform,
        room_id: req.room_id,
        connected: true,
    }))
}

async fn live_disconnect(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state.live.disconnect().await?;
    Ok(Json(json!({"success": true, "connected": false})))
}

async fn live_status(State(state): State<AppState>) -> Json<crate::live_service::LiveStatus> {
    Json(state.live.status().await)
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    #[serde(default)]
    limit: usize,
}

async fn live_recent(
    State(state): State<AppState>,
    query: Option<axum::extract::Query<RecentQuery>>,
) -> Json<serde_json::Value> {
    let limit = query.map(|q| q.limit).unwrap_or(0);
    let messages = state.recent.recent(limit);
    Json(json!({"success": true, "count": messages.len(), "messages": messages}))
}

async fn danmaku_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| subscriber_session(socket, hub))
}

#[derive(Debug, Deserialize)]
struct CreateStoryRequest {
    #[serde(default)]
    story_id: String,
    #[serde(default)]
    protagonist: String,
    #[serde(default)]
    genre: String,
    #[serde(default)]
    tone: String,
    #[serde(default)]
    style: String,
}

async fn story_create(
    State(state): State<AppState>,
    Json(req): Json<CreateStoryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let story_id = if req.story_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        req.story_id
    };
    let settings = StorySettings {
        protagonist: req.protagonist,
        genre: req.genre,
        tone: req.tone,
        style: req.style,
    };
    let story = state.engine.create(&story_id, settings).await?;
    state.hub.broadcast("story_created", &json!({"story_id": story_id}));
    Ok(Json(json!({"success": true, "story_id": story_id, "state": story})))
}

#[derive(Debug, Deserialize)]
struct ContinueRequest {
    story_id: String,
    action: String,
}

async fn story_continue(
    State(state): State<AppState>,
    Json(req): Json<ContinueRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.story_id.is_empty() {
        return Err(Error::BadRequest("story_id is required".into()).into());
    }
    let response = state.engine.advance(&req.story_id, &req.action).await?;
    state.hub.broadcast("story", &response);
    if let Some(media) = &state.media {
        media.spawn_for_response(&req.story_id, &response);
    }
    Ok(Json(json!({"success": true, "response": response})))
}

#[derive(Debug, Deserialize)]
struct SelectRequest {
    story_id: String,
    option_id: String,
    #[serde(default)]
    choice_text: String,
}

async fn story_select(
    State(state): State<AppState>,
    Json(req): Json<SelectRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.story_id.is_empty() || req.option_id.is_empty() {
        return Err(Error::BadRequest("story_id and option_id are required".into()).into());
    }
    let response = state
        .engine
        .choose(&req.story_id, &req.option_id, &req.choice_text)
        .await?;
    state.hub.broadcast("story", &response);
    if let Some(media) = &state.media {
        media.spawn_for_response(&req.story_id, &response);
    }
    Ok(Json(json!({"success": true, "response": response})))
}

async fn story_list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stories = state.engine.active_stories();
    Json(json!({"success": true, "count": stories.len(), "stories": stories}))
}

async fn story_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let story = state.engine.state(&id).await?;
    Ok(Json(json!({"success": true, "story_id": id, "state": story})))
}

#[derive(Debug, Deserialize)]
struct ImageRequest {
    prompt: String,
    #[serde(default)]
    negative_prompt: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    steps: Option<u32>,
    #[serde(default)]
    cfg_scale: Option<f64>,
    #[serde(default)]
    seed: Option<i64>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    lora: String,
    #[serde(default)]
    lora_strength: Option<f64>,
}

async fn image_generate(
    State(state): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.prompt.is_empty() {
        return Err(Error::BadRequest("prompt is required".into()).into());
    }
    let defaults = ImageOptions::default();
    let options = ImageOptions {
        prompt: req.prompt,
        negative_prompt: req.negative_prompt,
        width: req.width.unwrap_or(defaults.width),
        height: req.height.unwrap_or(defaults.height),
        steps: req.steps.unwrap_or(defaults.steps),
        cfg_scale: req.cfg_scale.unwrap_or(defaults.cfg_scale),
        seed: req.seed.unwrap_or(defaults.seed),
        model: if req.model.is_empty() {
            state.default_image_model.clone()
        } else {
            req.model
        },
        lora: req.lora,
        lora_strength: req.lora_strength.unwrap_or(defaults.lora_strength),
        ..defaults
    };
    let asset = state.images.generate(options).await?;
    Ok(Json(json!({
        "success": true,
        "fingerprint": asset.fingerprint,
        "image": base64::engine::general_purpose::STANDARD.encode(&asset.bytes),
        "format": asset.format,
        "cached": asset.cached,
        "elapsed_ms": asset.elapsed.as_millis() as u64,
    })))
}

async fn lora_list(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"success": true, "loras": state.loras.list()}))
}

async fn voice_list(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"success": true, "voices": state.voices.list()}))
}

#[derive(Debug, Deserialize)]
struct AudioRequest {
    text: String,
    #[serde(default)]
    voice_id: String,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    tone: String,
    #[serde(default)]
    language: String,
}

async fn audio_generate(
    State(state): State<AppState>,
    Json(req): Json<AudioRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.text.is_empty() {
        return Err(Error::BadRequest("text is required".into()).into());
    }
    let defaults = TtsOptions::default();
    let options = TtsOptions {
        text: req.text,
        voice_id: req.voice_id,
        speed: req.speed.unwrap_or(defaults.speed),
        tone: req.tone,
        language: if req.language.is_empty() {
            defaults.language
        } else {
            req.language
        },
    };
    let asset = state.audio.generate(options).await?;
    Ok(Json(json!({
        "success": true,
        "fingerprint": asset.fingerprint,
        "audio": base64::engine::general_purpose::STANDARD.encode(&asset.bytes),
        "format": asset.format,
        "duration_secs": asset.duration_secs,
        "cached": asset.cached,
        "elapsed_ms": asset.elapsed.as_millis() as u64,
    })))
}
