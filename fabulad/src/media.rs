//! Scene art and narration for story updates.
//!
//! After a story step, the visual prompt goes to the image back-end
//! and the passage text to the speech back-end, both through the
//! cached, coalescing generators. Results are pushed to subscribers as
//! `scene_image` and `narration` frames; failures only log.

use std::sync::Arc;

use base64::Engine;
use fabula::{
    AssetGenerator, ComfyClient, Hub, ImageOptions, SovitsClient, StoryResponse, TtsOptions,
};
use serde_json::json;

/// Fans story media out to the hub as it becomes available.
pub struct MediaPipeline {
    hub: Arc<Hub>,
    images: Arc<AssetGenerator<ComfyClient>>,
    audio: Arc<AssetGenerator<SovitsClient>>,
    image_model: String,
    voice_id: String,
}

impl MediaPipeline {
    pub fn new(
        hub: Arc<Hub>,
        images: Arc<AssetGenerator<ComfyClient>>,
        audio: Arc<AssetGenerator<SovitsClient>>,
        image_model: impl Into<String>,
        voice_id: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            images,
            audio,
            image_model: image_model.into(),
            voice_id: voice_id.into(),
        }
    }

    /// Kick off image and narration generation for one story step.
    /// Returns immediately; results arrive as broadcast frames.
    pub fn spawn_for_response(&self, story_id: &str, response: &StoryResponse) {
        if !response.visual_prompt.is_empty() {
            let images = self.images.clone();
            let hub = self.hub.clone();
            let story_id = story_id.to_string();
            let options = ImageOptions {
                prompt: response.visual_prompt.clone(),
                model: self.image_model.clone(),
                ..Default::default()
            };
            tokio::spawn(async move {
                match images.generate(options).await {
                    Ok(asset) => {
                        hub.broadcast(
                            "scene_image",
                            &json!({
                                "story_id": story_id,
                                "fingerprint": asset.fingerprint,
                                "format": asset.format,
                                "cached": asset.cached,
                                "image": base64::engine::general_purpose::STANDARD
                                    .encode(&asset.bytes),
                            }),
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "scene image generation failed"),
                }
            });
        }

        if !response.text.is_empty() {
            let audio = self.audio.clone();
            let hub = self.hub.clone();
            let story_id = story_id.to_string();
            let options = TtsOptions {
                text: response.text.clone(),
                voice_id: self.voice_id.clone(),
                ..Default::default()
            };
            tokio::spawn(async move {
                match audio.generate(options).await {
                    Ok(asset) => {
                        hub.broadcast(
                            "narration",
                            &json!({
                                "story_id": story_id,
                                "fingerprint": asset.fingerprint,
                                "format": asset.format,
                                "cached": asset.cached,
                                "duration_secs": asset.duration_secs,
                                "audio": base64::engine::general_purpose::STANDARD
                                    .encode(&asset.bytes),
                            }),
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "narration generation failed"),
                }
            });
        }
    }
}
