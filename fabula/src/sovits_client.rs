//! GPT-SoVITS speech back-end client.
//!
//! `POST /tts` answers either with a JSON envelope carrying base64
//! audio or with raw audio bytes and an `audio/*` content type; both
//! shapes are accepted.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::asset_cache;
use crate::work_queue::{ProducedAsset, Producer};
use crate::{Error, Result};

pub const DEFAULT_SOVITS_URL: &str = "http://localhost:9880";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Options describing one speech synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct TtsOptions {
    pub text: String,
    #[serde(default)]
    pub voice_id: String,
    pub speed: f64,
    #[serde(default)]
    pub tone: String,
    pub language: String,
}

impl Default for TtsOptions {
    fn default() -> Self {
        Self {
            text: String::new(),
            voice_id: String::new(),
            speed: 1.0,
            tone: String::new(),
            language: "zh".into(),
        }
    }
}

/// Content hash over the semantically relevant synthesis options.
pub fn audio_fingerprint(opts: &TtsOptions) -> String {
    asset_cache::fingerprint(&format!(
        "{}|{}|{}|{}",
        opts.text, opts.voice_id, opts.speed, opts.tone
    ))
}

fn blank(s: &&str) -> bool {
    s.is_empty()
}

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "blank")]
    reference_audio: &'a str,
    #[serde(skip_serializing_if = "blank")]
    language: &'a str,
    speed: f64,
    #[serde(skip_serializing_if = "blank")]
    tone: &'a str,
}

#[derive(Debug, Deserialize)]
struct TtsJsonResponse {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    audio_data: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    sample_rate: Option<u32>,
}

/// Synthesized audio.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: String,
    pub duration_secs: Option<f64>,
    pub sample_rate: Option<u32>,
}

/// Sniff the container format from the first bytes.
pub fn audio_format_of(data: &[u8]) -> &'static str {
    if data.len() >= 4 && &data[0..4] == b"RIFF" {
        return "wav";
    }
    if data.len() >= 3 && data[0] == 0xFF && data[1] == 0xFB && data[2] == 0x90 {
        return "mp3";
    }
    "unknown"
}

/// HTTP client for a GPT-SoVITS instance.
pub struct SovitsClient {
    http: reqwest::Client,
    base_url: String,
}

impl SovitsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }

    /// Synthesize speech for `opts.text`.
    pub async fn synthesize(&self, opts: &TtsOptions) -> Result<SynthesizedAudio> {
        if opts.text.is_empty() {
            return Err(Error::BadRequest("text cannot be empty".into()));
        }
        let body = TtsRequest {
            text: &opts.text,
            reference_audio: &opts.voice_id,
            language: &opts.language,
            speed: if opts.speed > 0.0 { opts.speed } else { 1.0 },
            tone: &opts.tone,
        };
        let resp = self
            .http
            .post(format!("{}/tts", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let data = resp.bytes().await?.to_vec();

        if status.is_success() {
            if let Ok(parsed) = serde_json::from_slice::<TtsJsonResponse>(&data) {
                if !parsed.success {
                    return Err(Error::Upstream(format!("tts failed: {}", parsed.message)));
                }
                if !parsed.audio_data.is_empty() {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(parsed.audio_data.as_bytes())
                        .map_err(|e| Error::Protocol(format!("bad base64 audio: {e}")))?;
                    let format = audio_format_of(&bytes).to_string();
                    return Ok(SynthesizedAudio {
                        bytes,
                        format,
                        duration_secs: parsed.duration,
                        sample_rate: parsed.sample_rate,
                    });
                }
            }
            let format = audio_format_of(&data).to_string();
            return Ok(SynthesizedAudio {
                bytes: data,
                format,
                duration_secs: None,
                sample_rate: None,
            });
        }

        if content_type.starts_with("audio/") {
            let format = audio_format_of(&data).to_string();
            return Ok(SynthesizedAudio {
                bytes: data,
                format,
                duration_secs: None,
                sample_rate: None,
            });
        }

        Err(Error::Upstream(format!(
            "tts backend returned {status} with content-type {content_type}"
        )))
    }

    /// Voice models advertised by the back-end.
    pub async fn voices(&self) -> Result<Vec<VoiceModel>> {
        let resp = self
            .http
            .get(format!("{}/voices", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Unavailable(format!(
                "voice listing returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    pub async fn health_check(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Unavailable(format!(
                "tts backend returned {}",
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl Producer for SovitsClient {
    type Options = TtsOptions;

    fn fingerprint(opts: &TtsOptions) -> String {
        audio_fingerprint(opts)
    }

    fn source_text(opts: &TtsOptions) -> String {
        opts.text.clone()
    }

    async fn produce(&self, opts: &TtsOptions) -> Result<ProducedAsset> {
        let audio = self.synthesize(opts).await?;
        let format = if audio.format == "unknown" {
            "wav".to_string()
        } else {
            audio.format
        };
        Ok(ProducedAsset {
            bytes: audio.bytes,
            format,
            duration_secs: audio.duration_secs,
        })
    }
}

/// A selectable narrator voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// In-process registry of the voices the narrator can use.
pub struct VoiceRegistry {
    voices: RwLock<HashMap<String, VoiceModel>>,
}

impl VoiceRegistry {
    /// Registry seeded with the built-in storytelling voices.
    pub fn new() -> Self {
        let registry = Self {
            voices: RwLock::new(HashMap::new()),
        };
        for voice in builtin_voices() {
            registry.add(voice);
        }
        registry
    }

    pub fn add(&self, voice: VoiceModel) {
        self.voices.write().unwrap().insert(voice.id.clone(), voice);
    }

    pub fn get(&self, id: &str) -> Result<VoiceModel> {
        self.voices
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("voice {id}")))
    }

    pub fn list(&self) -> Vec<VoiceModel> {
        let mut voices: Vec<_> = self.voices.read().unwrap().values().cloned().collect();
        voices.sort_by(|a, b| a.id.cmp(&b.id));
        voices
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut voices = self.voices.write().unwrap();
        let voice = voices
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("voice {id}")))?;
        voice.enabled = enabled;
        Ok(())
    }

    pub fn default_voice(&self) -> Result<VoiceModel> {
        self.get("narrator")
    }
}

impl Default for VoiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_voices() -> Vec<VoiceModel> {
    vec![
        VoiceModel {
            id: "narrator".into(),
            name: "Storyteller".into(),
            gender: "male".into(),
            language: "zh".into(),
            style: "classic".into(),
            description: "Traditional storyteller timbre, suited to wuxia tales".into(),
            enabled: true,
        },
        VoiceModel {
            id: "male_youth".into(),
            name: "Young man".into(),
            gender: "male".into(),
            language: "zh".into(),
            style: "modern".into(),
            description: "A contemporary young male voice".into(),
            enabled: true,
        },
        VoiceModel {
            id: "female".into(),
            name: "Female voice".into(),
            gender: "female".into(),
            language: "zh".into(),
            style: "soft".into(),
            description: "A soft female voice".into(),
            enabled: true,
        },
    ]
}
