//! ComfyUI image back-end client.
//!
//! Image generation is a three-step HTTP dance: `POST /prompt` with a
//! workflow graph, poll `GET /history` until the prompt id shows an
//! output image, then fetch the bytes from `GET /view`. The workflow
//! graph is a map from integer node id to `{class_type, inputs}`,
//! where inputs reference other nodes' outputs as `[node_id, slot]`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::asset_cache;
use crate::work_queue::{ProducedAsset, Producer};
use crate::{Error, Result};

pub const DEFAULT_COMFY_URL: &str = "http://localhost:8188";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_ATTEMPTS: usize = 300;

/// Options describing one image generation.
#[derive(Debug, Clone, Serialize)]
pub struct ImageOptions {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    /// Zero picks a random seed at build time.
    pub seed: i64,
    pub model: String,
    #[serde(default)]
    pub lora: String,
    #[serde(default)]
    pub lora_strength: f64,
    pub sampler_name: String,
    pub scheduler: String,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 1024,
            height: 1024,
            steps: 8,
            cfg_scale: 7.0,
            seed: 0,
            model: String::new(),
            lora: String::new(),
            lora_strength: 0.8,
            sampler_name: "euler".into(),
            scheduler: "normal".into(),
        }
    }
}

/// Content hash over the semantically relevant image options.
pub fn image_fingerprint(opts: &ImageOptions) -> String {
    asset_cache::fingerprint(&format!(
        "{}|{}x{}|{}|{}|{}|{}|{}",
        opts.prompt,
        opts.width,
        opts.height,
        opts.steps,
        opts.cfg_scale,
        opts.model,
        opts.lora,
        opts.lora_strength,
    ))
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowNode {
    pub class_type: String,
    pub inputs: Map<String, Value>,
}

/// Workflow graph keyed by node id; serializes with string keys as the
/// back-end expects.
pub type Workflow = BTreeMap<u32, WorkflowNode>;

fn node(class_type: &str, inputs: Value) -> WorkflowNode {
    WorkflowNode {
        class_type: class_type.to_string(),
        inputs: inputs.as_object().cloned().unwrap_or_default(),
    }
}

/// Build the SDXL text-to-image graph, splicing a LoRA loader between
/// the checkpoint and its consumers when one is requested.
pub fn build_workflow(opts: &ImageOptions) -> Workflow {
    let seed = if opts.seed == 0 {
        rand::thread_rng().gen_range(1..i64::MAX)
    } else {
        opts.seed
    };

    let mut workflow = Workflow::new();
    workflow.insert(4, node("CheckpointLoaderSimple", json!({"ckpt_name": opts.model})));
    workflow.insert(1, node("VAELoader", json!({"vae_name": opts.model})));
    workflow.insert(
        5,
        node(
            "EmptyLatentImage",
            json!({"width": opts.width, "height": opts.height, "batch_size": 1}),
        ),
    );
    workflow.insert(
        6,
        node("CLIPTextEncode", json!({"text": opts.prompt, "clip": [4, 1]})),
    );
    workflow.insert(
        7,
        node(
            "CLIPTextEncode",
            json!({"text": opts.negative_prompt, "clip": [4, 1]}),
        ),
    );
    workflow.insert(
        3,
        node(
            "KSampler",
            json!({
                "seed": seed,
                "steps": opts.steps,
                "cfg": opts.cfg_scale,
                "sampler_name": opts.sampler_name,
                "scheduler": opts.scheduler,
                "denoise": 1,
                "model": [4, 0],
                "positive": [6, 0],
                "negative": [7, 0],
                "latent_image": [5, 0],
            }),
        ),
    );
    workflow.insert(
        8,
        node("VAEDecode", json!({"samples": [3, 0], "vae": [1, 0]})),
    );
    workflow.insert(
        9,
        node(
            "SaveImage",
            json!({"images": [8, 0], "filename_prefix": filename_prefix()}),
        ),
    );

    if !opts.lora.is_empty() {
        workflow.insert(
            10,
            node(
                "LoraLoader",
                json!({
                    "lora_name": opts.lora,
                    "strength_model": opts.lora_strength,
                    "strength_clip": opts.lora_strength,
                    "model": [4, 0],
                    "clip": [4, 1],
                }),
            ),
        );
        // Consumers read the patched model and clip instead.
        if let Some(sampler) = workflow.get_mut(&3) {
            sampler.inputs.insert("model".into(), json!([10, 0]));
        }
        for id in [6, 7] {
            if let Some(encode) = workflow.get_mut(&id) {
                encode.inputs.insert("clip".into(), json!([10, 1]));
            }
        }
    }
    workflow
}

fn client_id() -> String {
    format!(
        "fabula_{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

fn filename_prefix() -> String {
    format!("fabula_{}", chrono::Utc::now().timestamp())
}

/// Result of one image generation.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub prompt_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// HTTP client for a ComfyUI instance.
pub struct ComfyClient {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    max_poll_attempts: usize,
}

impl ComfyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            poll_interval: POLL_INTERVAL,
            max_poll_attempts: MAX_POLL_ATTEMPTS,
        }
    }

    /// Tighten polling; used by tests.
    pub fn with_polling(mut self, interval: Duration, attempts: usize) -> Self {
        self.poll_interval = interval;
        self.max_poll_attempts = attempts;
        self
    }

    /// Queue a workflow and wait for its first output image.
    pub async fn generate_image(&self, opts: &ImageOptions) -> Result<GeneratedImage> {
        let workflow = build_workflow(opts);
        let prompt_id = self.queue_prompt(&workflow).await?;
        self.poll_for_image(&prompt_id).await
    }

    /// Queue a workflow without waiting; returns the prompt id.
    pub async fn queue_prompt(&self, workflow: &Workflow) -> Result<String> {
        let body = json!({"prompt": workflow, "client_id": client_id()});
        let resp = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let value: Value = resp.json().await?;
        if !status.is_success() {
            return Err(Error::Upstream(format!(
                "image backend refused prompt: HTTP {status}: {value}"
            )));
        }
        match value.get("prompt_id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(Error::Protocol("prompt response missing prompt_id".into())),
        }
    }

    async fn poll_for_image(&self, prompt_id: &str) -> Result<GeneratedImage> {
        for _ in 0..self.max_poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            let history = match self.history().await {
                Ok(history) => history,
                Err(e) => {
                    tracing::debug!(error = %e, "history poll failed, retrying");
                    continue;
                }
            };
            let Some(outputs) = history
                .get(prompt_id)
                .and_then(|item| item.get("outputs"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            for output in outputs.values() {
                let Some(image) = output
                    .get("images")
                    .and_then(Value::as_array)
                    .and_then(|images| images.first())
                else {
                    continue;
                };
                let filename = image
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let subfolder = image
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let bytes = self.fetch_image(filename, subfolder).await?;
                return Ok(GeneratedImage {
                    prompt_id: prompt_id.to_string(),
                    filename: filename.to_string(),
                    bytes,
                });
            }
        }
        Err(Error::Timeout(format!(
            "image generation {prompt_id} did not complete"
        )))
    }

    /// Full generation history, keyed by prompt id.
    pub async fn history(&self) -> Result<Map<String, Value>> {
        let resp = self
            .http
            .get(format!("{}/history", self.base_url))
            .send()
            .await?;
        let value: Value = resp.json().await?;
        Ok(value.as_object().cloned().unwrap_or_default())
    }

    /// Download one output image.
    pub async fn fetch_image(&self, filename: &str, subfolder: &str) -> Result<Vec<u8>> {
        let mut url = url::Url::parse(&format!("{}/view", self.base_url))
            .map_err(|e| Error::BadRequest(format!("bad backend url: {e}")))?;
        url.query_pairs_mut().append_pair("filename", filename);
        if !subfolder.is_empty() {
            url.query_pairs_mut().append_pair("subfolder", subfolder);
        }
        let resp = self.http.get(url).send().await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Current queue state.
    pub async fn queue_status(&self) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/queue", self.base_url))
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn health_check(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/queue", self.base_url))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Unavailable(format!(
                "image backend returned {}",
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl Producer for ComfyClient {
    type Options = ImageOptions;

    fn fingerprint(opts: &ImageOptions) -> String {
        image_fingerprint(opts)
    }

    fn source_text(opts: &ImageOptions) -> String {
        opts.prompt.clone()
    }

    async fn produce(&self, opts: &ImageOptions) -> Result<ProducedAsset> {
        let image = self.generate_image(opts).await?;
        Ok(ProducedAsset {
            bytes: image.bytes,
            format: "png".into(),
            duration_secs: None,
        })
    }
}
