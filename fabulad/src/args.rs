use clap::Parser;

/// Command line arguments for the fabulad binary.
#[derive(Parser, Clone, Debug)]
pub struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Base URL of the chat/embedding provider.
    #[arg(long = "glm-base-url", default_value = "https://open.bigmodel.cn/api/paas/v4")]
    pub glm_base_url: String,
    /// API key for the provider. The `ZHIPUAI_API_KEY` environment
    /// variable overrides this flag.
    #[arg(long = "glm-api-key", default_value = "")]
    pub glm_api_key: String,
    #[arg(long = "glm-model", default_value = "glm-4")]
    pub glm_model: String,
    #[arg(long = "embedding-model", default_value = "embedding-3")]
    pub embedding_model: String,
    /// Embedding dimension of the configured model.
    #[arg(long = "embedding-dimension", default_value_t = 1024)]
    pub embedding_dimension: usize,

    #[arg(long = "qdrant-url", default_value = "http://localhost:6333")]
    pub qdrant_url: String,
    /// API key for the vector store. The `QDRANT_API_KEY` environment
    /// variable overrides this flag.
    #[arg(long = "qdrant-api-key", default_value = "")]
    pub qdrant_api_key: String,

    #[arg(long = "comfyui-url", default_value = "http://localhost:8188")]
    pub comfyui_url: String,
    #[arg(long = "sovits-url", default_value = "http://localhost:9880")]
    pub sovits_url: String,
    /// Checkpoint used when an image request names no model.
    #[arg(long = "image-model", default_value = "sd_xl_base_1.0.safetensors")]
    pub image_model: String,

    /// Interpreter for the co-located image tool, when supervised.
    #[arg(long = "comfyui-python", default_value = "")]
    pub comfyui_python: String,
    /// Root directory of the co-located image tool.
    #[arg(long = "comfyui-dir", default_value = "")]
    pub comfyui_dir: String,

    #[arg(long = "data-dir", default_value = "./data")]
    pub data_dir: String,
    #[arg(long = "cache-max-entries", default_value_t = 1000)]
    pub cache_max_entries: usize,
    #[arg(long = "cache-ttl-hours", default_value_t = 24)]
    pub cache_ttl_hours: i64,
    #[arg(long = "queue-workers", default_value_t = 2)]
    pub queue_workers: usize,
    #[arg(long = "queue-capacity", default_value_t = 100)]
    pub queue_capacity: usize,

    /// Per-subscriber outbound queue size.
    #[arg(long = "subscriber-queue", default_value_t = 64)]
    pub subscriber_queue: usize,
    /// Seconds a repeated chat line is suppressed for.
    #[arg(long = "dedup-window-secs", default_value_t = 60)]
    pub dedup_window_secs: i64,
    /// Substrings that drop a chat line. Repeat the flag to add more.
    #[arg(long = "banned-word")]
    pub banned_words: Vec<String>,

    /// Story that live chat commands drive.
    #[arg(long = "live-story-id", default_value = "live")]
    pub live_story_id: String,

    /// Generate scene art and narration for every story update.
    #[arg(long = "auto-media", default_value_t = false)]
    pub auto_media: bool,
    /// Voice used for narration.
    #[arg(long = "narration-voice", default_value = "narrator")]
    pub narration_voice: String,
}

impl Args {
    /// Environment variables override the corresponding flags.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("ZHIPUAI_API_KEY") {
            if !key.is_empty() {
                self.glm_api_key = key;
            }
        }
        if let Ok(key) = std::env::var("QDRANT_API_KEY") {
            if !key.is_empty() {
                self.qdrant_api_key = key;
            }
        }
        self
    }
}
