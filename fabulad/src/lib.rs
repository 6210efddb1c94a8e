//! Interactive streaming narrative server daemon.
//!
//! Wires the `fabula` components behind an axum HTTP/WebSocket
//! surface: live-room control, the danmaku fan-out socket, story
//! operations and asset generation.

pub mod args;
pub mod live_service;
pub mod logger;
pub mod media;
pub mod server;
pub mod ws;

pub use args::Args;
pub use live_service::{LiveService, LiveStatus};
pub use media::MediaPipeline;
pub use server::{router, ApiError, AppState};
