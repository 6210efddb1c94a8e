//! Live platform capability surface.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bilibili::BilibiliAdapter;
use crate::douyin::DouyinAdapter;
use crate::{Error, Result};

/// A normalized chat message from a live room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Danmaku {
    pub username: String,
    pub user_id: String,
    pub content: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub is_vip: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub gift_value: i64,
}

/// Parameters for connecting to a live room.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub room_id: String,
    pub cookie: String,
}

/// Connection lifecycle of an adapter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Streaming,
    Closed,
}

/// Capability set every live platform adapter provides.
///
/// An adapter owns exactly one upstream session. It never reconnects on
/// its own: after a read or write failure it closes its message channel
/// and the caller decides whether to dial again.
#[async_trait]
pub trait LiveAdapter: Send + Sync {
    /// Establish the upstream session and start streaming.
    async fn connect(&self, opts: &ConnectOptions) -> Result<()>;

    /// Take the message stream. The channel closes when the session
    /// ends; it can only be taken once per connection.
    async fn subscribe_danmaku(&self) -> Result<mpsc::Receiver<Danmaku>>;

    /// Send a chat message into the room.
    async fn send_chat(&self, msg: &str) -> Result<()>;

    /// Whether the session is still alive.
    async fn health_check(&self) -> Result<()>;

    /// Tear the session down.
    async fn disconnect(&self) -> Result<()>;
}

/// Supported live platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Bilibili,
    Douyin,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Bilibili => "bilibili",
            Platform::Douyin => "douyin",
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bilibili" => Ok(Platform::Bilibili),
            "douyin" => Ok(Platform::Douyin),
            other => Err(Error::BadRequest(format!("unsupported platform: {other}"))),
        }
    }
}

/// Construct the adapter for a platform.
pub fn adapter_for(platform: Platform) -> Arc<dyn LiveAdapter> {
    match platform {
        Platform::Bilibili => Arc::new(BilibiliAdapter::new()),
        Platform::Douyin => Arc::new(DouyinAdapter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_platform_names() {
        assert_eq!("bilibili".parse::<Platform>().unwrap(), Platform::Bilibili);
        assert_eq!("douyin".parse::<Platform>().unwrap(), Platform::Douyin);
        assert!("twitch".parse::<Platform>().is_err());
    }

    #[test]
    fn danmaku_serializes_with_defaults() {
        let d: Danmaku = serde_json::from_str(
            r#"{"username":"alice","user_id":"1001","content":"hi","timestamp":7}"#,
        )
        .unwrap();
        assert!(!d.is_vip);
        assert_eq!(d.gift_value, 0);
    }
}
