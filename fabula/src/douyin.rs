//! Douyin live adapter.
//!
//! The platform is recognised but its binary protocol has not been
//! wired up yet; every session operation reports `Unavailable`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::live::{ConnectOptions, Danmaku, LiveAdapter};
use crate::{Error, Result};

pub struct DouyinAdapter;

impl DouyinAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DouyinAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveAdapter for DouyinAdapter {
    async fn connect(&self, _opts: &ConnectOptions) -> Result<()> {
        Err(Error::Unavailable(
            "douyin sessions are not implemented".into(),
        ))
    }

    async fn subscribe_danmaku(&self) -> Result<mpsc::Receiver<Danmaku>> {
        Err(Error::Unavailable("not connected".into()))
    }

    async fn send_chat(&self, _msg: &str) -> Result<()> {
        Err(Error::Unavailable(
            "douyin sessions are not implemented".into(),
        ))
    }

    async fn health_check(&self) -> Result<()> {
        Err(Error::Unavailable("not connected".into()))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
