//! Lifecycle supervision for a co-located inference process.
//!
//! Starts the tool with a fixed working directory and listen
//! arguments, marks it running after a short grace period, watches for
//! unexpected death, and stops it with a bounded kill-and-wait.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::{Error, Result};

const STARTUP_GRACE: Duration = Duration::from_secs(3);
const STOP_CAP: Duration = Duration::from_secs(5);

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Where and how to launch the tool.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Interpreter used to launch the tool.
    pub interpreter: PathBuf,
    /// Tool root; also the working directory.
    pub tool_dir: PathBuf,
    /// Entry script relative to `tool_dir`.
    pub entrypoint: String,
    pub host: String,
    pub port: u16,
    pub startup_grace: Duration,
}

impl ProcessConfig {
    pub fn new(interpreter: impl Into<PathBuf>, tool_dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            interpreter: interpreter.into(),
            tool_dir: tool_dir.into(),
            entrypoint: "main.py".into(),
            host: "127.0.0.1".into(),
            port,
            startup_grace: STARTUP_GRACE,
        }
    }
}

/// Supervisor over one child process. A single mutex serializes state
/// transitions; `status()` reads a mirror without blocking on them.
pub struct InferenceProcess {
    config: ProcessConfig,
    child: Mutex<Option<Child>>,
    status: Arc<RwLock<ProcessStatus>>,
}

impl InferenceProcess {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            status: Arc::new(RwLock::new(ProcessStatus::Stopped)),
        }
    }

    /// Spawn the tool. Pre-flight failures return synchronously; the
    /// transition to `Running` happens after the startup grace period.
    pub async fn start(&self) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        if matches!(self.status(), ProcessStatus::Running | ProcessStatus::Starting) {
            return Ok(());
        }

        if !self.config.interpreter.exists() {
            self.set_status(ProcessStatus::Error);
            return Err(Error::Unavailable(format!(
                "interpreter not found at {}",
                self.config.interpreter.display()
            )));
        }
        if !self.config.tool_dir.exists() {
            self.set_status(ProcessStatus::Error);
            return Err(Error::Unavailable(format!(
                "tool directory not found at {}",
                self.config.tool_dir.display()
            )));
        }

        self.set_status(ProcessStatus::Starting);
        let child = Command::new(&self.config.interpreter)
            .arg(&self.config.entrypoint)
            .arg("--listen")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .current_dir(&self.config.tool_dir)
            .spawn()
            .map_err(|e| {
                self.set_status(ProcessStatus::Error);
                Error::Unavailable(format!("failed to spawn inference process: {e}"))
            })?;
        tracing::info!(pid = ?child.id(), "inference process started");
        *child_slot = Some(child);
        drop(child_slot);

        // Mark running once the grace period passes, provided nothing
        // changed the state meanwhile.
        let status = self.status.clone();
        let grace = self.config.startup_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut status = status.write().unwrap();
            if *status == ProcessStatus::Starting {
                *status = ProcessStatus::Running;
                tracing::info!("inference process marked running");
            }
        });
        Ok(())
    }

    /// Stop the tool. A no-op when already stopped; otherwise kill and
    /// await exit, capped at five seconds.
    pub async fn stop(&self) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        let Some(mut child) = child_slot.take() else {
            self.set_status(ProcessStatus::Stopped);
            return Ok(());
        };
        if let Err(e) = child.start_kill() {
            tracing::warn!(error = %e, "terminate signal failed");
        }
        match tokio::time::timeout(STOP_CAP, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(?status, "inference process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "waiting on inference process failed");
            }
            Err(_) => {
                tracing::warn!("inference process ignored terminate, killing");
                let _ = child.kill().await;
            }
        }
        self.set_status(ProcessStatus::Stopped);
        Ok(())
    }

    /// Stop, then start.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Detect unexpected death. Transitions to `Error` when the child
    /// is gone while the state still says starting or running.
    pub async fn check_alive(&self) -> ProcessStatus {
        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::error!(?status, "inference process died unexpectedly");
                    *child_slot = None;
                    self.set_status(ProcessStatus::Error);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "inference process poll failed");
                }
            }
        }
        self.status()
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.read().unwrap()
    }

    pub fn ready(&self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// HTTP base URL of the supervised tool.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    fn set_status(&self, status: ProcessStatus) {
        *self.status.write().unwrap() = status;
    }
}

/// Poll for unexpected death every `interval` until shutdown.
pub fn spawn_watchdog(
    process: Arc<InferenceProcess>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    process.check_alive().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preflight_rejects_missing_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessConfig::new(dir.path().join("no-such-python"), dir.path(), 8188);
        let process = InferenceProcess::new(config);
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(process.status(), ProcessStatus::Error);
    }

    #[tokio::test]
    async fn preflight_rejects_missing_tool_dir() {
        let dir = tempfile::tempdir().unwrap();
        let interpreter = dir.path().join("python");
        std::fs::write(&interpreter, b"#!/bin/sh\n").unwrap();
        let config = ProcessConfig::new(&interpreter, dir.path().join("missing"), 8188);
        let process = InferenceProcess::new(config);
        assert!(process.start().await.is_err());
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessConfig::new(dir.path().join("python"), dir.path(), 8188);
        let process = InferenceProcess::new(config);
        process.stop().await.unwrap();
        assert_eq!(process.status(), ProcessStatus::Stopped);
        assert!(!process.ready());
    }

    #[tokio::test]
    async fn url_reflects_config() {
        let config = ProcessConfig::new("/usr/bin/python3", "/opt/tool", 8188);
        let process = InferenceProcess::new(config);
        assert_eq!(process.url(), "http://127.0.0.1:8188");
    }
}
