//! Repeat suppression for the inbound chat stream.
//!
//! A text seen within the sliding window is discarded; so is anything
//! containing a banned substring. Stale window entries are swept every
//! five minutes of observed activity.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

const DEFAULT_WINDOW_SECS: i64 = 60;
const SWEEP_EVERY_MINUTES: i64 = 5;

/// Sliding-window duplicate and keyword filter.
#[derive(Debug)]
pub struct DedupFilter {
    window: Duration,
    banned: Vec<String>,
    recent: HashMap<String, DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

impl DedupFilter {
    pub fn new(window: Duration, banned: Vec<String>) -> Self {
        Self {
            window,
            banned,
            recent: HashMap::new(),
            last_sweep: Utc::now(),
        }
    }

    /// Decide whether `content` should be published now.
    pub fn observe(&mut self, content: &str) -> bool {
        self.observe_at(content, Utc::now())
    }

    /// Decide whether `content` should be published at `now`.
    ///
    /// Returns `false` for repeats inside the window and for banned
    /// content; otherwise records the text and returns `true`.
    pub fn observe_at(&mut self, content: &str, now: DateTime<Utc>) -> bool {
        if now - self.last_sweep >= Duration::minutes(SWEEP_EVERY_MINUTES) {
            self.sweep(now);
        }
        if let Some(seen) = self.recent.get(content) {
            if now - *seen < self.window {
                return false;
            }
        }
        if self.banned.iter().any(|word| content.contains(word.as_str())) {
            tracing::debug!(%content, "dropping banned message");
            return false;
        }
        self.recent.insert(content.to_string(), now);
        true
    }

    /// Drop entries older than the window.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let window = self.window;
        let before = self.recent.len();
        self.recent.retain(|_, seen| now - *seen < window);
        self.last_sweep = now;
        before - self.recent.len()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_WINDOW_SECS), Vec::new())
    }
}
