//! Short-term store of recent chat messages.
//!
//! An append-only bounded list under one logical key. Before an append
//! a content-hash dedup key with a five-minute TTL is consulted; on a
//! hit the append is skipped. The list itself keeps at most 10,000
//! messages for 24 hours.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::live::Danmaku;

const MAX_MESSAGES: usize = 10_000;
const LIST_TTL_HOURS: i64 = 24;
const DEDUP_TTL_MINUTES: i64 = 5;
const DEFAULT_RECENT: usize = 100;
const MAX_RECENT: usize = 1000;

struct Inner {
    entries: VecDeque<(DateTime<Utc>, Danmaku)>,
    dedup: HashMap<u64, DateTime<Utc>>,
}

/// Bounded, deduplicated recent-message list.
pub struct RecentMessages {
    max_messages: usize,
    list_ttl: Duration,
    dedup_ttl: Duration,
    inner: Mutex<Inner>,
}

impl RecentMessages {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MESSAGES)
    }

    pub fn with_capacity(max_messages: usize) -> Self {
        Self {
            max_messages,
            list_ttl: Duration::hours(LIST_TTL_HOURS),
            dedup_ttl: Duration::minutes(DEDUP_TTL_MINUTES),
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                dedup: HashMap::new(),
            }),
        }
    }

    /// Append a message. Returns `false` when the same message was
    /// already stored inside the dedup window.
    pub fn push(&self, danmaku: Danmaku) -> bool {
        self.push_at(danmaku, Utc::now())
    }

    pub fn push_at(&self, danmaku: Danmaku, now: DateTime<Utc>) -> bool {
        let key = dedup_key(&danmaku);
        let mut inner = self.inner.lock().unwrap();

        let dedup_ttl = self.dedup_ttl;
        inner.dedup.retain(|_, seen| now - *seen < dedup_ttl);
        if inner.dedup.contains_key(&key) {
            return false;
        }
        inner.dedup.insert(key, now);

        inner.entries.push_front((now, danmaku));
        while inner.entries.len() > self.max_messages {
            inner.entries.pop_back();
        }
        let list_ttl = self.list_ttl;
        while inner
            .entries
            .back()
            .map(|(at, _)| now - *at > list_ttl)
            .unwrap_or(false)
        {
            inner.entries.pop_back();
        }
        true
    }

    /// Newest messages first. A non-positive or oversized limit falls
    /// back to the defaults.
    pub fn recent(&self, limit: usize) -> Vec<Danmaku> {
        let limit = if limit == 0 || limit > MAX_RECENT {
            DEFAULT_RECENT
        } else {
            limit
        };
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .take(limit)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.dedup.clear();
    }
}

impl Default for RecentMessages {
    fn default() -> Self {
        Self::new()
    }
}

fn dedup_key(danmaku: &Danmaku) -> u64 {
    let mut hasher = DefaultHasher::new();
    danmaku.user_id.hash(&mut hasher);
    danmaku.content.hash(&mut hasher);
    danmaku.timestamp.hash(&mut hasher);
    hasher.finish()
}
