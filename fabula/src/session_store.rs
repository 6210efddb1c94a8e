//! Durable per-story persistence.
//!
//! Each story gets a JSON snapshot under `stories/` and an append-only
//! JSONL decision history under `decisions/`. Snapshots are written to
//! a temp file and renamed so a crash never leaves a half-written
//! state behind.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::story::StoryState;
use crate::{Error, Result};

/// One recorded audience decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub story_id: String,
    pub option_id: String,
    pub choice_text: String,
    /// Unix seconds.
    pub timestamp: i64,
}

impl DecisionRecord {
    pub fn new(story_id: &str, option_id: &str, choice_text: &str) -> Self {
        Self {
            story_id: story_id.into(),
            option_id: option_id.into(),
            choice_text: choice_text.into(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// File-backed store of story snapshots and decision history.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn story_path(&self, story_id: &str) -> PathBuf {
        self.dir.join("stories").join(format!("{story_id}.json"))
    }

    fn decisions_path(&self, story_id: &str) -> PathBuf {
        self.dir.join("decisions").join(format!("{story_id}.jsonl"))
    }

    /// Write the current snapshot of a story.
    pub async fn save_story(&self, story_id: &str, state: &StoryState) -> Result<()> {
        let path = self.story_path(story_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Load a snapshot, if one was saved.
    pub async fn load_story(&self, story_id: &str) -> Result<Option<StoryState>> {
        let path = self.story_path(story_id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a snapshot. Missing snapshots are fine.
    pub async fn delete_story(&self, story_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.story_path(story_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append one decision to the story's history.
    pub async fn record_decision(&self, record: &DecisionRecord) -> Result<()> {
        let path = self.decisions_path(&record.story_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    /// Decision history for a story, newest first.
    pub async fn decisions(&self, story_id: &str, limit: usize) -> Result<Vec<DecisionRecord>> {
        let path = self.decisions_path(story_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut records: Vec<DecisionRecord> = data
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        records.reverse();
        if limit > 0 {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Ids of stored stories, most recently written first.
    pub async fn recent_stories(&self, limit: usize) -> Result<Vec<String>> {
        let dir = self.dir.join("stories");
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((modified, stem.to_string()));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        if limit > 0 {
            entries.truncate(limit);
        }
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshots_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let state = StoryState::new("Li", "wuxia", "epic", "classical");
        store.save_story("s1", &state).await.unwrap();

        let loaded = store.load_story("s1").await.unwrap().unwrap();
        assert_eq!(loaded.protagonist, "Li");
        assert!(store.load_story("missing").await.unwrap().is_none());

        store.delete_story("s1").await.unwrap();
        assert!(store.load_story("s1").await.unwrap().is_none());
        // Deleting again is a no-op.
        store.delete_story("s1").await.unwrap();
    }

    #[tokio::test]
    async fn decisions_append_and_read_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        for i in 0..3 {
            let mut record = DecisionRecord::new("s1", &i.to_string(), "go");
            record.timestamp = i;
            store.record_decision(&record).await.unwrap();
        }
        let records = store.decisions("s1", 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].option_id, "2");
        assert_eq!(records[1].option_id, "1");
        assert!(store.decisions("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_stories_lists_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let state = StoryState::new("Li", "wuxia", "epic", "classical");
        store.save_story("a", &state).await.unwrap();
        store.save_story("b", &state).await.unwrap();
        let stories = store.recent_stories(10).await.unwrap();
        assert_eq!(stories.len(), 2);
        assert!(stories.contains(&"a".to_string()));
        assert!(stories.contains(&"b".to_string()));
    }
}
