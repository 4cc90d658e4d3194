//! Collaborator interfaces for persisted settings and playback history.
//!
//! Both traits are async: implementations backed by blocking storage run
//! their work on the blocking pool, so callers on runtime threads (socket
//! readers, session workers, HTTP handlers) never stall the executor.

use std::sync::Mutex;

use ambilight_common::settings::{Settings, SettingsPatch};
use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn get(&self) -> Result<Settings, StoreError>;

    /// Persist the fields present in `patch`.
    async fn update(&self, patch: &SettingsPatch) -> Result<(), StoreError>;
}

#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Record that `path` was played; repeated paths only refresh the time.
    async fn add(&self, filename: &str, path: &str) -> Result<(), StoreError>;

    /// Most recently played first.
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Forget every entry; returns how many were removed.
    async fn clear(&self) -> Result<usize, StoreError>;

    async fn remove(&self, id: i64) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub filename: String,
    pub path: String,
    /// Unix millis
    pub last_played: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Volatile store used when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    settings: Mutex<Settings>,
    history: Mutex<Vec<HistoryEntry>>,
}

impl MemoryStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
            history: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SettingsProvider for MemoryStore {
    async fn get(&self) -> Result<Settings, StoreError> {
        let settings = self
            .settings
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(*settings)
    }

    async fn update(&self, patch: &SettingsPatch) -> Result<(), StoreError> {
        let mut settings = self
            .settings
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        settings.merge(patch);
        Ok(())
    }
}

#[async_trait]
impl HistoryRecorder for MemoryStore {
    async fn add(&self, filename: &str, path: &str) -> Result<(), StoreError> {
        let mut history = self
            .history
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(pos) = history.iter().position(|h| h.path == path) {
            let mut entry = history.remove(pos);
            entry.last_played = now;
            history.insert(0, entry);
        } else {
            let id = history.iter().map(|h| h.id).max().unwrap_or(0) + 1;
            history.insert(
                0,
                HistoryEntry {
                    id,
                    filename: filename.to_string(),
                    path: path.to_string(),
                    last_played: now,
                },
            );
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let history = self
            .history
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(history.iter().take(limit).cloned().collect())
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let mut history = self
            .history
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let removed = history.len();
        history.clear();
        Ok(removed)
    }

    async fn remove(&self, id: i64) -> Result<bool, StoreError> {
        let mut history = self
            .history
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let before = history.len();
        history.retain(|h| h.id != id);
        Ok(history.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_settings_patch_is_partial() {
        let store = MemoryStore::default();
        store
            .update(&SettingsPatch {
                autoplay: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        let s = store.get().await.unwrap();
        assert!(s.autoplay);
        assert_eq!(s.zones_per_side, 10);
    }

    #[tokio::test]
    async fn memory_history_moves_replayed_path_to_front() {
        let store = MemoryStore::default();
        let before = chrono::Utc::now().timestamp_millis();
        store.add("a.mp4", "/u/a.mp4").await.unwrap();
        store.add("b.mp4", "/u/b.mp4").await.unwrap();
        store.add("a.mp4", "/u/a.mp4").await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].path, "/u/a.mp4");
        assert_eq!(recent[0].id, 1);
        assert!(recent[0].last_played >= before);
        assert_eq!(recent[1].path, "/u/b.mp4");
        assert_eq!(store.recent(1).await.unwrap().len(), 1);

        assert!(store.remove(2).await.unwrap());
        assert!(!store.remove(2).await.unwrap());
        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.recent(10).await.unwrap().is_empty());
    }
}
