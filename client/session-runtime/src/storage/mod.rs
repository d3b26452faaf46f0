//! Durable local key-value store shared by every question entry and the
//! session-level UI record. Writes are last-writer-wins per key.

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{StorageBackend, StorageSettings};
use crate::error::{Result, SessionError};
use crate::metrics::track_store_operation;
use crate::models::answer::{DraftRecord, QuestionId, SessionUiState};
use crate::utils::time::is_fresh;

pub mod file;
pub mod memory;
pub mod redis;

pub use self::file::FileStore;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

pub fn draft_key(token: &str, question_id: QuestionId) -> String {
    format!("draft:{}:{}", token, question_id)
}

pub fn draft_prefix(token: &str) -> String {
    format!("draft:{}:", token)
}

pub fn ui_state_key(token: &str) -> String {
    format!("ui:{}", token)
}

/// Typed access to the session's records on top of a raw [`LocalStore`].
#[derive(Clone)]
pub struct DraftRepository {
    store: Arc<dyn LocalStore>,
    token: String,
    freshness: Duration,
}

impl DraftRepository {
    pub fn new(store: Arc<dyn LocalStore>, token: impl Into<String>, freshness: Duration) -> Self {
        Self {
            store,
            token: token.into(),
            freshness,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn save_draft(&self, question_id: QuestionId, record: &DraftRecord) -> Result<()> {
        let key = draft_key(&self.token, question_id);
        self.put_json("save_draft", &key, record).await
    }

    /// Returns the record only while it is inside the freshness window.
    pub async fn load_draft(&self, question_id: QuestionId) -> Result<Option<DraftRecord>> {
        let key = draft_key(&self.token, question_id);
        let record: Option<DraftRecord> = self.get_json("load_draft", &key).await?;
        Ok(record.filter(|r| {
            let fresh = is_fresh(r.timestamp, self.freshness, Utc::now());
            if !fresh {
                tracing::debug!(
                    "Ignoring stale draft: token={}, question={}, written={}",
                    self.token,
                    question_id,
                    r.timestamp
                );
            }
            fresh
        }))
    }

    pub async fn remove_draft(&self, question_id: QuestionId) -> Result<()> {
        let key = draft_key(&self.token, question_id);
        track_store_operation("remove_draft", self.store.remove(&key)).await
    }

    /// Deletes every draft of this session. Returns how many were removed.
    pub async fn purge_drafts(&self) -> Result<usize> {
        let keys = self.store.keys_with_prefix(&draft_prefix(&self.token)).await?;
        for key in &keys {
            track_store_operation("purge_draft", self.store.remove(key)).await?;
        }
        Ok(keys.len())
    }

    pub async fn save_ui_state(&self, state: &SessionUiState) -> Result<()> {
        let key = ui_state_key(&self.token);
        self.put_json("save_ui_state", &key, state).await
    }

    pub async fn load_ui_state(&self) -> Result<Option<SessionUiState>> {
        let key = ui_state_key(&self.token);
        let state: Option<SessionUiState> = self.get_json("load_ui_state", &key).await?;
        Ok(state.filter(|s| is_fresh(s.timestamp, self.freshness, Utc::now())))
    }

    pub async fn remove_ui_state(&self) -> Result<()> {
        let key = ui_state_key(&self.token);
        track_store_operation("remove_ui_state", self.store.remove(&key)).await
    }

    async fn put_json<T: Serialize>(&self, operation: &str, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        track_store_operation(operation, self.store.put(key, payload)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, key: &str) -> Result<Option<T>> {
        let raw = track_store_operation(operation, self.store.get(key)).await?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // A corrupt record must not block the session from loading
                    tracing::warn!("Discarding unreadable local record: key={}, error={}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

/// Builds the configured backend.
pub async fn open_store(settings: &StorageSettings) -> anyhow::Result<Arc<dyn LocalStore>> {
    use anyhow::Context;

    let store: Arc<dyn LocalStore> = match settings.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(
            FileStore::open(&settings.path)
                .await
                .with_context(|| format!("Failed to open draft directory {}", settings.path))?,
        ),
        StorageBackend::Redis => {
            let uri = settings
                .redis_uri
                .clone()
                .or_else(|| std::env::var("REDIS_URI").ok())
                .context("storage.redis_uri must be set for the redis backend")?;
            Arc::new(
                RedisStore::connect(&uri, settings.freshness_window())
                    .await
                    .context("Failed to connect to Redis draft store")?,
            )
        }
    };

    tracing::info!("Local draft store ready: backend={:?}", settings.backend);
    Ok(store)
}

pub(crate) fn storage_error(context: &str, err: impl std::fmt::Display) -> SessionError {
    SessionError::Storage(format!("{}: {}", context, err))
}
