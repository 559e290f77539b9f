//! Progress Store Bridge
//!
//! Save/load of one opaque progress blob per (game, launch session). A save
//! overwrites; nothing is merged. A missing record is `Ok(None)`, not an error.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::clock::SharedClock;
use crate::hub::launch::{LaunchError, LaunchManager};

/// Stored progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    /// Game id.
    pub game_id: String,
    /// Launch session id.
    pub session_id: String,
    /// Opaque game data.
    pub data: Value,
    /// Save time.
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement of a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAck {
    /// Game id.
    pub game_id: String,
    /// Launch session id.
    pub session_id: String,
    /// Stored timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Backing store failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("progress store unavailable: {0}")]
pub struct StoreError(pub String);

/// Progress errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    /// Caller input is invalid.
    #[error("{0}")]
    Validation(String),

    /// Launch session expired.
    #[error("launch session expired")]
    SessionExpired,

    /// Backing store unreachable; retry with backoff.
    #[error(transparent)]
    Upstream(#[from] StoreError),
}

/// Boxed store future.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable progress storage.
pub trait ProgressStore: Send + Sync {
    /// Insert or overwrite the record for its (game, session).
    fn put(&self, record: ProgressRecord) -> StoreFuture<'_, ()>;

    /// Fetch the record for (game, session).
    fn get<'a>(&'a self, game_id: &'a str, session_id: &'a str) -> StoreFuture<'a, Option<ProgressRecord>>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: RwLock<BTreeMap<(String, String), ProgressRecord>>,
}

impl MemoryProgressStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn put(&self, record: ProgressRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let key = (record.game_id.clone(), record.session_id.clone());
            self.records.write().await.insert(key, record);
            Ok(())
        })
    }

    fn get<'a>(&'a self, game_id: &'a str, session_id: &'a str) -> StoreFuture<'a, Option<ProgressRecord>> {
        Box::pin(async move {
            let key = (game_id.to_string(), session_id.to_string());
            Ok(self.records.read().await.get(&key).cloned())
        })
    }
}

/// Validates and routes progress calls to the store.
pub struct ProgressBridge {
    store: Arc<dyn ProgressStore>,
    launches: Arc<LaunchManager>,
    clock: SharedClock,
}

impl ProgressBridge {
    /// Create a bridge.
    pub fn new(store: Arc<dyn ProgressStore>, launches: Arc<LaunchManager>, clock: SharedClock) -> Self {
        Self { store, launches, clock }
    }

    /// Save progress, replacing any previous record.
    pub async fn save(
        &self,
        game_id: &str,
        session_id: &str,
        data: Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<SaveAck, ProgressError> {
        if game_id.is_empty() {
            return Err(ProgressError::Validation("gameId is required".into()));
        }
        if session_id.is_empty() {
            return Err(ProgressError::Validation("sessionId is required".into()));
        }
        if data.is_null() {
            return Err(ProgressError::Validation("data is required".into()));
        }

        if let Err(LaunchError::SessionExpired) = self.launches.ensure_live(session_id).await {
            return Err(ProgressError::SessionExpired);
        }

        let timestamp = timestamp.unwrap_or_else(|| self.clock.now());
        let record = ProgressRecord {
            game_id: game_id.to_string(),
            session_id: session_id.to_string(),
            data,
            timestamp,
        };

        self.store.put(record).await.map_err(|e| {
            warn!(game_id, session_id, error = %e, "progress save failed");
            ProgressError::from(e)
        })?;
        debug!(game_id, session_id, "progress saved");

        Ok(SaveAck { game_id: game_id.to_string(), session_id: session_id.to_string(), timestamp })
    }

    /// Load progress. `Ok(None)` when nothing was saved.
    pub async fn load(&self, game_id: &str, session_id: &str) -> Result<Option<ProgressRecord>, ProgressError> {
        if session_id.is_empty() {
            return Err(ProgressError::Validation("sessionId is required".into()));
        }
        self.store.get(game_id, session_id).await.map_err(|e| {
            warn!(game_id, session_id, error = %e, "progress load failed");
            ProgressError::from(e)
        })
    }
}
