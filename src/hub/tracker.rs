//! Hub Session Tracker
//!
//! A rolling 24-hour play session aggregating statistics across games. The
//! session belongs to the client: it lives in a [`SessionStorage`] under one
//! key and nothing on the server is authoritative for it.
//!
//! Several tabs sharing the same storage key race under last-writer-wins.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::clock::SharedClock;

/// Default storage key.
pub const DEFAULT_STORAGE_KEY: &str = "hub_session";

// =============================================================================
// DATA
// =============================================================================

/// One finished game in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameResult {
    /// Game id.
    pub game_id: String,
    /// Final score.
    pub score: i64,
    /// Play time in milliseconds.
    pub time_ms: u64,
    /// When the result was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Aggregated statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Games finished in this session.
    pub total_games_played: u64,
    /// Sum of final scores.
    pub total_score: i64,
    /// Sum of play times in milliseconds.
    pub total_time_spent: u64,
    /// Results in the order they were recorded.
    pub games_history: Vec<GameResult>,
}

/// Client-owned rolling session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSession {
    /// Session id, rotated on expiry.
    pub session_id: String,
    /// Creation time.
    pub start_time: DateTime<Utc>,
    /// `start_time` plus the session lifetime.
    pub expiry_time: DateTime<Utc>,
    /// Statistics.
    pub stats: HubStats,
}

impl HubSession {
    fn fresh(now: DateTime<Utc>, lifetime: Duration) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            start_time: now,
            expiry_time: now + lifetime,
            stats: HubStats::default(),
        }
    }

    /// Whether the session must be rotated.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }

    fn with_result(&self, result: GameResult) -> Self {
        let mut next = self.clone();
        next.stats.total_games_played += 1;
        next.stats.total_score = next.stats.total_score.saturating_add(result.score);
        next.stats.total_time_spent = next.stats.total_time_spent.saturating_add(result.time_ms);
        next.stats.games_history.push(result);
        next
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key unusable as a storage name.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

/// Key/value string storage.
pub trait SessionStorage: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Delete a value.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

/// One JSON file per key in a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store files under `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Backing directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl SessionStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Tracker errors.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Storage failure. In-memory state is unchanged.
    #[error("session storage failed: {0}")]
    Storage(#[from] StorageError),

    /// Session could not be encoded.
    #[error("session encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Storage key of the session.
    pub storage_key: String,
    /// Session lifetime.
    pub lifetime: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            lifetime: Duration::hours(24),
        }
    }
}

/// Owns the hub session for one client.
pub struct HubSessionTracker {
    config: TrackerConfig,
    storage: Arc<dyn SessionStorage>,
    clock: SharedClock,
    current: tokio::sync::Mutex<Option<HubSession>>,
}

impl HubSessionTracker {
    /// Create a tracker. Nothing is read until first access.
    pub fn new(config: TrackerConfig, storage: Arc<dyn SessionStorage>, clock: SharedClock) -> Self {
        Self { config, storage, clock, current: tokio::sync::Mutex::new(None) }
    }

    /// Run a storage call on the blocking pool.
    async fn with_storage<T, F>(&self, call: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionStorage, &str) -> Result<T, StorageError> + Send + 'static,
    {
        let storage = self.storage.clone();
        let key = self.config.storage_key.clone();
        tokio::task::spawn_blocking(move || call(storage.as_ref(), &key))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))?
    }

    async fn load_persisted(&self) -> Option<HubSession> {
        let raw = match self.with_storage(|storage, key| storage.get(key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "failed to read hub session");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "discarding corrupt hub session");
                None
            }
        }
    }

    async fn persist(&self, session: &HubSession) -> Result<(), TrackerError> {
        let raw = serde_json::to_string(session)?;
        self.with_storage(move |storage, key| storage.set(key, &raw)).await?;
        Ok(())
    }

    async fn active(&self, current: &mut Option<HubSession>) -> Result<HubSession, TrackerError> {
        let now = self.clock.now();

        if let Some(session) = current.as_ref() {
            if !session.is_expired(now) {
                return Ok(session.clone());
            }
        }

        if let Some(session) = self.load_persisted().await {
            if !session.is_expired(now) {
                debug!(session_id = %session.session_id, "hub session restored");
                *current = Some(session.clone());
                return Ok(session);
            }
            info!(session_id = %session.session_id, "hub session expired, rotating");
        }

        let fresh = HubSession::fresh(now, self.config.lifetime);
        self.persist(&fresh).await?;
        info!(session_id = %fresh.session_id, expiry = %fresh.expiry_time, "hub session started");
        *current = Some(fresh.clone());
        Ok(fresh)
    }

    /// Active session, restoring or minting one as needed.
    ///
    /// An expired session is discarded and replaced by a fresh one.
    pub async fn ensure_session(&self) -> Result<HubSession, TrackerError> {
        let mut current = self.current.lock().await;
        self.active(&mut current).await
    }

    /// Append a finished game and update the aggregates.
    ///
    /// Storage is written before memory; on failure neither changes.
    pub async fn record_game_result(&self, game_id: &str, score: i64, time_ms: u64) -> Result<HubSession, TrackerError> {
        let mut current = self.current.lock().await;
        let session = self.active(&mut current).await?;

        let next = session.with_result(GameResult {
            game_id: game_id.to_string(),
            score,
            time_ms,
            timestamp: self.clock.now(),
        });
        self.persist(&next).await?;
        *current = Some(next.clone());

        debug!(game_id, score, time_ms, total = next.stats.total_games_played, "game result recorded");
        Ok(next)
    }

    /// In-memory session, if any was loaded.
    pub async fn current(&self) -> Option<HubSession> {
        self.current.lock().await.clone()
    }

    /// Discard the session in memory and in storage.
    pub async fn reset(&self) -> Result<(), TrackerError> {
        let mut current = self.current.lock().await;
        self.with_storage(|storage, key| storage.remove(key)).await?;
        *current = None;
        info!("hub session reset");
        Ok(())
    }
}
