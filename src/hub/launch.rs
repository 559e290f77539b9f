//! Launch Session Management
//!
//! Issues a short-lived credential for every game launch and walks it through
//! its lifecycle:
//!
//! ```text
//! PENDING --redeem--> ACTIVE --finish--> FINISHED
//!    |                  |
//!    +------------------+--lifetime elapsed--> EXPIRED
//! ```
//!
//! Terminal states are sticky. Expiry is evaluated lazily on every access and
//! by a periodic [`LaunchManager::sweep`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::clock::SharedClock;

/// Launch token length in bytes (64 hex characters).
pub const TOKEN_BYTES: usize = 32;

/// Attempts at drawing an unused id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

/// Purged session ids are remembered this many retention windows.
const TOMBSTONE_RETENTIONS: i32 = 4;

// =============================================================================
// TYPES
// =============================================================================

/// Launch session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchState {
    /// Issued, token not yet redeemed.
    Pending,
    /// Token redeemed, game running.
    Active,
    /// Finished with a result.
    Finished {
        /// Final score.
        score: i64,
        /// Play time in milliseconds.
        #[serde(rename = "timeMs")]
        time_ms: u64,
    },
    /// Lifetime elapsed without finish.
    Expired,
}

impl LaunchState {
    /// No further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LaunchState::Finished { .. } | LaunchState::Expired)
    }
}

/// Credential handed to the game for one launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchCredential {
    /// Opaque unique session id.
    pub session_id: String,
    /// Single-use bearer secret.
    pub launch_token: String,
    /// Absolute expiry time.
    pub expiry: DateTime<Utc>,
    /// Launching player.
    pub player_id: String,
}

/// Public view of a launch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSummary {
    /// Session id.
    pub session_id: String,
    /// Launched game.
    pub game_id: String,
    /// Launching player.
    pub player_id: String,
    /// Current state.
    pub state: LaunchState,
    /// Expiry time.
    pub expiry: DateTime<Utc>,
}

/// Result of a successful finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedSession {
    /// Session id.
    pub session_id: String,
    /// Launched game.
    pub game_id: String,
    /// Launching player.
    pub player_id: String,
    /// Final score.
    pub score: i64,
    /// Play time in milliseconds.
    pub time_ms: u64,
    /// When the finish was recorded.
    pub finished_at: DateTime<Utc>,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that expired during this sweep.
    pub expired: usize,
    /// Terminal sessions dropped after retention.
    pub purged: usize,
    /// Purged session ids no longer remembered.
    pub forgotten: usize,
}

/// Launch errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    /// Unknown session id.
    #[error("launch session not found")]
    NotFound,

    /// Lifetime elapsed.
    #[error("launch session expired")]
    SessionExpired,

    /// Session already finished.
    #[error("launch session already finished")]
    AlreadyFinished,

    /// Token does not match.
    #[error("invalid launch token")]
    InvalidToken,

    /// Token was already redeemed.
    #[error("launch token already used")]
    TokenAlreadyUsed,

    /// Could not draw an unused id.
    #[error("could not generate a unique id after {0} attempts")]
    IdExhausted(usize),
}

// =============================================================================
// ID GENERATION
// =============================================================================

/// Source of session ids and launch tokens.
pub trait IdSource: Send + Sync {
    /// New session id candidate.
    fn session_id(&self) -> String;
    /// New launch token candidate.
    fn token(&self) -> String;
}

/// UUID v4 session ids and CSPRNG hex tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn session_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn token(&self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill(&mut bytes);
        hex::encode(bytes)
    }
}

/// Constant-time token comparison.
pub fn tokens_match(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

fn draw_unique(
    taken: impl Fn(&str) -> bool,
    mut draw: impl FnMut() -> String,
) -> Result<String, LaunchError> {
    for attempt in 1..=MAX_ID_ATTEMPTS {
        let candidate = draw();
        if !taken(&candidate) {
            return Ok(candidate);
        }
        warn!(attempt, "id collision, retrying");
    }
    Err(LaunchError::IdExhausted(MAX_ID_ATTEMPTS))
}

// =============================================================================
// CONFIG
// =============================================================================

/// Launch session configuration.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Credential lifetime.
    pub token_lifetime: Duration,
    /// How long terminal sessions are kept before the sweep drops them.
    pub retention: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            token_lifetime: Duration::minutes(15),
            retention: Duration::hours(1),
        }
    }
}

impl LaunchConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            token_lifetime: std::env::var("HUB_TOKEN_LIFETIME_SECS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .map(|secs| Duration::seconds(i64::from(secs)))
                .unwrap_or(defaults.token_lifetime),
            retention: defaults.retention,
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

struct LaunchRecord {
    game_id: String,
    player_id: String,
    token: String,
    token_used: bool,
    expiry: DateTime<Utc>,
    state: LaunchState,
    closed_at: Option<DateTime<Utc>>,
}

impl LaunchRecord {
    /// Apply lazy expiry. Returns true if this call expired the record.
    fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.is_terminal() && now >= self.expiry {
            self.state = LaunchState::Expired;
            self.closed_at = Some(self.expiry);
            return true;
        }
        false
    }

    fn summary(&self, session_id: &str) -> LaunchSummary {
        LaunchSummary {
            session_id: session_id.to_string(),
            game_id: self.game_id.clone(),
            player_id: self.player_id.clone(),
            state: self.state,
            expiry: self.expiry,
        }
    }
}

#[derive(Default)]
struct LaunchBook {
    records: BTreeMap<String, LaunchRecord>,
    /// Tokens of held records.
    live_tokens: BTreeSet<String>,
    /// Purged session id -> when it may be forgotten.
    tombstones: BTreeMap<String, DateTime<Utc>>,
}

impl LaunchBook {
    fn session_taken(&self, session_id: &str) -> bool {
        self.records.contains_key(session_id) || self.tombstones.contains_key(session_id)
    }

    /// Live record, with lazy expiry applied. Tombstoned ids read as expired.
    fn record_mut(&mut self, session_id: &str, now: DateTime<Utc>) -> Result<&mut LaunchRecord, LaunchError> {
        match self.records.get_mut(session_id) {
            Some(record) => {
                if record.refresh(now) {
                    info!(session_id, "launch session expired");
                }
                Ok(record)
            }
            None if self.tombstones.contains_key(session_id) => Err(LaunchError::SessionExpired),
            None => Err(LaunchError::NotFound),
        }
    }
}

/// Issues and tracks launch credentials.
pub struct LaunchManager {
    config: LaunchConfig,
    clock: SharedClock,
    ids: Arc<dyn IdSource>,
    book: RwLock<LaunchBook>,
}

impl LaunchManager {
    /// Create a manager with random ids.
    pub fn new(config: LaunchConfig, clock: SharedClock) -> Self {
        Self::with_ids(config, clock, Arc::new(RandomIds))
    }

    /// Create a manager with a custom id source.
    pub fn with_ids(config: LaunchConfig, clock: SharedClock, ids: Arc<dyn IdSource>) -> Self {
        Self { config, clock, ids, book: RwLock::new(LaunchBook::default()) }
    }

    /// Manager configuration.
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Issue a fresh credential for one launch.
    pub async fn start_session(&self, game_id: &str, player_id: &str) -> Result<LaunchCredential, LaunchError> {
        let mut book = self.book.write().await;

        let session_id = draw_unique(|id| book.session_taken(id), || self.ids.session_id())?;
        let token = draw_unique(|t| book.live_tokens.contains(t), || self.ids.token())?;
        let expiry = self.clock.now() + self.config.token_lifetime;

        book.live_tokens.insert(token.clone());
        book.records.insert(
            session_id.clone(),
            LaunchRecord {
                game_id: game_id.to_string(),
                player_id: player_id.to_string(),
                token: token.clone(),
                token_used: false,
                expiry,
                state: LaunchState::Pending,
                closed_at: None,
            },
        );

        info!(%session_id, game_id, player_id, %expiry, "launch session issued");

        Ok(LaunchCredential {
            session_id,
            launch_token: token,
            expiry,
            player_id: player_id.to_string(),
        })
    }

    /// Redeem the single-use token, activating the session.
    pub async fn redeem(&self, session_id: &str, token: &str) -> Result<LaunchSummary, LaunchError> {
        let now = self.clock.now();
        let mut book = self.book.write().await;
        let record = book.record_mut(session_id, now)?;

        if !tokens_match(token, &record.token) {
            warn!(session_id, "launch token mismatch");
            return Err(LaunchError::InvalidToken);
        }
        match record.state {
            LaunchState::Expired => return Err(LaunchError::SessionExpired),
            LaunchState::Finished { .. } => return Err(LaunchError::AlreadyFinished),
            _ if record.token_used => return Err(LaunchError::TokenAlreadyUsed),
            _ => {}
        }

        record.token_used = true;
        record.state = LaunchState::Active;
        debug!(session_id, "launch token redeemed");
        Ok(record.summary(session_id))
    }

    /// Record the terminal result. Only the first finish counts.
    pub async fn finish(&self, session_id: &str, score: i64, time_ms: u64) -> Result<FinishedSession, LaunchError> {
        let now = self.clock.now();
        let mut book = self.book.write().await;
        let record = book.record_mut(session_id, now)?;

        match record.state {
            LaunchState::Expired => return Err(LaunchError::SessionExpired),
            LaunchState::Finished { .. } => return Err(LaunchError::AlreadyFinished),
            LaunchState::Pending => {
                debug!(session_id, "implicit activation on finish");
                record.token_used = true;
            }
            LaunchState::Active => {}
        }

        record.state = LaunchState::Finished { score, time_ms };
        record.closed_at = Some(now);
        info!(session_id, game_id = %record.game_id, score, time_ms, "launch session finished");

        Ok(FinishedSession {
            session_id: session_id.to_string(),
            game_id: record.game_id.clone(),
            player_id: record.player_id.clone(),
            score,
            time_ms,
            finished_at: now,
        })
    }

    /// Current view of a session.
    pub async fn state(&self, session_id: &str) -> Option<LaunchSummary> {
        let now = self.clock.now();
        let mut book = self.book.write().await;
        book.record_mut(session_id, now).ok().map(|r| r.summary(session_id))
    }

    /// Fail with `SessionExpired` if the session is known to be expired.
    ///
    /// Ids never issued by this manager pass; finished sessions pass so late
    /// flushes still land.
    pub async fn ensure_live(&self, session_id: &str) -> Result<(), LaunchError> {
        let now = self.clock.now();
        let mut book = self.book.write().await;
        match book.record_mut(session_id, now) {
            Ok(record) if record.state == LaunchState::Expired => Err(LaunchError::SessionExpired),
            Ok(_) | Err(LaunchError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Expire overdue sessions, drop terminal ones past retention and
    /// forget tombstones past their window.
    ///
    /// A purged id keeps reading as expired for `TOMBSTONE_RETENTIONS`
    /// retention windows, then reads as unknown.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let retention = self.config.retention;
        let remember_for = retention * TOMBSTONE_RETENTIONS;
        let mut report = SweepReport::default();

        let mut guard = self.book.write().await;
        let book = &mut *guard;

        for record in book.records.values_mut() {
            if record.refresh(now) {
                report.expired += 1;
            }
        }

        let purged: Vec<String> = book
            .records
            .iter()
            .filter(|(_, record)| record.closed_at.is_some_and(|closed_at| closed_at + retention <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in purged {
            if let Some(record) = book.records.remove(&session_id) {
                book.live_tokens.remove(&record.token);
                book.tombstones.insert(session_id, now + remember_for);
                report.purged += 1;
            }
        }

        let before = book.tombstones.len();
        book.tombstones.retain(|_, forget_at| *forget_at > now);
        report.forgotten = before - book.tombstones.len();

        if report.expired > 0 || report.purged > 0 || report.forgotten > 0 {
            debug!(
                expired = report.expired,
                purged = report.purged,
                forgotten = report.forgotten,
                "launch sweep"
            );
        }
        report
    }

    /// Number of sessions held in memory.
    pub async fn count(&self) -> usize {
        self.book.read().await.records.len()
    }

    /// Session ids and tokens remembered for uniqueness and expiry checks.
    pub async fn remembered(&self) -> (usize, usize) {
        let book = self.book.read().await;
        (book.records.len() + book.tombstones.len(), book.live_tokens.len())
    }
}

// =============================================================================
// TESTS
// =============================================================================
