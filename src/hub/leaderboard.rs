//! Per-game leaderboards built from finished launch sessions.
//!
//! Ranks are derived on every query: sorted by score descending, ties broken
//! by the earlier timestamp and then by player id, numbered 1..N.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::clock::SharedClock;

/// Default number of entries returned.
pub const DEFAULT_LIMIT: usize = 100;

/// Ranking window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Period {
    /// Last 24 hours.
    Daily,
    /// Last 7 days.
    Weekly,
    /// Last 30 days.
    Monthly,
    /// Everything.
    AllTime,
}

impl Period {
    /// Rolling window length, `None` for all-time.
    pub fn window(self) -> Option<Duration> {
        match self {
            Period::Daily => Some(Duration::days(1)),
            Period::Weekly => Some(Duration::days(7)),
            Period::Monthly => Some(Duration::days(30)),
            Period::AllTime => None,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
            Period::AllTime => "all-time",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown period name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown leaderboard period: {0}")]
pub struct PeriodParseError(pub String);

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Period::Daily),
            "weekly" => Ok(Period::Weekly),
            "monthly" => Ok(Period::Monthly),
            "all-time" => Ok(Period::AllTime),
            other => Err(PeriodParseError(other.to_string())),
        }
    }
}

/// One ranked row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    /// Player id.
    pub player_id: String,
    /// Display name.
    pub player_name: String,
    /// Best score in the period.
    pub score: i64,
    /// 1-based rank.
    pub rank: u32,
    /// When the score was achieved.
    pub timestamp: DateTime<Utc>,
}

/// Leaderboard query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardSnapshot {
    /// Game id.
    pub game_id: String,
    /// Period queried.
    pub period: Period,
    /// Ranked entries.
    pub entries: Vec<LeaderboardEntry>,
    /// Query time.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Score {
    score: i64,
    at: DateTime<Utc>,
}

impl Score {
    /// Higher score wins; the earlier one wins a tie.
    fn beats(&self, other: &Score) -> bool {
        match self.score.cmp(&other.score) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.at < other.at,
        }
    }
}

#[derive(Debug)]
struct PlayerScores {
    name: String,
    best: Score,
    recent: Vec<Score>,
}

/// All leaderboards.
pub struct Leaderboard {
    clock: SharedClock,
    games: RwLock<BTreeMap<String, BTreeMap<String, PlayerScores>>>,
}

impl Leaderboard {
    /// Empty leaderboard.
    pub fn new(clock: SharedClock) -> Self {
        Self { clock, games: RwLock::new(BTreeMap::new()) }
    }

    /// Record a finished game.
    pub async fn record(&self, game_id: &str, player_id: &str, player_name: &str, score: i64, at: DateTime<Utc>) {
        let horizon = self.clock.now() - Duration::days(30);
        let entry = Score { score, at };
        let mut games = self.games.write().await;

        let players = games.entry(game_id.to_string()).or_default();
        match players.get_mut(player_id) {
            Some(scores) => {
                scores.name = player_name.to_string();
                if entry.beats(&scores.best) {
                    scores.best = entry;
                }
                scores.recent.retain(|s| s.at >= horizon);
                scores.recent.push(entry);
            }
            None => {
                players.insert(
                    player_id.to_string(),
                    PlayerScores { name: player_name.to_string(), best: entry, recent: vec![entry] },
                );
            }
        }
        debug!(game_id, player_id, score, "leaderboard score recorded");
    }

    /// Ranked standings for one game and period.
    pub async fn standings(&self, game_id: &str, period: Period, limit: usize) -> LeaderboardSnapshot {
        let now = self.clock.now();
        let since = period.window().map(|w| now - w);
        let games = self.games.read().await;

        let mut rows: Vec<(&str, &str, Score)> = games
            .get(game_id)
            .into_iter()
            .flat_map(|players| players.iter())
            .filter_map(|(player_id, scores)| {
                let best = match since {
                    None => Some(scores.best),
                    Some(since) => scores
                        .recent
                        .iter()
                        .filter(|s| s.at >= since)
                        .fold(None, |best: Option<Score>, s| match best {
                            Some(b) if !s.beats(&b) => Some(b),
                            _ => Some(*s),
                        }),
                };
                best.map(|b| (player_id.as_str(), scores.name.as_str(), b))
            })
            .collect();

        rows.sort_by(|a, b| {
            b.2.score
                .cmp(&a.2.score)
                .then_with(|| a.2.at.cmp(&b.2.at))
                .then_with(|| a.0.cmp(b.0))
        });

        let entries = rows
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, (player_id, name, s))| LeaderboardEntry {
                player_id: player_id.to_string(),
                player_name: name.to_string(),
                score: s.score,
                rank: u32::try_from(i + 1).unwrap_or(u32::MAX),
                timestamp: s.at,
            })
            .collect();

        LeaderboardSnapshot { game_id: game_id.to_string(), period, entries, updated_at: now }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{Clock, ManualClock};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn board() -> (Leaderboard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (Leaderboard::new(clock.clone()), clock)
    }

    #[test]
    fn test_period_names() {
        for period in [Period::Daily, Period::Weekly, Period::Monthly, Period::AllTime] {
            assert_eq!(period.as_str().parse::<Period>().unwrap(), period);
            assert_eq!(serde_json::to_value(period).unwrap(), period.as_str());
        }
        assert!("yearly".parse::<Period>().is_err());
    }

    #[tokio::test]
    async fn test_ranks_descending_and_contiguous() {
        let (board, clock) = board();
        let now = clock.now();
        board.record("g", "a", "Ada", 300, now).await;
        board.record("g", "b", "Bo", 500, now).await;
        board.record("g", "c", "Cy", 100, now).await;
        board.record("other", "d", "Di", 900, now).await;

        let snap = board.standings("g", Period::AllTime, DEFAULT_LIMIT).await;
        let rows: Vec<_> = snap.entries.iter().map(|e| (e.rank, e.player_id.as_str(), e.score)).collect();
        assert_eq!(rows, vec![(1, "b", 500), (2, "a", 300), (3, "c", 100)]);
    }

    #[tokio::test]
    async fn test_best_score_per_player() {
        let (board, clock) = board();
        let now = clock.now();
        board.record("g", "a", "Ada", 300, now).await;
        board.record("g", "a", "Ada", 200, now).await;
        board.record("g", "a", "Ada", 400, now).await;

        let snap = board.standings("g", Period::Daily, DEFAULT_LIMIT).await;
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(snap.entries[0].score, 400);
    }

    #[tokio::test]
    async fn test_tie_goes_to_earlier_score() {
        let (board, clock) = board();
        let now = clock.now();
        board.record("g", "late", "Late", 100, now).await;
        board.record("g", "early", "Early", 100, now - Duration::minutes(1)).await;

        let snap = board.standings("g", Period::AllTime, DEFAULT_LIMIT).await;
        assert_eq!(snap.entries[0].player_id, "early");
    }

    #[tokio::test]
    async fn test_periods_filter_by_age() {
        let (board, clock) = board();
        let now = clock.now();
        board.record("g", "old", "Old", 900, now - Duration::days(10)).await;
        board.record("g", "week", "Week", 500, now - Duration::days(3)).await;
        board.record("g", "today", "Today", 100, now - Duration::hours(2)).await;

        let ids = |snap: LeaderboardSnapshot| snap.entries.into_iter().map(|e| e.player_id).collect::<Vec<_>>();
        assert_eq!(ids(board.standings("g", Period::Daily, 10).await), vec!["today"]);
        assert_eq!(ids(board.standings("g", Period::Weekly, 10).await), vec!["week", "today"]);
        assert_eq!(ids(board.standings("g", Period::Monthly, 10).await), vec!["old", "week", "today"]);
        assert_eq!(ids(board.standings("g", Period::AllTime, 1).await), vec!["old"]);
    }

    #[tokio::test]
    async fn test_unknown_game_is_empty() {
        let (board, _) = board();
        let snap = board.standings("nope", Period::Weekly, 10).await;
        assert!(snap.entries.is_empty());
        assert_eq!(snap.period, Period::Weekly);
    }

    proptest! {
        #[test]
        fn prop_ranks_contiguous(scores in proptest::collection::vec(-1000i64..1000, 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (board, clock) = board();
                let now = clock.now();
                for (i, score) in scores.iter().enumerate() {
                    board.record("g", &format!("p{i}"), "P", *score, now).await;
                }
                let snap = board.standings("g", Period::AllTime, usize::MAX).await;
                prop_assert_eq!(snap.entries.len(), scores.len());
                for (i, pair) in snap.entries.windows(2).enumerate() {
                    prop_assert!(pair[0].score >= pair[1].score);
                    prop_assert_eq!(pair[0].rank as usize, i + 1);
                }
                Ok(())
            })?;
        }
    }
}
