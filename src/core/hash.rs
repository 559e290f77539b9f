//! Cohort Hashing
//!
//! Deterministic hashing used for staged rollouts:
//! - Stable (playerId, gameId) cohort buckets
//! - Domain separation so rollout buckets never correlate with other hashes
//!
//! The same inputs produce the same bucket on every node and every restart,
//! so a player's inclusion in a partial rollout never flickers between requests.

use sha2::{Digest, Sha256};

/// Hash output type (256 bits / 32 bytes)
pub type Digest256 = [u8; 32];

/// Number of rollout buckets. Percentages map 1:1 onto buckets.
pub const ROLLOUT_BUCKETS: u64 = 100;

/// Domain-separated SHA-256 hasher.
///
/// Order of updates is significant. Variable-length fields are
/// length-prefixed so `("ab", "c")` and `("a", "bc")` never collide.
pub struct CohortHasher {
    hasher: Sha256,
}

impl CohortHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for rollout cohorts.
    pub fn for_rollout() -> Self {
        Self::new(b"GAME_HUB_ROLLOUT_V1")
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a length-prefixed string.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> Digest256 {
        self.hasher.finalize().into()
    }
}

/// Rollout bucket (0..100) for a player and game.
pub fn rollout_bucket(player_id: &str, game_id: &str) -> u8 {
    let mut hasher = CohortHasher::for_rollout();
    hasher.update_str(player_id);
    hasher.update_str(game_id);
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(head) % ROLLOUT_BUCKETS) as u8
}

/// Whether a player falls inside a rollout percentage for a game.
///
/// 0% never includes anyone, 100% always includes everyone.
pub fn in_rollout(player_id: &str, game_id: &str, percentage: u8) -> bool {
    if percentage >= 100 {
        return true;
    }
    rollout_bucket(player_id, game_id) < percentage
}

// =============================================================================
// TESTS
// =============================================================================
