//! Core primitives shared by every hub component.
//!
//! Nothing here knows about games or sessions: time, versions and
//! deterministic cohort hashing.

pub mod clock;
pub mod hash;
pub mod version;

// Re-export core types
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use hash::{in_rollout, rollout_bucket};
pub use version::{Version, VersionParseError};
