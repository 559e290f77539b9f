//! Game hub components.
//!
//! Leaves first: the manifest registry, the module loader and launch
//! sessions. The control channel, telemetry, progress and hub session
//! tracker sit on top, and [`host::GameHost`] drives them through a launch.

pub mod control;
pub mod host;
pub mod instance;
pub mod launch;
pub mod leaderboard;
pub mod loader;
pub mod manifest;
pub mod progress;
pub mod services;
pub mod telemetry;
pub mod tracker;

// Re-export hub types
pub use control::{ControlChannel, GameEvent, HostCommand, Lifecycle, SessionOutcome, Transport};
pub use host::{GameHost, HostError, LaunchHandle, LaunchRequest};
pub use instance::{GameContainer, GameInstance, LaunchContext};
pub use launch::{LaunchConfig, LaunchCredential, LaunchError, LaunchManager, LaunchState};
pub use leaderboard::{Leaderboard, LeaderboardEntry, LeaderboardSnapshot, Period};
pub use loader::{GameFactory, LoadError, LoaderConfig, ModuleLoader, Runtime, StageName};
pub use manifest::{DiscoveryFilter, GameManifest, ManifestRegistry, RegistryError, RuntimeKind};
pub use progress::{ProgressBridge, ProgressError, ProgressRecord};
pub use services::HubServices;
pub use telemetry::{TelemetryAggregator, TelemetryError, TelemetryEvent};
pub use tracker::{HubSession, HubSessionTracker, TrackerConfig, TrackerError};
