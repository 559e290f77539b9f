//! # Game Hub
//!
//! Runtime that lets a host application discover, launch and supervise
//! third-party mini-games behind one lifecycle protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           GAME HUB                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  core/              - Shared primitives                      │
//! │  ├── clock.rs       - Injectable time source                 │
//! │  ├── hash.rs        - Stable rollout cohorts                 │
//! │  └── version.rs     - Semantic versions                      │
//! │                                                              │
//! │  hub/               - Game lifecycle                         │
//! │  ├── manifest.rs    - Catalog, discovery gates               │
//! │  ├── loader.rs      - Runtime kinds, module resolution       │
//! │  ├── instance.rs    - Containers and live game instances     │
//! │  ├── launch.rs      - Single-use launch credentials          │
//! │  ├── control.rs     - Host/game command and event channel    │
//! │  ├── telemetry.rs   - Event batch aggregation                │
//! │  ├── tracker.rs     - Persisted hub session stats            │
//! │  ├── progress.rs    - Save/load bridge                       │
//! │  ├── leaderboard.rs - Per-period standings                   │
//! │  ├── services.rs    - Shared service bundle                  │
//! │  └── host.rs        - Launch orchestration                   │
//! │                                                              │
//! │  network/           - JSON API                               │
//! │  ├── protocol.rs    - Request/response envelopes             │
//! │  ├── routes.rs      - Router and status mapping              │
//! │  ├── modules.rs     - esm-module chain endpoints             │
//! │  ├── auth.rs        - JWT identity                           │
//! │  ├── http.rs        - HTTP front                             │
//! │  └── server.rs      - HTTP and WebSocket listeners           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Isolation
//!
//! `iframe-html` games never run code in the host: they talk to it only
//! through posted messages, and messages from any other window are dropped.
//! `esm-module` games share the host context and talk through a direct port.
//! Both speak the same [`hub::HostCommand`] and [`hub::GameEvent`] vocabulary.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod hub;
pub mod network;

// Re-export commonly used types
pub use crate::core::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use crate::core::version::Version;
pub use hub::{GameHost, GameManifest, HubServices, LaunchCredential, ManifestRegistry};
pub use network::{ApiRequest, ApiResponse, ApiRouter, HubServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hub protocol version spoken by this build.
pub const HUB_PROTOCOL_VERSION: Version = Version::new(1, 2, 0);
