//! Shared hub services.
//!
//! One explicit bundle of every server-side manager, built once at startup
//! and handed to the router and the game host. There is no ambient global.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::core::clock::SharedClock;
use crate::hub::launch::{FinishedSession, LaunchConfig, LaunchError, LaunchManager};
use crate::hub::leaderboard::Leaderboard;
use crate::hub::loader::ModuleLoader;
use crate::hub::manifest::ManifestRegistry;
use crate::hub::progress::{MemoryProgressStore, ProgressBridge, ProgressStore};
use crate::hub::telemetry::{LogSink, TelemetryAggregator, TelemetrySink};

/// Every server-side manager.
pub struct HubServices {
    /// Game catalog.
    pub registry: Arc<ManifestRegistry>,
    /// Module resolution.
    pub loader: Arc<ModuleLoader>,
    /// Launch credentials.
    pub launches: Arc<LaunchManager>,
    /// Progress save/load.
    pub progress: Arc<ProgressBridge>,
    /// Telemetry intake.
    pub telemetry: Arc<TelemetryAggregator>,
    /// Rankings.
    pub leaderboard: Arc<Leaderboard>,
    /// Time source.
    pub clock: SharedClock,
}

impl HubServices {
    /// Build services with in-memory progress and log-only telemetry.
    pub fn new(registry: ManifestRegistry, loader: ModuleLoader, launch_config: LaunchConfig, clock: SharedClock) -> Self {
        Self::with_backends(
            registry,
            loader,
            launch_config,
            clock,
            Arc::new(MemoryProgressStore::new()),
            Arc::new(LogSink),
        )
    }

    /// Build services over explicit progress and telemetry backends.
    pub fn with_backends(
        registry: ManifestRegistry,
        loader: ModuleLoader,
        launch_config: LaunchConfig,
        clock: SharedClock,
        progress_store: Arc<dyn ProgressStore>,
        telemetry_sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let launches = Arc::new(LaunchManager::new(launch_config, clock.clone()));
        Self {
            registry: Arc::new(registry),
            loader: Arc::new(loader),
            progress: Arc::new(ProgressBridge::new(progress_store, launches.clone(), clock.clone())),
            telemetry: Arc::new(TelemetryAggregator::new(telemetry_sink, launches.clone())),
            leaderboard: Arc::new(Leaderboard::new(clock.clone())),
            launches,
            clock,
        }
    }

    /// Finish a launch session and feed its result downstream.
    ///
    /// The finish itself is authoritative. A progress blob, when given, is
    /// saved afterwards; a failed save is logged and does not undo the finish.
    pub async fn finish_session(
        &self,
        session_id: &str,
        score: i64,
        time_ms: u64,
        progress: Option<Value>,
        player_name: Option<&str>,
    ) -> Result<FinishedSession, LaunchError> {
        let finished = self.launches.finish(session_id, score, time_ms).await?;

        if let Some(data) = progress.filter(|d| !d.is_null()) {
            if let Err(e) = self.progress.save(&finished.game_id, session_id, data, None).await {
                warn!(session_id, error = %e, "progress save on finish failed");
            }
        }

        self.leaderboard
            .record(
                &finished.game_id,
                &finished.player_id,
                player_name.unwrap_or(&finished.player_id),
                score,
                finished.finished_at,
            )
            .await;

        Ok(finished)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::hub::leaderboard::Period;
    use crate::hub::loader::{tests::chain_fetcher, LoaderConfig};
    use crate::hub::manifest::tests::manifest;
    use crate::hub::manifest::GameManifest;
    use serde_json::json;

    pub(crate) fn services() -> (HubServices, Arc<ManualClock>) {
        services_with(vec![manifest("math-blitz"), manifest("word-hunt")])
    }

    pub(crate) fn services_with(manifests: Vec<GameManifest>) -> (HubServices, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = ManifestRegistry::new(manifests).unwrap();
        let loader = ModuleLoader::new(
            Arc::new(chain_fetcher()),
            LoaderConfig {
                public_url: crate::hub::loader::tests::BASE.to_string(),
                ..Default::default()
            },
        );
        (HubServices::new(registry, loader, LaunchConfig::default(), clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_finish_feeds_progress_and_leaderboard() {
        let (hub, _) = services();
        let cred = hub.launches.start_session("math-blitz", "p1").await.unwrap();

        let done = hub
            .finish_session(&cred.session_id, 500, 42_000, Some(json!({"level": 3})), Some("Ada"))
            .await
            .unwrap();
        assert_eq!(done.score, 500);

        let saved = hub.progress.load("math-blitz", &cred.session_id).await.unwrap().unwrap();
        assert_eq!(saved.data, json!({"level": 3}));

        let board = hub.leaderboard.standings("math-blitz", Period::Daily, 10).await;
        assert_eq!(board.entries[0].player_name, "Ada");
    }

    #[tokio::test]
    async fn test_second_finish_rejected_without_side_effects() {
        let (hub, _) = services();
        let cred = hub.launches.start_session("math-blitz", "p1").await.unwrap();
        hub.finish_session(&cred.session_id, 10, 1, None, None).await.unwrap();

        assert_eq!(
            hub.finish_session(&cred.session_id, 99, 1, None, None).await,
            Err(LaunchError::AlreadyFinished)
        );
        let board = hub.leaderboard.standings("math-blitz", Period::AllTime, 10).await;
        assert_eq!(board.entries.len(), 1);
        assert_eq!(board.entries[0].score, 10);
        assert_eq!(board.entries[0].player_name, "p1");
    }
}
