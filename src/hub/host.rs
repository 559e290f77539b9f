//! Game Host
//!
//! Supervises one container through a full launch:
//!
//! ```text
//! resolve manifest -> load runtime -> issue credential -> init instance
//!        |                 |
//!        +-- abort --------+-- nothing created
//!
//! READY           -> redeem launch token
//! PROGRESS_UPDATE -> save progress
//! COMPLETE        -> finish launch, record hub stats and leaderboard
//! QUIT / navigate -> destroy instance, settle Finished or Abandoned
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::version::Version;
use crate::hub::control::{
    ControlChannel, ControlError, GameEvent, HostCommand, HostLink, InboundSender, Lifecycle,
    PostedMessage, SessionOutcome, Transport,
};
use crate::hub::instance::{ContainerError, GameContainer, LaunchContext, ModulePort};
use crate::hub::launch::{LaunchCredential, LaunchError};
use crate::hub::loader::LoadError;
use crate::hub::manifest::RegistryError;
use crate::hub::services::HubServices;
use crate::hub::tracker::HubSessionTracker;

/// Host errors.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Manifest lookup or gating failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Runtime could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Credential could not be issued.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Container still occupied.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Command rejected by the control channel.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Nothing is running.
    #[error("no active game")]
    NoActiveGame,
}

/// What to launch and for whom.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Game to launch.
    pub game_id: String,
    /// Launching player.
    pub player_id: String,
    /// Display name for the leaderboard.
    pub player_name: Option<String>,
    /// Declared hub protocol version.
    pub hub_version: Option<Version>,
}

impl LaunchRequest {
    /// Launch `game_id` for `player_id`.
    pub fn new(game_id: impl Into<String>, player_id: impl Into<String>) -> Self {
        Self { game_id: game_id.into(), player_id: player_id.into(), player_name: None, hub_version: None }
    }
}

/// Handed back to the embedder after a launch.
#[derive(Debug)]
pub struct LaunchHandle {
    /// Issued credential.
    pub credential: LaunchCredential,
    /// How the instance is reached.
    pub transport: Transport,
    /// Where the embedder pushes messages arriving from the game window.
    pub inbound: InboundSender,
    /// Component side of an in-process module instance.
    pub module_port: Option<ModulePort>,
}

struct ActiveGame {
    game_id: String,
    player_name: Option<String>,
    credential: LaunchCredential,
    channel: ControlChannel,
    finished: bool,
}

/// Supervisor of one game container.
pub struct GameHost {
    services: Arc<HubServices>,
    tracker: Arc<HubSessionTracker>,
    link: HostLink,
    container: GameContainer,
    active: Option<ActiveGame>,
}

impl GameHost {
    /// Create a host and the stream of frames it posts to embedded windows.
    pub fn new(
        services: Arc<HubServices>,
        tracker: Arc<HubSessionTracker>,
        container_id: &str,
    ) -> (Self, mpsc::UnboundedReceiver<PostedMessage>) {
        let (link, posted) = HostLink::new();
        let host = Self {
            services,
            tracker,
            link,
            container: GameContainer::new(container_id),
            active: None,
        };
        (host, posted)
    }

    /// The managed container.
    pub fn container(&self) -> &GameContainer {
        &self.container
    }

    /// Lifecycle of the running game.
    pub fn lifecycle(&self) -> Option<&Lifecycle> {
        self.active.as_ref().map(|a| a.channel.lifecycle())
    }

    /// Launch session of the running game.
    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.credential.session_id.as_str())
    }

    /// Launch a game, tearing down whatever was running.
    ///
    /// Resolution and loading happen before any credential is issued, so a
    /// failed load leaves no launch state behind.
    pub async fn launch(&mut self, request: LaunchRequest) -> Result<LaunchHandle, HostError> {
        if self.active.is_some() {
            self.close().await;
        }

        let services = self.services.clone();
        let manifest = services
            .registry
            .resolve_launchable(&request.game_id, &request.player_id, request.hub_version.as_ref())?;

        let runtime = services.loader.runtime_for(manifest);
        let factory = services.loader.load(&runtime).await?;

        if let Err(e) = self.tracker.ensure_session().await {
            warn!(error = %e, "hub session unavailable");
        }

        let credential = services.launches.start_session(&manifest.id, &request.player_id).await?;
        let context = LaunchContext {
            game_id: manifest.id.clone(),
            session_id: credential.session_id.clone(),
            player_id: request.player_id.clone(),
            launch_token: credential.launch_token.clone(),
        };

        let mounted = factory.init(&mut self.container, &context, &self.link)?;
        let channel = ControlChannel::new(mounted.transport);
        let mut module_port = mounted.module_port;
        if let Some(port) = module_port.as_mut() {
            port.connect(channel.inbound());
        }

        info!(
            game_id = %manifest.id,
            session_id = %credential.session_id,
            runtime = ?factory.kind(),
            "game launched"
        );

        let handle = LaunchHandle {
            credential: credential.clone(),
            transport: mounted.transport,
            inbound: channel.inbound(),
            module_port,
        };
        self.active = Some(ActiveGame {
            game_id: manifest.id.clone(),
            player_name: request.player_name,
            credential,
            channel,
            finished: false,
        });
        Ok(handle)
    }

    /// Wait for the next trusted event and act on it.
    pub async fn next_event(&mut self) -> Option<GameEvent> {
        let event = self.active.as_mut()?.channel.next_event().await?;
        self.handle(&event).await;
        Some(event)
    }

    /// Act on every event already queued.
    pub async fn pump(&mut self) -> Vec<GameEvent> {
        let events = match self.active.as_mut() {
            Some(active) => active.channel.drain(),
            None => return Vec::new(),
        };
        for event in &events {
            self.handle(event).await;
        }
        events
    }

    async fn handle(&mut self, event: &GameEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let session_id = active.credential.session_id.clone();

        match event {
            GameEvent::Ready => {
                if let Err(e) = self.services.launches.redeem(&session_id, &active.credential.launch_token).await {
                    warn!(%session_id, error = %e, "launch token redemption failed");
                }
            }
            GameEvent::ProgressUpdate { blob } => {
                if let Err(e) = self.services.progress.save(&active.game_id, &session_id, blob.clone(), None).await {
                    warn!(%session_id, error = %e, "progress update not saved");
                }
            }
            GameEvent::Complete { score, time_ms } => {
                record_finish(&self.services, &self.tracker, active, *score, *time_ms).await;
            }
            GameEvent::ScoreUpdate { .. } | GameEvent::Error { .. } => {}
        }
    }

    /// Send a command to the running game.
    ///
    /// `QUIT` tears the game down and returns its outcome.
    pub async fn command(&mut self, command: HostCommand) -> Result<Option<SessionOutcome>, HostError> {
        if self.active.is_none() {
            return Err(HostError::NoActiveGame);
        }
        if command == HostCommand::Quit {
            self.pump().await;
        }

        let Some(active) = self.active.as_mut() else {
            return Err(HostError::NoActiveGame);
        };
        match active.channel.command(&mut self.container, command)? {
            Some(outcome) => {
                self.settle(outcome.clone()).await;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    /// Tear down the running game, e.g. on navigation.
    pub async fn close(&mut self) -> Option<SessionOutcome> {
        self.pump().await;
        let outcome = self.active.as_mut()?.channel.teardown(&mut self.container);
        self.settle(outcome.clone()).await;
        Some(outcome)
    }

    async fn settle(&mut self, outcome: SessionOutcome) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        match outcome {
            SessionOutcome::Finished { score, time_ms } => {
                record_finish(&self.services, &self.tracker, &mut active, score, time_ms).await;
            }
            SessionOutcome::Abandoned { last_error } => {
                info!(
                    game_id = %active.game_id,
                    session_id = %active.credential.session_id,
                    last_error = last_error.as_deref().unwrap_or(""),
                    "game abandoned"
                );
            }
        }
    }
}

async fn record_finish(
    services: &HubServices,
    tracker: &HubSessionTracker,
    active: &mut ActiveGame,
    score: i64,
    time_ms: u64,
) {
    if active.finished {
        return;
    }
    active.finished = true;

    let session_id = &active.credential.session_id;
    if let Err(e) = services
        .finish_session(session_id, score, time_ms, None, active.player_name.as_deref())
        .await
    {
        warn!(%session_id, error = %e, "launch finish rejected");
        return;
    }
    if let Err(e) = tracker.record_game_result(&active.game_id, score, time_ms).await {
        warn!(%session_id, error = %e, "hub stats not recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::hub::control::{Inbound, WindowHandle};
    use crate::hub::launch::LaunchState;
    use crate::hub::leaderboard::Period;
    use crate::hub::manifest::tests::manifest;
    use crate::hub::manifest::RuntimeKind;
    use crate::hub::services::tests::{services, services_with};
    use crate::hub::tracker::{MemoryStorage, TrackerConfig};
    use serde_json::json;

    fn host_over(hub: HubServices, clock: Arc<ManualClock>) -> (GameHost, mpsc::UnboundedReceiver<PostedMessage>, Arc<HubServices>, Arc<HubSessionTracker>) {
        let tracker = Arc::new(HubSessionTracker::new(TrackerConfig::default(), Arc::new(MemoryStorage::new()), clock));
        let hub = Arc::new(hub);
        let (host, posted) = GameHost::new(hub.clone(), tracker.clone(), "main");
        (host, posted, hub, tracker)
    }

    fn frame(window: WindowHandle, event: GameEvent) -> Inbound {
        Inbound::Posted { source: window, data: event.to_json().unwrap() }
    }

    fn window_of(handle: &LaunchHandle) -> WindowHandle {
        match handle.transport {
            Transport::Iframe { window } => window,
            Transport::Module => panic!("expected iframe transport"),
        }
    }

    #[tokio::test]
    async fn test_iframe_game_full_lifecycle() {
        let (hub, clock) = services();
        let (mut host, mut posted, hub, tracker) = host_over(hub, clock);

        let mut request = LaunchRequest::new("math-blitz", "p1");
        request.player_name = Some("Ada".into());
        let handle = host.launch(request).await.unwrap();
        let window = window_of(&handle);
        let sid = handle.credential.session_id.clone();

        match posted.recv().await.unwrap() {
            PostedMessage::Open { url, .. } => assert!(url.contains(&format!("sessionId={sid}"))),
            other => panic!("unexpected frame {other:?}"),
        }

        handle.inbound.send(frame(window, GameEvent::Ready)).unwrap();
        handle.inbound.send(frame(window, GameEvent::ScoreUpdate { delta: 500 })).unwrap();
        handle.inbound.send(frame(window, GameEvent::ProgressUpdate { blob: json!({"level": 4}) })).unwrap();
        handle.inbound.send(frame(window, GameEvent::Complete { score: 500, time_ms: 42_000 })).unwrap();
        assert_eq!(host.pump().await.len(), 4);

        let state = hub.launches.state(&sid).await.unwrap().state;
        assert_eq!(state, LaunchState::Finished { score: 500, time_ms: 42_000 });
        let progress = hub.progress.load("math-blitz", &sid).await.unwrap().unwrap();
        assert_eq!(progress.data, json!({"level": 4}));
        let board = hub.leaderboard.standings("math-blitz", Period::Daily, 10).await;
        assert_eq!(board.entries[0].player_name, "Ada");

        let outcome = host.command(HostCommand::Quit).await.unwrap();
        assert_eq!(outcome, Some(SessionOutcome::Finished { score: 500, time_ms: 42_000 }));
        assert!(!host.container().is_occupied());
        assert_eq!(tracker.current().await.unwrap().stats.total_games_played, 1);

        assert!(matches!(posted.recv().await.unwrap(), PostedMessage::Command { .. }));
        assert!(matches!(posted.recv().await.unwrap(), PostedMessage::Close { .. }));
    }

    #[tokio::test]
    async fn test_teardown_without_complete_is_abandoned() {
        let (hub, clock) = services();
        let (mut host, _posted, hub, tracker) = host_over(hub, clock);

        let handle = host.launch(LaunchRequest::new("math-blitz", "p1")).await.unwrap();
        let window = window_of(&handle);
        handle.inbound.send(frame(window, GameEvent::Ready)).unwrap();
        handle.inbound.send(frame(window, GameEvent::Error { reason: "out of memory".into() })).unwrap();

        let outcome = host.close().await.unwrap();
        assert_eq!(outcome, SessionOutcome::Abandoned { last_error: Some("out of memory".into()) });

        let state = hub.launches.state(&handle.credential.session_id).await.unwrap().state;
        assert_eq!(state, LaunchState::Active);
        assert_eq!(tracker.current().await.unwrap().stats.total_games_played, 0);
    }

    #[tokio::test]
    async fn test_rejected_finish_leaves_stats_alone() {
        let (hub, clock) = services();
        let (mut host, _posted, hub, tracker) = host_over(hub, clock.clone());

        let handle = host.launch(LaunchRequest::new("math-blitz", "p1")).await.unwrap();
        let window = window_of(&handle);
        handle.inbound.send(frame(window, GameEvent::Ready)).unwrap();
        assert_eq!(host.pump().await.len(), 1);

        clock.advance(chrono::Duration::minutes(20));
        handle.inbound.send(frame(window, GameEvent::Complete { score: 999, time_ms: 1 })).unwrap();
        host.pump().await;

        let state = hub.launches.state(&handle.credential.session_id).await.unwrap().state;
        assert_eq!(state, LaunchState::Expired);
        let stats = tracker.current().await.unwrap().stats;
        assert_eq!(stats.total_games_played, 0);
        assert!(stats.games_history.iter().all(|r| r.score != 999));
    }

    #[tokio::test]
    async fn test_foreign_window_ignored_by_host() {
        let (hub, clock) = services();
        let (mut host, _posted, hub, _) = host_over(hub, clock);

        let handle = host.launch(LaunchRequest::new("math-blitz", "p1")).await.unwrap();
        let foreign = WindowHandle(window_of(&handle).0 + 1_000);
        handle.inbound.send(frame(foreign, GameEvent::Complete { score: 1, time_ms: 1 })).unwrap();
        assert!(host.pump().await.is_empty());

        let state = hub.launches.state(&handle.credential.session_id).await.unwrap().state;
        assert_eq!(state, LaunchState::Pending);
    }

    #[tokio::test]
    async fn test_navigation_destroys_previous_instance() {
        let (hub, clock) = services();
        let (mut host, _posted, _, _) = host_over(hub, clock);

        let first = host.launch(LaunchRequest::new("math-blitz", "p1")).await.unwrap();
        let second = host.launch(LaunchRequest::new("word-hunt", "p1")).await.unwrap();

        assert_ne!(first.credential.session_id, second.credential.session_id);
        assert_eq!(host.container().mount_count(), 2);
        assert_eq!(host.session_id(), Some(second.credential.session_id.as_str()));
        // The first window's channel is gone.
        assert!(first.inbound.send(frame(window_of(&first), GameEvent::Ready)).is_err());
    }

    #[tokio::test]
    async fn test_module_game_through_port() {
        let mut blitz = manifest("math-blitz");
        blitz.runtime = RuntimeKind::EsmModule;
        let (hub, clock) = services_with(vec![blitz]);
        let (mut host, _posted, hub, _) = host_over(hub, clock);

        let mut handle = host.launch(LaunchRequest::new("math-blitz", "p1")).await.unwrap();
        assert_eq!(handle.transport, Transport::Module);
        let mut port = handle.module_port.take().unwrap();

        assert!(port.emit(GameEvent::Ready));
        assert_eq!(host.next_event().await, Some(GameEvent::Ready));
        assert_eq!(host.lifecycle(), Some(&Lifecycle::Running));

        host.command(HostCommand::Pause).await.unwrap();
        assert_eq!(port.next_command().await, Some(HostCommand::Pause));

        assert!(port.emit(GameEvent::Complete { score: 70, time_ms: 9_000 }));
        let outcome = host.close().await.unwrap();
        assert_eq!(outcome, SessionOutcome::Finished { score: 70, time_ms: 9_000 });
        assert_eq!(port.next_command().await, None);

        let state = hub.launches.state(&handle.credential.session_id).await.unwrap().state;
        assert!(matches!(state, LaunchState::Finished { .. }));
    }

    #[tokio::test]
    async fn test_failed_load_creates_nothing() {
        let mut broken = manifest("broken");
        broken.runtime = RuntimeKind::EsmModule;
        let (hub, clock) = services_with(vec![broken]);
        let (mut host, _posted, hub, _) = host_over(hub, clock);

        let err = host.launch(LaunchRequest::new("broken", "p1")).await.unwrap_err();
        assert!(matches!(err, HostError::Load(_)));
        assert_eq!(hub.launches.count().await, 0);
        assert!(!host.container().is_occupied());
        assert!(host.session_id().is_none());
    }

    #[tokio::test]
    async fn test_command_without_game() {
        let (hub, clock) = services();
        let (mut host, _posted, _, _) = host_over(hub, clock);
        assert!(matches!(host.command(HostCommand::Pause).await, Err(HostError::NoActiveGame)));
        assert!(host.close().await.is_none());
    }
}
