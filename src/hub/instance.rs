//! Game instances and the container that holds them.
//!
//! A [`GameContainer`] holds at most one live [`GameInstance`]. The previous
//! instance must be destroyed before another can be mounted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::sync::mpsc;
use tracing::debug;

use crate::hub::control::{GameEvent, HostCommand, Inbound, InboundSender, PostedMessage, WindowHandle};
use crate::hub::loader::ResolvedModule;
use crate::hub::manifest::RuntimeKind;

static NEXT_WINDOW: AtomicU64 = AtomicU64::new(1);

/// Query values keep only the unreserved characters literal.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Running embedded game, as seen by the host.
pub trait GameInstance: Send {
    /// Runtime kind of this instance.
    fn runtime(&self) -> RuntimeKind;

    /// Deliver a host command.
    fn on_host_command(&mut self, command: HostCommand);

    /// Release every resource held by the instance. Idempotent.
    fn destroy(&mut self);
}

/// Container errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainerError {
    /// A live instance already occupies the container.
    #[error("container {0} already holds a live game instance")]
    Occupied(String),
}

/// Per-launch values passed to `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    /// Game being launched.
    pub game_id: String,
    /// Launch session.
    pub session_id: String,
    /// Launching player.
    pub player_id: String,
    /// Single-use launch token.
    pub launch_token: String,
}

impl LaunchContext {
    /// Document URL carrying the launch parameters.
    pub fn document_url(&self, entry_url: &str) -> String {
        let separator = if entry_url.contains('?') { '&' } else { '?' };
        let encode = |value: &str| utf8_percent_encode(value, QUERY_VALUE).to_string();
        format!(
            "{entry_url}{separator}sessionId={}&launchToken={}&gameId={}",
            encode(&self.session_id),
            encode(&self.launch_token),
            encode(&self.game_id)
        )
    }
}

// =============================================================================
// CONTAINER
// =============================================================================

/// Slot for exactly one live game instance.
pub struct GameContainer {
    id: String,
    instance: Option<Box<dyn GameInstance>>,
    window: Option<WindowHandle>,
    mounts: u64,
}

impl GameContainer {
    /// Create an empty container.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), instance: None, window: None, mounts: 0 }
    }

    /// Container identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether a live instance is mounted.
    pub fn is_occupied(&self) -> bool {
        self.instance.is_some()
    }

    /// Window of the current iframe instance.
    pub fn window(&self) -> Option<WindowHandle> {
        self.window
    }

    /// Total instances ever mounted here.
    pub fn mount_count(&self) -> u64 {
        self.mounts
    }

    /// Allocate a fresh browsing-context handle for the next mount.
    pub fn open_window(&mut self) -> WindowHandle {
        let window = WindowHandle(NEXT_WINDOW.fetch_add(1, Ordering::Relaxed));
        self.window = Some(window);
        window
    }

    /// Mount an instance. Fails if one is already live.
    pub fn mount(&mut self, instance: Box<dyn GameInstance>) -> Result<(), ContainerError> {
        if self.instance.is_some() {
            return Err(ContainerError::Occupied(self.id.clone()));
        }
        debug!(container = %self.id, runtime = ?instance.runtime(), "instance mounted");
        self.instance = Some(instance);
        self.mounts += 1;
        Ok(())
    }

    /// Deliver a command to the live instance.
    pub fn command(&mut self, command: HostCommand) -> bool {
        match self.instance.as_mut() {
            Some(instance) => {
                instance.on_host_command(command);
                true
            }
            None => false,
        }
    }

    /// Destroy the live instance, leaving the container reusable.
    pub fn destroy(&mut self) -> bool {
        match self.instance.take() {
            Some(mut instance) => {
                instance.destroy();
                self.window = None;
                debug!(container = %self.id, "instance destroyed");
                true
            }
            None => false,
        }
    }
}

impl Drop for GameContainer {
    fn drop(&mut self) {
        self.destroy();
    }
}

// =============================================================================
// IFRAME INSTANCE
// =============================================================================

/// Host proxy for a game running in an isolated document.
///
/// No game code runs here; commands become frames posted to the window.
pub struct IframeInstance {
    window: WindowHandle,
    posted: Option<mpsc::UnboundedSender<PostedMessage>>,
}

impl IframeInstance {
    /// Open `url` in `window`.
    pub fn new(window: WindowHandle, url: String, posted: mpsc::UnboundedSender<PostedMessage>) -> Self {
        let _ = posted.send(PostedMessage::Open { window, url });
        Self { window, posted: Some(posted) }
    }

    /// Window this instance lives in.
    pub fn window(&self) -> WindowHandle {
        self.window
    }
}

impl GameInstance for IframeInstance {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::IframeHtml
    }

    fn on_host_command(&mut self, command: HostCommand) {
        let Some(posted) = self.posted.as_ref() else {
            return;
        };
        match command.to_json() {
            Ok(data) => {
                let _ = posted.send(PostedMessage::Command { window: self.window, data });
            }
            Err(e) => debug!(error = %e, "failed to encode host command"),
        }
    }

    fn destroy(&mut self) {
        if let Some(posted) = self.posted.take() {
            let _ = posted.send(PostedMessage::Close { window: self.window });
        }
    }
}

// =============================================================================
// MODULE INSTANCE
// =============================================================================

/// Host proxy for an in-process module instance.
pub struct ModuleInstance {
    module: Arc<ResolvedModule>,
    commands: Option<mpsc::UnboundedSender<HostCommand>>,
}

impl ModuleInstance {
    /// Create the instance and the port its component is driven through.
    pub fn new(module: Arc<ResolvedModule>, context: LaunchContext) -> (Self, ModulePort) {
        let (tx, rx) = mpsc::unbounded_channel();
        let port = ModulePort { module: module.clone(), context, commands: rx, events: None };
        (Self { module, commands: Some(tx) }, port)
    }

    /// Resolved module chain.
    pub fn module(&self) -> &ResolvedModule {
        &self.module
    }
}

impl GameInstance for ModuleInstance {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::EsmModule
    }

    fn on_host_command(&mut self, command: HostCommand) {
        if let Some(commands) = self.commands.as_ref() {
            let _ = commands.send(command);
        }
    }

    fn destroy(&mut self) {
        // Dropping the sender ends the component's command stream.
        self.commands.take();
    }
}

/// Component side of a module instance.
#[derive(Debug)]
pub struct ModulePort {
    module: Arc<ResolvedModule>,
    context: LaunchContext,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    events: Option<InboundSender>,
}

impl ModulePort {
    /// Resolved module chain to execute.
    pub fn module(&self) -> &ResolvedModule {
        &self.module
    }

    /// Launch parameters.
    pub fn context(&self) -> &LaunchContext {
        &self.context
    }

    /// Connect the event stream to the host's control channel.
    pub fn connect(&mut self, inbound: InboundSender) {
        self.events = Some(inbound);
    }

    /// Emit an event to the host. False if unconnected or torn down.
    pub fn emit(&self, event: GameEvent) -> bool {
        match self.events.as_ref() {
            Some(events) => events.send(Inbound::Direct(event)).is_ok(),
            None => false,
        }
    }

    /// Next host command; `None` once the instance is destroyed.
    pub async fn next_command(&mut self) -> Option<HostCommand> {
        self.commands.recv().await
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Shared log of what a [`RecordingInstance`] saw.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingLog {
        commands: Arc<Mutex<Vec<HostCommand>>>,
        destroyed: Arc<Mutex<u32>>,
    }

    impl RecordingLog {
        pub(crate) fn commands(&self) -> Vec<HostCommand> {
            self.commands.lock().unwrap().clone()
        }

        pub(crate) fn destroyed(&self) -> bool {
            *self.destroyed.lock().unwrap() > 0
        }

        pub(crate) fn destroy_count(&self) -> u32 {
            *self.destroyed.lock().unwrap()
        }
    }

    pub(crate) struct RecordingInstance {
        log: RecordingLog,
    }

    impl RecordingInstance {
        pub(crate) fn mounted(id: &str) -> (GameContainer, RecordingLog) {
            let log = RecordingLog::default();
            let mut container = GameContainer::new(id);
            container.mount(Box::new(RecordingInstance { log: log.clone() })).unwrap();
            (container, log)
        }
    }

    impl GameInstance for RecordingInstance {
        fn runtime(&self) -> RuntimeKind {
            RuntimeKind::IframeHtml
        }

        fn on_host_command(&mut self, command: HostCommand) {
            self.log.commands.lock().unwrap().push(command);
        }

        fn destroy(&mut self) {
            *self.log.destroyed.lock().unwrap() += 1;
        }
    }

    fn context() -> LaunchContext {
        LaunchContext {
            game_id: "quiz".into(),
            session_id: "s-1".into(),
            player_id: "p-1".into(),
            launch_token: "tok".into(),
        }
    }

    #[test]
    fn test_second_mount_rejected() {
        let (mut container, log) = RecordingInstance::mounted("c1");
        let err = container
            .mount(Box::new(RecordingInstance { log: RecordingLog::default() }))
            .unwrap_err();
        assert_eq!(err, ContainerError::Occupied("c1".into()));
        assert!(!log.destroyed());
    }

    #[test]
    fn test_destroy_frees_container() {
        let (mut container, log) = RecordingInstance::mounted("c1");
        assert!(container.destroy());
        assert!(!container.destroy());
        assert_eq!(log.destroy_count(), 1);

        container.mount(Box::new(RecordingInstance { log: RecordingLog::default() })).unwrap();
        assert_eq!(container.mount_count(), 2);
    }

    #[test]
    fn test_drop_destroys_live_instance() {
        let (container, log) = RecordingInstance::mounted("c1");
        drop(container);
        assert!(log.destroyed());
    }

    #[test]
    fn test_document_url_carries_launch_params() {
        let ctx = context();
        assert_eq!(
            ctx.document_url("https://g.example.com/quiz/"),
            "https://g.example.com/quiz/?sessionId=s-1&launchToken=tok&gameId=quiz"
        );
        assert!(ctx.document_url("https://g.example.com/q?lang=en").contains("?lang=en&sessionId="));
    }

    #[test]
    fn test_document_url_encodes_values() {
        let mut ctx = context();
        ctx.game_id = "word hunt&admin=1".into();
        ctx.launch_token = "a+b/c=".into();
        assert_eq!(
            ctx.document_url("https://g.example.com/wh/"),
            "https://g.example.com/wh/?sessionId=s-1&launchToken=a%2Bb%2Fc%3D&gameId=word%20hunt%26admin%3D1"
        );
    }

    #[test]
    fn test_iframe_instance_posts_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let window = WindowHandle(42);
        let mut instance = IframeInstance::new(window, "https://g.example.com/".into(), tx);
        instance.on_host_command(HostCommand::Pause);
        instance.destroy();
        instance.on_host_command(HostCommand::Resume);

        assert!(matches!(rx.try_recv().unwrap(), PostedMessage::Open { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            PostedMessage::Command { window, data: r#"{"type":"PAUSE"}"#.into() }
        );
        assert_eq!(rx.try_recv().unwrap(), PostedMessage::Close { window });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_module_port_sees_commands_until_destroy() {
        let resolved = crate::hub::loader::ResolutionPipeline {
            entry_url: format!("{}/games/math-blitz/module/entry", crate::hub::loader::tests::BASE),
            pinned_runtime: None,
            stage_timeout: crate::hub::loader::DEFAULT_STAGE_TIMEOUT,
        }
        .resolve(&crate::hub::loader::tests::chain_fetcher())
        .await
        .unwrap();

        let (mut instance, mut port) = ModuleInstance::new(Arc::new(resolved), context());
        instance.on_host_command(HostCommand::Pause);
        instance.destroy();

        assert_eq!(port.next_command().await, Some(HostCommand::Pause));
        assert_eq!(port.next_command().await, None);
        assert!(!port.emit(GameEvent::Ready));
    }
}
