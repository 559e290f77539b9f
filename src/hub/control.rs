//! Host-Game Control Channel
//!
//! One logical protocol over two physical transports:
//! - `Iframe`: serialized frames posted to/from an embedded window. Inbound
//!   frames are trusted only when their source is the window we created.
//! - `Module`: typed values exchanged in-process with the module instance.
//!
//! The channel dispatches on the [`Transport`] tag, never on the shape of the
//! incoming data. Inbound traffic from both transports funnels through one
//! ordered queue, so events reach the host in program order per instance.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hub::instance::GameContainer;

// =============================================================================
// WIRE MESSAGES
// =============================================================================

/// Host -> game commands. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostCommand {
    /// Suspend gameplay.
    Pause,
    /// Continue after a pause.
    Resume,
    /// Stop and tear down.
    Quit,
}

impl HostCommand {
    /// Decode a command frame on the game side.
    ///
    /// Unknown or malformed commands yield `None` and must be ignored.
    pub fn decode(raw: &str) -> Option<HostCommand> {
        match serde_json::from_str(raw) {
            Ok(command) => Some(command),
            Err(e) => {
                debug!(error = %e, "ignoring unknown host command");
                None
            }
        }
    }

    /// Serialize to a JSON frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Game -> host events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameEvent {
    /// Game finished loading.
    Ready,
    /// Score changed by `delta`.
    ScoreUpdate {
        /// Signed score change.
        delta: i64,
    },
    /// Opaque progress snapshot to persist.
    ProgressUpdate {
        /// Progress data.
        blob: serde_json::Value,
    },
    /// Game finished.
    Complete {
        /// Final score.
        score: i64,
        /// Play time in milliseconds.
        #[serde(rename = "timeMs")]
        time_ms: u64,
    },
    /// Game-side error.
    Error {
        /// Human-readable reason.
        reason: String,
    },
}

impl GameEvent {
    /// Serialize to a JSON frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON frame.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// TRANSPORTS
// =============================================================================

/// Opaque handle of an embedded browsing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowHandle(pub u64);

/// How the host reaches a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Cross-document messages with the embedded window.
    Iframe {
        /// The window created for this instance.
        window: WindowHandle,
    },
    /// In-process module instance.
    Module,
}

/// A frame the host posts into an embedded window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostedMessage {
    /// Navigate the window to a document.
    Open {
        /// Target window.
        window: WindowHandle,
        /// Document URL.
        url: String,
    },
    /// Command frame.
    Command {
        /// Target window.
        window: WindowHandle,
        /// Serialized [`HostCommand`].
        data: String,
    },
    /// Window torn down.
    Close {
        /// Target window.
        window: WindowHandle,
    },
}

/// Host-side resources handed to `init`.
#[derive(Debug, Clone)]
pub struct HostLink {
    /// Outbound frames to embedded windows.
    pub posted: mpsc::UnboundedSender<PostedMessage>,
}

impl HostLink {
    /// Create a link and the receiving end the embedder drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PostedMessage>) {
        let (posted, rx) = mpsc::unbounded_channel();
        (Self { posted }, rx)
    }
}

/// Anything arriving at the host from a game.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Cross-document message with its claimed source window.
    Posted {
        /// Window the message came from.
        source: WindowHandle,
        /// Raw frame.
        data: String,
    },
    /// Typed event from an in-process module instance.
    Direct(GameEvent),
}

/// Sending half of the inbound queue.
pub type InboundSender = mpsc::UnboundedSender<Inbound>;

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Host view of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// Mounted, `READY` not yet seen.
    Loading,
    /// Playing.
    Running,
    /// Paused by the host.
    Paused,
    /// `COMPLETE` received.
    Completed {
        /// Final score.
        score: i64,
        /// Play time in milliseconds.
        time_ms: u64,
    },
    /// Torn down without `COMPLETE`.
    Abandoned,
}

impl Lifecycle {
    /// No further events are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Completed { .. } | Lifecycle::Abandoned)
    }
}

/// How an instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// `COMPLETE` was received before teardown.
    Finished {
        /// Final score.
        score: i64,
        /// Play time in milliseconds.
        time_ms: u64,
    },
    /// Torn down without `COMPLETE`.
    Abandoned {
        /// Last `ERROR` reason, if any.
        last_error: Option<String>,
    },
}

/// Control channel errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// Command not applicable in the current lifecycle.
    #[error("cannot {command:?} while {lifecycle:?}")]
    NotApplicable {
        /// Rejected command.
        command: HostCommand,
        /// Current lifecycle.
        lifecycle: Lifecycle,
    },
    /// Channel already torn down.
    #[error("channel closed")]
    Closed,
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Host end of one instance's control channel.
pub struct ControlChannel {
    transport: Transport,
    inbound_tx: InboundSender,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    lifecycle: Lifecycle,
    running_score: i64,
    last_error: Option<String>,
    closed: bool,
}

impl ControlChannel {
    /// Create a channel for a freshly mounted instance.
    pub fn new(transport: Transport) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            inbound_tx,
            inbound_rx,
            lifecycle: Lifecycle::Loading,
            running_score: 0,
            last_error: None,
            closed: false,
        }
    }

    /// Transport this channel dispatches on.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Handle for message listeners and module ports.
    pub fn inbound(&self) -> InboundSender {
        self.inbound_tx.clone()
    }

    /// Current lifecycle.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Sum of `SCORE_UPDATE` deltas so far.
    pub fn running_score(&self) -> i64 {
        self.running_score
    }

    /// Last `ERROR` reason reported by the game.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Validate one inbound item and apply it.
    ///
    /// Returns the trusted event, or `None` when the item is discarded.
    pub fn accept(&mut self, inbound: Inbound) -> Option<GameEvent> {
        if self.closed {
            debug!("discarding event after teardown");
            return None;
        }

        let event = match (self.transport, inbound) {
            (Transport::Iframe { window }, Inbound::Posted { source, data }) => {
                if source != window {
                    debug!(expected = window.0, got = source.0, "discarding message from foreign window");
                    return None;
                }
                match GameEvent::from_json(&data) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "discarding malformed game message");
                        return None;
                    }
                }
            }
            (Transport::Module, Inbound::Direct(event)) => event,
            (transport, _) => {
                warn!(?transport, "discarding message from mismatched transport");
                return None;
            }
        };

        self.apply(event)
    }

    fn apply(&mut self, event: GameEvent) -> Option<GameEvent> {
        if self.lifecycle.is_terminal() {
            debug!(?event, "discarding event after completion");
            return None;
        }

        match &event {
            GameEvent::Ready => {
                if self.lifecycle == Lifecycle::Loading {
                    self.lifecycle = Lifecycle::Running;
                }
            }
            GameEvent::ScoreUpdate { delta } => {
                self.running_score = self.running_score.saturating_add(*delta);
            }
            GameEvent::ProgressUpdate { .. } => {}
            GameEvent::Complete { score, time_ms } => {
                self.lifecycle = Lifecycle::Completed { score: *score, time_ms: *time_ms };
            }
            GameEvent::Error { reason } => {
                warn!(%reason, "game reported error");
                self.last_error = Some(reason.clone());
            }
        }

        Some(event)
    }

    /// Next trusted event, waiting for one to arrive.
    ///
    /// Returns `None` once the channel is torn down.
    pub async fn next_event(&mut self) -> Option<GameEvent> {
        while !self.closed {
            let inbound = self.inbound_rx.recv().await?;
            if let Some(event) = self.accept(inbound) {
                return Some(event);
            }
        }
        None
    }

    /// Every trusted event already queued, in arrival order.
    pub fn drain(&mut self) -> Vec<GameEvent> {
        let mut events = Vec::new();
        while let Ok(inbound) = self.inbound_rx.try_recv() {
            if let Some(event) = self.accept(inbound) {
                events.push(event);
            }
        }
        events
    }

    /// Send a command to the instance in `container`.
    ///
    /// `QUIT` destroys the instance and tears the channel down.
    pub fn command(
        &mut self,
        container: &mut GameContainer,
        command: HostCommand,
    ) -> Result<Option<SessionOutcome>, ControlError> {
        if self.closed {
            return Err(ControlError::Closed);
        }

        let next = match (command, &self.lifecycle) {
            (HostCommand::Pause, Lifecycle::Running) => Some(Lifecycle::Paused),
            (HostCommand::Resume, Lifecycle::Paused) => Some(Lifecycle::Running),
            (HostCommand::Quit, _) => None,
            (command, lifecycle) => {
                return Err(ControlError::NotApplicable { command, lifecycle: lifecycle.clone() });
            }
        };

        container.command(command);

        if let Some(next) = next {
            self.lifecycle = next;
            return Ok(None);
        }
        Ok(Some(self.teardown(container)))
    }

    /// Destroy the instance and settle the outcome.
    ///
    /// Queued events that arrived before teardown are still applied, so a
    /// `COMPLETE` already in flight counts. Anything later is lost.
    pub fn teardown(&mut self, container: &mut GameContainer) -> SessionOutcome {
        if !self.closed {
            let pending = self.drain();
            if !pending.is_empty() {
                debug!(count = pending.len(), "applied events queued before teardown");
            }
            container.destroy();
            self.closed = true;
            self.inbound_rx.close();
        }

        let outcome = match self.lifecycle {
            Lifecycle::Completed { score, time_ms } => SessionOutcome::Finished { score, time_ms },
            _ => {
                self.lifecycle = Lifecycle::Abandoned;
                SessionOutcome::Abandoned { last_error: self.last_error.clone() }
            }
        };
        info!(?outcome, "game instance torn down");
        outcome
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::instance::tests::RecordingInstance;

    fn iframe_channel() -> (ControlChannel, WindowHandle) {
        let window = WindowHandle(7);
        (ControlChannel::new(Transport::Iframe { window }), window)
    }

    fn posted(source: WindowHandle, event: &GameEvent) -> Inbound {
        Inbound::Posted { source, data: event.to_json().unwrap() }
    }

    #[test]
    fn test_wire_shapes() {
        assert_eq!(HostCommand::Pause.to_json().unwrap(), r#"{"type":"PAUSE"}"#);
        let complete = GameEvent::Complete { score: 500, time_ms: 42_000 };
        assert_eq!(complete.to_json().unwrap(), r#"{"type":"COMPLETE","score":500,"timeMs":42000}"#);
        assert_eq!(
            GameEvent::from_json(r#"{"type":"SCORE_UPDATE","delta":10}"#).unwrap(),
            GameEvent::ScoreUpdate { delta: 10 }
        );
    }

    #[test]
    fn test_unknown_command_ignored() {
        assert_eq!(HostCommand::decode(r#"{"type":"RESUME"}"#), Some(HostCommand::Resume));
        assert_eq!(HostCommand::decode(r#"{"type":"SELF_DESTRUCT"}"#), None);
        assert_eq!(HostCommand::decode("not json"), None);
    }

    #[test]
    fn test_foreign_window_discarded() {
        let (mut channel, window) = iframe_channel();
        assert_eq!(channel.accept(posted(WindowHandle(99), &GameEvent::Ready)), None);
        assert_eq!(*channel.lifecycle(), Lifecycle::Loading);

        assert_eq!(channel.accept(posted(window, &GameEvent::Ready)), Some(GameEvent::Ready));
        assert_eq!(*channel.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn test_transport_mismatch_discarded() {
        let (mut channel, _) = iframe_channel();
        assert_eq!(channel.accept(Inbound::Direct(GameEvent::Ready)), None);

        let mut module = ControlChannel::new(Transport::Module);
        assert_eq!(module.accept(posted(WindowHandle(1), &GameEvent::Ready)), None);
        assert_eq!(module.accept(Inbound::Direct(GameEvent::Ready)), Some(GameEvent::Ready));
    }

    #[test]
    fn test_malformed_frame_discarded() {
        let (mut channel, window) = iframe_channel();
        let inbound = Inbound::Posted { source: window, data: "{\"type\":\"LEVEL_UP\"}".into() };
        assert_eq!(channel.accept(inbound), None);
    }

    #[test]
    fn test_drain_preserves_program_order() {
        let (mut channel, window) = iframe_channel();
        let tx = channel.inbound();
        let sent = vec![
            GameEvent::Ready,
            GameEvent::ScoreUpdate { delta: 10 },
            GameEvent::ScoreUpdate { delta: -3 },
            GameEvent::Complete { score: 7, time_ms: 1000 },
        ];
        for event in &sent {
            tx.send(posted(window, event)).unwrap();
        }
        assert_eq!(channel.drain(), sent);
        assert_eq!(channel.running_score(), 7);
    }

    #[tokio::test]
    async fn test_next_event_skips_untrusted() {
        let (mut channel, window) = iframe_channel();
        let tx = channel.inbound();
        tx.send(posted(WindowHandle(3), &GameEvent::Ready)).unwrap();
        tx.send(posted(window, &GameEvent::ScoreUpdate { delta: 5 })).unwrap();

        assert_eq!(channel.next_event().await, Some(GameEvent::ScoreUpdate { delta: 5 }));
    }

    #[test]
    fn test_pause_resume_quit() {
        let (mut channel, window) = iframe_channel();
        let (mut container, log) = RecordingInstance::mounted("c1");

        assert!(matches!(
            channel.command(&mut container, HostCommand::Pause),
            Err(ControlError::NotApplicable { .. })
        ));

        channel.accept(posted(window, &GameEvent::Ready));
        channel.command(&mut container, HostCommand::Pause).unwrap();
        assert_eq!(*channel.lifecycle(), Lifecycle::Paused);
        channel.command(&mut container, HostCommand::Resume).unwrap();
        assert_eq!(*channel.lifecycle(), Lifecycle::Running);

        let outcome = channel.command(&mut container, HostCommand::Quit).unwrap();
        assert_eq!(outcome, Some(SessionOutcome::Abandoned { last_error: None }));
        assert!(!container.is_occupied());
        assert_eq!(
            log.commands(),
            vec![HostCommand::Pause, HostCommand::Resume, HostCommand::Quit]
        );
        assert!(log.destroyed());
        assert_eq!(channel.command(&mut container, HostCommand::Pause), Err(ControlError::Closed));
    }

    #[test]
    fn test_teardown_without_complete_is_abandoned() {
        let (mut channel, window) = iframe_channel();
        let (mut container, _) = RecordingInstance::mounted("c1");
        channel.accept(posted(window, &GameEvent::Ready));
        channel.accept(posted(window, &GameEvent::Error { reason: "webgl lost".into() }));

        let outcome = channel.teardown(&mut container);
        assert_eq!(outcome, SessionOutcome::Abandoned { last_error: Some("webgl lost".into()) });
        assert_eq!(*channel.lifecycle(), Lifecycle::Abandoned);
    }

    #[test]
    fn test_queued_complete_counts_at_teardown() {
        let (mut channel, window) = iframe_channel();
        let (mut container, _) = RecordingInstance::mounted("c1");
        channel.inbound().send(posted(window, &GameEvent::Complete { score: 500, time_ms: 42_000 })).unwrap();

        let outcome = channel.teardown(&mut container);
        assert_eq!(outcome, SessionOutcome::Finished { score: 500, time_ms: 42_000 });
    }

    #[test]
    fn test_events_after_teardown_lost() {
        let (mut channel, window) = iframe_channel();
        let (mut container, _) = RecordingInstance::mounted("c1");
        let tx = channel.inbound();
        channel.teardown(&mut container);

        // Receiver is closed: late frames cannot even be queued.
        assert!(tx.send(posted(window, &GameEvent::Complete { score: 1, time_ms: 1 })).is_err());
        assert_eq!(channel.accept(posted(window, &GameEvent::Ready)), None);
    }
}
