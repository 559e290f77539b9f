//! Telemetry Aggregator
//!
//! Accepts batched event streams from running games and forwards them to a
//! sink. A batch is validated as a whole before anything is forwarded; sink
//! delivery is best effort and never fails the caller.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hub::launch::{LaunchError, LaunchManager};

/// Default maximum events per batch.
pub const DEFAULT_MAX_BATCH: usize = 500;

/// One telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Game id.
    pub gid: String,
    /// Launch session id.
    pub sid: String,
    /// Event name.
    pub evt: String,
    /// Event data.
    #[serde(default)]
    pub payload: Value,
}

/// Processed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    /// Number of events accepted.
    pub processed: usize,
}

/// Telemetry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    /// Batch rejected without processing.
    #[error("invalid telemetry payload: {0}")]
    InvalidPayload(String),

    /// Batch references an expired launch session.
    #[error("launch session {0} expired")]
    SessionExpired(String),
}

/// Sink delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("telemetry sink failed: {0}")]
pub struct SinkError(pub String);

/// Boxed sink future.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Downstream consumer of accepted batches.
///
/// Consumers must tolerate duplicates: callers may retry a batch.
pub trait TelemetrySink: Send + Sync {
    /// Forward events in order.
    fn forward<'a>(&'a self, events: &'a [TelemetryEvent]) -> SinkFuture<'a>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn forward<'a>(&'a self, events: &'a [TelemetryEvent]) -> SinkFuture<'a> {
        Box::pin(async move {
            for event in events {
                info!(gid = %event.gid, sid = %event.sid, evt = %event.evt, payload = %event.payload, "telemetry");
            }
            Ok(())
        })
    }
}

/// Pushes events into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl ChannelSink {
    /// Create a sink and its receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn forward<'a>(&'a self, events: &'a [TelemetryEvent]) -> SinkFuture<'a> {
        Box::pin(async move {
            for event in events {
                self.tx
                    .send(event.clone())
                    .map_err(|_| SinkError("receiver dropped".into()))?;
            }
            Ok(())
        })
    }
}

/// Validates and forwards telemetry batches.
pub struct TelemetryAggregator {
    sink: Arc<dyn TelemetrySink>,
    launches: Arc<LaunchManager>,
    max_batch: usize,
}

impl TelemetryAggregator {
    /// Create an aggregator.
    pub fn new(sink: Arc<dyn TelemetrySink>, launches: Arc<LaunchManager>) -> Self {
        Self { sink, launches, max_batch: DEFAULT_MAX_BATCH }
    }

    /// Override the batch size limit.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Decode a raw batch. Any bad element rejects the whole batch.
    pub fn parse_batch(&self, raw: &Value) -> Result<Vec<TelemetryEvent>, TelemetryError> {
        let items = raw
            .as_array()
            .ok_or_else(|| TelemetryError::InvalidPayload("events must be an array".into()))?;
        if items.is_empty() {
            return Err(TelemetryError::InvalidPayload("empty batch".into()));
        }
        if items.len() > self.max_batch {
            return Err(TelemetryError::InvalidPayload(format!(
                "batch of {} exceeds limit {}",
                items.len(),
                self.max_batch
            )));
        }

        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let event: TelemetryEvent = serde_json::from_value(item.clone())
                    .map_err(|e| TelemetryError::InvalidPayload(format!("event {i}: {e}")))?;
                if event.gid.is_empty() || event.sid.is_empty() || event.evt.is_empty() {
                    return Err(TelemetryError::InvalidPayload(format!("event {i}: empty gid, sid or evt")));
                }
                Ok(event)
            })
            .collect()
    }

    /// Validate and forward one batch.
    pub async fn submit_batch(&self, raw: &Value) -> Result<BatchReceipt, TelemetryError> {
        let events = self.parse_batch(raw)?;

        let sessions: BTreeSet<&str> = events.iter().map(|e| e.sid.as_str()).collect();
        for sid in sessions {
            if let Err(LaunchError::SessionExpired) = self.launches.ensure_live(sid).await {
                return Err(TelemetryError::SessionExpired(sid.to_string()));
            }
        }

        if let Err(e) = self.sink.forward(&events).await {
            warn!(error = %e, count = events.len(), "dropping telemetry batch");
        } else {
            debug!(count = events.len(), "telemetry batch forwarded");
        }

        Ok(BatchReceipt { processed: events.len() })
    }
}
