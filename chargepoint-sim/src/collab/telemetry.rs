//! Structured telemetry sink

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives one structured record per engine event
///
/// Implementations must not block: the engine calls `record` while it holds
/// its correlation lock.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, logger: &str, identity: &str, message: Value);
}

/// Default sink, emits `tracing` debug events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, logger: &str, identity: &str, message: Value) {
        debug!(target: "chargepoint_sim::telemetry", "[{}] {}: {}", identity, logger, message);
    }
}

/// A telemetry event as delivered by [`ChannelTelemetry`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub logger: String,
    pub identity: String,
    pub message: Value,
    pub timestamp: DateTime<Utc>,
}

/// Forwards records over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelTelemetry {
    tx: mpsc::UnboundedSender<TelemetryRecord>,
}

impl ChannelTelemetry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelTelemetry {
    fn record(&self, logger: &str, identity: &str, message: Value) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(TelemetryRecord {
            logger: logger.to_string(),
            identity: identity.to_string(),
            message,
            timestamp: Utc::now(),
        });
    }
}
