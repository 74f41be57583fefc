//! The statistics channel between workers and the collector.

use tokio::sync::mpsc;

/// Direction of a level move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Up,
    Down,
}

/// One message on the stats channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsMessage {
    Tally(String),
    Level(String, Sign),
    Series(String, f64),
    /// A per-session failure, tallied under its message.
    Error(String),
    /// Shutdown sentinel: the collector prints a final report and exits.
    Stop,
}

/// Telemetry sink handed to workers and protocol adapters. Sends never block
/// and never fail the caller; a closed channel (collector already gone during
/// shutdown) drops the message.
#[derive(Clone)]
pub struct Telemetry {
    tx: mpsc::UnboundedSender<StatsMessage>,
}

impl Telemetry {
    pub fn tally(&self, name: impl Into<String>) {
        let _ = self.tx.send(StatsMessage::Tally(name.into()));
    }

    pub fn level(&self, name: impl Into<String>, sign: Sign) {
        let _ = self.tx.send(StatsMessage::Level(name.into(), sign));
    }

    pub fn series(&self, name: impl Into<String>, value: f64) {
        let _ = self.tx.send(StatsMessage::Series(name.into(), value));
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.tx.send(StatsMessage::Error(message.into()));
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(StatsMessage::Stop);
    }
}

/// Builds the stats channel: the sink side for workers and adapters, the
/// receive side for the collector.
pub fn stats_channel() -> (Telemetry, mpsc::UnboundedReceiver<StatsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Telemetry { tx }, rx)
}
