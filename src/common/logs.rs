//! Log fan-out for proxy-core output
//!
//! Lines read from the core's stdout/stderr are mirrored into tracing and
//! into a broadcast channel so that hosts can stream them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the log broadcast channel
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Log event for streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Log level (debug, info, warning, error)
    #[serde(rename = "type")]
    pub level: String,
    /// Originating stream or component, e.g. `core/stderr`
    pub source: String,
    /// Log message
    pub payload: String,
    pub time: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(level: &str, source: &str, payload: &str) -> Self {
        LogEvent {
            level: level.to_string(),
            source: source.to_string(),
            payload: payload.to_string(),
            time: Utc::now(),
        }
    }

    /// Check if this log should be shown at the given minimum level
    pub fn should_show(&self, min_level: &str) -> bool {
        level_priority(&self.level) >= level_priority(min_level)
    }
}

/// Get priority for log level (higher = more severe)
fn level_priority(level: &str) -> u8 {
    match level.to_lowercase().as_str() {
        "debug" => 0,
        "info" => 1,
        "warning" | "warn" => 2,
        "error" => 3,
        "silent" | "none" => 4,
        _ => 1,
    }
}

/// Guess a level from a core log line.
///
/// Cores print `[Warning]`, `[Error]` style prefixes; anything unmarked on
/// stderr is treated as a warning.
pub fn classify_line(line: &str, from_stderr: bool) -> &'static str {
    let lower = line.to_ascii_lowercase();
    if lower.contains("[error]") || lower.contains("failed to start") {
        "error"
    } else if lower.contains("[warning]") || lower.contains("[warn]") {
        "warning"
    } else if lower.contains("[debug]") {
        "debug"
    } else if from_stderr {
        "warning"
    } else {
        "info"
    }
}

/// Cloneable sender side of the log channel
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: broadcast::Sender<LogEvent>,
}

impl LogSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        LogSink { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn publish(&self, event: LogEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}
