//! Log sink contract.
//!
//! A session reports what it does through an optional [`LogSink`]. Levels
//! follow the syslog/PSR-3 severities. [`TracingSink`] forwards to `tracing`
//! for applications that already run a subscriber.

use std::fmt;

use serde_json::Value as JsonValue;

/// Key under which a session injects its own identity into every context.
pub const SESSION_KEY: &str = "connection";

/// Open key→value context attached to a log record.
pub type LogContext = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Emergency => "emergency",
            Level::Alert => "alert",
            Level::Critical => "critical",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Notice => "notice",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str, context: &LogContext);
}

/// Sink that emits `tracing` events under the `pgsession` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str, context: &LogContext) {
        let context = JsonValue::Object(context.clone());
        match level {
            Level::Emergency | Level::Alert | Level::Critical | Level::Error => {
                tracing::error!(target: "pgsession", severity = %level, %context, "{}", message)
            }
            Level::Warning => {
                tracing::warn!(target: "pgsession", severity = %level, %context, "{}", message)
            }
            Level::Notice | Level::Info => {
                tracing::info!(target: "pgsession", severity = %level, %context, "{}", message)
            }
            Level::Debug => {
                tracing::debug!(target: "pgsession", severity = %level, %context, "{}", message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_ordered_by_severity() {
        assert!(Level::Alert < Level::Critical);
        assert!(Level::Error < Level::Notice);
        assert_eq!(Level::Notice.to_string(), "notice");
    }

    #[test]
    fn test_tracing_sink_without_subscriber() {
        let mut context = LogContext::new();
        context.insert("sql".to_string(), JsonValue::from("SELECT 1"));
        TracingSink.log(Level::Critical, "settings failed", &context);
    }
}
