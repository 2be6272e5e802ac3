// Per-component trace sources. Every line is prefixed with a UTC timestamp and
// the component name, then forwarded to the `tracing` crate.

use chrono::Utc;
use testfork_sdk::TraceWriter;

/// Trace event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// Configuration for trace output.
#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Minimum severity level to emit.
    pub level: TraceEventType,
    /// Whether to also print to stdout.
    pub print_to_stdout: bool,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
            print_to_stdout: false,
        }
    }
}

/// A named trace source.
///
/// Each component (dispatcher, connection, worker host) gets its own instance
/// so log lines can be attributed without structured fields.
#[derive(Debug, Clone)]
pub struct Tracing {
    name: String,
    setting: TraceSetting,
}

impl Tracing {
    pub fn new(name: impl Into<String>, setting: TraceSetting) -> Self {
        Self {
            name: name.into(),
            setting,
        }
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.setting.level {
            return;
        }

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let formatted = format!("[{}][{}] {}: {}", timestamp, &self.name, event_type, message);

        match event_type {
            TraceEventType::Error => tracing::error!("{}", formatted),
            TraceEventType::Warning => tracing::warn!("{}", formatted),
            TraceEventType::Information => tracing::info!("{}", formatted),
            TraceEventType::Verbose => tracing::debug!("{}", formatted),
        }

        if self.setting.print_to_stdout {
            println!("{}", formatted);
        }
    }

    /// Get the name of this trace source.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log an error and each of its causes on separate lines.
    pub fn error_err(&self, err: &(dyn std::error::Error + 'static)) {
        self.error(&err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            self.error(&format!("  caused by: {}", cause));
            source = cause.source();
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out named trace sources sharing one setting.
#[derive(Debug, Clone, Default)]
pub struct TraceManager {
    default_setting: TraceSetting,
}

impl TraceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting(setting: TraceSetting) -> Self {
        Self {
            default_setting: setting,
        }
    }

    /// Get (create) a named trace source.
    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.default_setting.clone())
    }

    pub fn setting(&self) -> &TraceSetting {
        &self.default_setting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(TraceEventType::Verbose < TraceEventType::Information);
        assert!(TraceEventType::Information < TraceEventType::Warning);
        assert!(TraceEventType::Warning < TraceEventType::Error);
    }

    #[test]
    fn manager_names_sources() {
        let manager = TraceManager::with_setting(TraceSetting {
            level: TraceEventType::Warning,
            print_to_stdout: false,
        });
        let trace = manager.get("ForkingTestClassProcessor");
        assert_eq!(trace.name(), "ForkingTestClassProcessor");
        assert_eq!(manager.setting().level, TraceEventType::Warning);
        // Below threshold: must not panic or print.
        trace.verbose("dropped");
        trace.error("kept");
    }
}
