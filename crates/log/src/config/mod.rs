//! Configuration types
//!
//! - `Config`: level directive, output format, writer and display options
//! - `presets`: development, production, test and environment-driven setups

mod presets;

use serde::{Deserialize, Serialize};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filter directive (e.g. "info", "debug,os::pagesize=trace")
    pub level: String,

    /// Output format
    pub format: Format,

    /// Where events are written
    pub writer: WriterConfig,

    /// Display configuration
    pub display: DisplayConfig,

    /// Service name recorded on the root span, if any
    pub service: Option<String>,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Human-readable with colors and indentation
    Pretty,
    /// Compact single-line output
    Compact,
    /// Structured JSON output
    Json,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Trace => write!(f, "trace"),
            Level::Debug => write!(f, "debug"),
            Level::Info => write!(f, "info"),
            Level::Warn => write!(f, "warn"),
            Level::Error => write!(f, "error"),
        }
    }
}

impl From<Level> for String {
    fn from(level: Level) -> Self {
        level.to_string()
    }
}

/// Writer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterConfig {
    /// Write to stderr
    Stderr,
    /// Write to stdout
    Stdout,
    /// Route through the libtest capture so output shows only for failing tests
    Test,
}

/// Display configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct DisplayConfig {
    /// Show timestamps
    pub time: bool,
    /// Show source location (file:line)
    pub source: bool,
    /// Show target (`os::vm`, `os::malloc`, ...)
    pub target: bool,
    /// Show thread IDs
    pub thread_ids: bool,
    /// Show thread names
    pub thread_names: bool,
    /// Use ANSI colors
    pub colors: bool,
    /// Show span list in JSON
    pub span_list: bool,
    /// Flatten JSON events
    pub flatten: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Compact,
            writer: WriterConfig::Stderr,
            display: DisplayConfig::default(),
            service: None,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            time: true,
            source: false,
            target: true,
            thread_ids: false,
            thread_names: true,
            colors: true,
            span_list: false,
            flatten: false,
        }
    }
}

impl DisplayConfig {
    /// Apply `STRATUM_LOG_*` display overrides
    pub(crate) fn parse_env(&mut self) {
        fn flag(name: &str) -> Option<bool> {
            std::env::var(name)
                .ok()
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        }

        if let Some(v) = flag("STRATUM_LOG_TIME") {
            self.time = v;
        }
        if let Some(v) = flag("STRATUM_LOG_SOURCE") {
            self.source = v;
        }
        if let Some(v) = flag("STRATUM_LOG_THREAD_IDS") {
            self.thread_ids = v;
        }
        if std::env::var_os("NO_COLOR").is_some() {
            self.colors = false;
        } else if let Some(v) = flag("STRATUM_LOG_COLORS") {
            self.colors = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"level":"debug","format":"json"}"#)
            .expect("valid config");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, Format::Json);
        assert_eq!(config.writer, WriterConfig::Stderr);
        assert_eq!(config.display, DisplayConfig::default());
    }

    #[test]
    fn level_displays_lowercase() {
        assert_eq!(Level::Warn.to_string(), "warn");
        assert!(Level::Trace < Level::Error);
    }
}
