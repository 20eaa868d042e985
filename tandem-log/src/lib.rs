//! Tandem logging setup
//!
//! Builds a `tracing` subscriber for binaries and tests that use the tandem
//! crates. Every crate in the workspace logs through `tracing` macros with
//! structured fields; this crate only decides where those events go.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tandem_log::LogConfig;
//!
//! LogConfig::from_env().try_init().ok();
//! tracing::info!(port = 8080, "service started");
//! ```
//!
//! # Environment Variables
//!
//! - `TANDEM_DEBUG=1` - Enable debug logging
//! - `TANDEM_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `TANDEM_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `TANDEM_LOG_COLOR=1|0` - Enable/disable colors
//! - `TANDEM_LOG_TIMESTAMPS=1|0` - Include timestamps
//! - `TANDEM_LOG_MODULE=1|0` - Include the event target
//!
//! `RUST_LOG`, when set, replaces the level with a full filter directive.

use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tfmt};

pub use tracing_subscriber::util::TryInitError;

// ============================================================================
// Log Levels
// ============================================================================

/// Minimum level of events that are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Trace level (most verbose)
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level (least verbose)
    Error,
    /// Off (no logging)
    Off,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether colors are enabled
    pub color: bool,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include the event target
    pub module_path: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            color: false, // JSON output doesn't use colors
            timestamps: true,
            module_path: true,
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::default().merge_env(|key| env::var(key).ok())
    }

    /// Override fields from `TANDEM_*` variables found through `lookup`.
    pub fn merge_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(debug) = lookup("TANDEM_DEBUG") {
            self.debug = flag(&debug);
        }
        if self.debug && self.level > Level::Debug {
            self.level = Level::Debug;
        }
        if let Some(level) = lookup("TANDEM_LOG_LEVEL").and_then(|s| s.parse().ok()) {
            self.level = level;
        }
        if let Some(format) = lookup("TANDEM_LOG_FORMAT").and_then(|s| s.parse().ok()) {
            self.format = format;
        }
        match lookup("TANDEM_LOG_COLOR") {
            Some(color) => self.color = flag(&color),
            None if self.format != Format::Json => {
                self.color = lookup("NO_COLOR").is_none() && lookup("TERM").is_some();
            }
            None => {}
        }
        if let Some(timestamps) = lookup("TANDEM_LOG_TIMESTAMPS") {
            self.timestamps = flag(&timestamps);
        }
        if let Some(module) = lookup("TANDEM_LOG_MODULE") {
            self.module_path = flag(&module);
        }
        self
    }

    /// Filter built from `RUST_LOG` if set, otherwise from `level`.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = tfmt::layer()
            .with_target(self.module_path)
            .with_ansi(self.color);

        match (self.format, self.timestamps) {
            (Format::Json, true) => base.json().with_current_span(true).boxed(),
            (Format::Json, false) => base.json().with_current_span(true).without_time().boxed(),
            (Format::Compact, true) => base.compact().boxed(),
            (Format::Compact, false) => base.compact().without_time().boxed(),
            (Format::Pretty, true) => base.pretty().boxed(),
            (Format::Pretty, false) => base.pretty().without_time().boxed(),
        }
    }

    /// Create a tracing subscriber for this configuration.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        tracing_subscriber::registry()
            .with(self.layer())
            .with(self.filter())
    }

    /// Install the subscriber globally.
    ///
    /// Fails without panicking when a global subscriber already exists.
    pub fn try_init(&self) -> Result<(), TryInitError> {
        tracing_subscriber::registry()
            .with(self.layer())
            .with(self.filter())
            .try_init()
    }
}

/// Install a subscriber configured from the environment, ignoring a
/// subscriber that is already installed.
pub fn init() {
    let _ = LogConfig::from_env().try_init();
}

// ============================================================================
// Tests
// ============================================================================
