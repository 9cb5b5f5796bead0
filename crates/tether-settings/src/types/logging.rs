//! Logging settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Log verbosity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level (most verbose).
    Trace,
    /// Debug-level.
    Debug,
    /// Info-level (default).
    #[default]
    Info,
    /// Warning-level.
    Warn,
    /// Error-level.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Output format of the log writer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Global minimum level.
    pub level: LogLevel,
    /// Writer format.
    pub format: LogFormat,
    /// Per-target level overrides, e.g. `{"tether_rpc::dispatcher": "debug"}`.
    pub modules: BTreeMap<String, LogLevel>,
}

impl LoggingSettings {
    /// Render as an `EnvFilter` directive string (`info,tether_rpc=debug`).
    pub fn filter_directive(&self) -> String {
        let mut directive = self.level.as_filter_str().to_string();
        for (target, level) in &self.modules {
            directive.push(',');
            directive.push_str(target);
            directive.push('=');
            directive.push_str(level.as_filter_str());
        }
        directive
    }
}
