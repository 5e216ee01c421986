//! Log level configuration.
//!
//! Parsing is case-insensitive and deserialization is lenient: an invalid
//! value logs an error and falls back to the default (`Info`) rather than
//! failing the whole configuration load, so the agent can still start and
//! report the problem.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::error;

/// Verbosity of the agent's own logging output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Very serious errors that prevent normal operation.
    Error,
    /// Hazardous situations that may lead to errors.
    Warn,
    /// Useful information about normal operation. The default.
    #[default]
    Info,
    /// Lower priority information for debugging.
    Debug,
    /// Extremely verbose information for troubleshooting.
    Trace,
}

impl LogLevel {
    /// Lowercase form, suitable as a `tracing_subscriber` filter directive.
    #[must_use]
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "invalid log level {s:?}; valid levels are error, warn, info, debug, trace"
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        if let Value::String(s) = value {
            match LogLevel::from_str(&s) {
                Ok(level) => Ok(level),
                Err(e) => {
                    error!("CONFIG | {e}");
                    Ok(LogLevel::default())
                }
            }
        } else {
            error!("CONFIG | expected a string for log level, got {value:?}");
            Ok(LogLevel::default())
        }
    }
}
