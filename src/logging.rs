//! # Structured Logging
//!
//! Process-wide leveled logging built on `tracing`. Every component logs through
//! the `tracing` macros with structured fields (`pairing_id`, `bytes`, `peer`);
//! this module only decides which events reach the console.
//!
//! ## Level selection:
//! - `RUST_LOG`, when set, is used verbatim (full `EnvFilter` syntax)
//! - otherwise the configured [`LogLevel`] applies to the relay and actix crates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log levels accepted from `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Filter directive used when `RUST_LOG` is absent.
    fn directive(&self) -> String {
        format!(
            "realtime_relay={level},actix_web={level},actix_server=warn",
            level = self.as_str()
        )
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("Unknown log level: {}", other)),
        }
    }
}

/// Initialize the global subscriber.
///
/// Calling this twice fails (the global subscriber can only be set once), which
/// is why it returns an error instead of panicking.
pub fn init_tracing(level: LogLevel) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
