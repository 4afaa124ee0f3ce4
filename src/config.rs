//! # Configuration Management
//!
//! Loads relay configuration from several sources, highest priority first:
//! 1. Deployment variables (`OPENAI_API_KEY`, `WEBSOCKET_PORT`, `PORT`, `HOST`, `LOG_LEVEL`)
//! 2. Environment variables with the `APP_` prefix (`APP_SERVER__PORT`, `APP_UPSTREAM__MODEL`, ...)
//! 3. Configuration file (`config.toml`, optional)
//! 4. Default values (defined in the Default impl)
//!
//! ## Fail-fast:
//! [`AppConfig::validate`] rejects a configuration without an API credential. `main`
//! runs it before binding anything, so a missing key never opens a socket.

use crate::error::{RelayError, RelayResult};
use crate::logging::LogLevel;
use crate::reconnect::ReconnectPolicy;
use config::builder::{ConfigBuilder, DefaultState};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

/// Main relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

/// Listening socket settings.
///
/// ## Fields:
/// - `host`: address to bind (`0.0.0.0` in containers, `127.0.0.1` for local runs)
/// - `port`: TCP port for the client-facing WebSocket leg
/// - `workers`: number of event loops; the default of 1 keeps every Pairing on one loop
/// - `shutdown_timeout_secs`: upper bound on draining active Pairings at shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub shutdown_timeout_secs: u64,
}

/// Remote realtime endpoint settings.
///
/// ## Fields:
/// - `base_url`: WebSocket URL of the realtime API (without query string)
/// - `model`: model identifier appended as `?model=...`
/// - `api_key`: bearer credential, required
/// - `beta_header`: value of the `OpenAI-Beta` protocol marker header
/// - `connect_timeout_secs`: bound on one handshake attempt
/// - `close_timeout_secs`: bound on waiting for the peer's close reply
/// - `handshake_retries` / `retry_base_delay_ms`: backoff for the *initial* handshake only
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub beta_header: String,
    pub connect_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub handshake_retries: u32,
    pub retry_base_delay_ms: u64,
}

/// Per-Pairing timers and limits.
///
/// `idle_timeout_secs = 0` disables the idle policy. `max_message_bytes` bounds
/// one client frame and one reassembled fragmented message alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                workers: 1,
                shutdown_timeout_secs: 10,
            },
            upstream: UpstreamConfig {
                base_url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
                api_key: String::new(),
                beta_header: "realtime=v1".to_string(),
                connect_timeout_secs: 10,
                close_timeout_secs: 5,
                handshake_retries: 0,
                retry_base_delay_ms: 1000,
            },
            relay: RelayConfig {
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                idle_timeout_secs: 0,
                max_message_bytes: 16 * 1024 * 1024,
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the process environment.
    pub fn load() -> RelayResult<Self> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Load configuration, resolving deployment variables through `lookup`.
    ///
    /// ## Deployment variables:
    /// - `OPENAI_API_KEY`: upstream credential
    /// - `WEBSOCKET_PORT`, then `PORT`: listening port (`WEBSOCKET_PORT` wins when both are set)
    /// - `HOST`: listening address
    /// - `LOG_LEVEL`: one of `debug`, `info`, `warn`, `error`
    pub fn load_with<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let settings = apply_deployment_overrides(settings, &lookup)?;
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration can run a relay.
    pub fn validate(&self) -> RelayResult<()> {
        if self.upstream.api_key.trim().is_empty() {
            return Err(RelayError::StartupConfig(
                "OPENAI_API_KEY is not set".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(RelayError::StartupConfig("Server port cannot be 0".to_string()));
        }

        if self.server.workers == 0 {
            return Err(RelayError::StartupConfig(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.upstream.connect_timeout_secs == 0 || self.upstream.close_timeout_secs == 0 {
            return Err(RelayError::StartupConfig(
                "Upstream timeouts must be greater than 0".to_string(),
            ));
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.client_timeout_secs < self.relay.heartbeat_interval_secs
        {
            return Err(RelayError::StartupConfig(
                "Client timeout must be at least one heartbeat interval".to_string(),
            ));
        }

        if self.relay.max_message_bytes == 0 {
            return Err(RelayError::StartupConfig(
                "Message size limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl UpstreamConfig {
    /// Full endpoint URL including the model query parameter.
    pub fn endpoint_url(&self) -> String {
        format!("{}?model={}", self.base_url, self.model)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// Backoff applied to the initial handshake. Never used after the leg opened.
    pub fn handshake_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.handshake_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("beta_header", &self.beta_header)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("close_timeout_secs", &self.close_timeout_secs)
            .field("handshake_retries", &self.handshake_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .finish()
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Map the unprefixed variables used by deployment platforms onto config keys.
fn apply_deployment_overrides<F>(
    mut settings: ConfigBuilder<DefaultState>,
    lookup: &F,
) -> RelayResult<ConfigBuilder<DefaultState>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = lookup("OPENAI_API_KEY") {
        settings = settings.set_override("upstream.api_key", key)?;
    }

    if let Some(host) = lookup("HOST") {
        settings = settings.set_override("server.host", host)?;
    }

    if let Some(port) = lookup("WEBSOCKET_PORT").or_else(|| lookup("PORT")) {
        settings = settings.set_override("server.port", port)?;
    }

    if let Some(raw) = lookup("LOG_LEVEL") {
        let level: LogLevel = raw.parse().map_err(RelayError::StartupConfig)?;
        settings = settings.set_override("logging.level", level.as_str())?;
    }

    Ok(settings)
}
