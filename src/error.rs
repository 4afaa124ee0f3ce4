//! # Error Handling
//!
//! Error taxonomy for the relay. Errors fall into two groups:
//!
//! ## Fatal (process exits before or instead of serving):
//! - **StartupConfig**: the API credential or another required setting is missing or invalid
//! - **Bind**: the listening socket could not be bound
//!
//! ## Pairing-local (absorbed at the Pairing boundary):
//! - **OutboundConnect**: the upstream leg failed to open or dropped after opening
//! - **Forward**: a single send failed after the target leg reported OPEN
//!
//! Pairing-local errors are logged and end (or drop a frame of) one Pairing only.
//! They never reach the accept loop.

use std::fmt;
use tokio_tungstenite::tungstenite;

/// Every error the relay can produce.
#[derive(Debug)]
pub enum RelayError {
    /// Required credential or configuration missing or malformed
    StartupConfig(String),

    /// Listening socket cannot be bound
    Bind(String),

    /// Upstream connection failed to establish or dropped
    OutboundConnect(String),

    /// A send on an OPEN leg failed; the frame is lost
    Forward(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::StartupConfig(msg) => write!(f, "Startup configuration error: {}", msg),
            RelayError::Bind(msg) => write!(f, "Bind error: {}", msg),
            RelayError::OutboundConnect(msg) => write!(f, "Outbound connection error: {}", msg),
            RelayError::Forward(msg) => write!(f, "Forward error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// Configuration loading failures happen before anything is bound, so they are fatal.
impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::StartupConfig(err.to_string())
    }
}

/// Transport failures on the upstream leg.
impl From<tungstenite::Error> for RelayError {
    fn from(err: tungstenite::Error) -> Self {
        RelayError::OutboundConnect(err.to_string())
    }
}

/// Shorthand for `Result<T, RelayError>`.
pub type RelayResult<T> = Result<T, RelayError>;
