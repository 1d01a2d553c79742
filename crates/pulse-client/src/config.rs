//! Client configuration.
//!
//! Defaults are the values the dashboard backend is tuned for; every field can
//! be overridden from a deserialized document or from `PULSE_*` environment
//! variables.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Push endpoint used when nothing else is configured.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";

/// Key under which the login flow stores the bearer credential.
pub const DEFAULT_CREDENTIAL_KEY: &str = "token";

/// Maximum number of consecutive failed connection attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Fixed delay between connection attempts in ms.
pub const RECONNECT_DELAY_MS: u64 = 1_000;

/// How often the credential store is polled for same-tab changes, in ms.
pub const CREDENTIAL_POLL_MS: u64 = 1_000;

/// How long the server gets to send its welcome frame, in ms.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Minimum spacing between presence notifications for one room, in ms.
pub const PRESENCE_MIN_INTERVAL_MS: u64 = 5_000;

/// Capacity of the event broadcast channel.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidVar { var: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Configuration for the connection manager and its session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Push endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Credential store key holding the bearer token.
    pub credential_key: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub credential_poll_ms: u64,
    pub connect_timeout_ms: u64,
    pub presence_min_interval_ms: u64,
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            credential_key: DEFAULT_CREDENTIAL_KEY.to_string(),
            reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            credential_poll_ms: CREDENTIAL_POLL_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            presence_min_interval_ms: PRESENCE_MIN_INTERVAL_MS,
            event_buffer: EVENT_BUFFER,
        }
    }
}

impl ClientConfig {
    /// Build a config for `url` with every other field at its default.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read overrides from the process environment.
    ///
    /// | Variable                       | Field                      |
    /// |--------------------------------|----------------------------|
    /// | `PULSE_URL`                    | `url`                      |
    /// | `PULSE_CREDENTIAL_KEY`         | `credential_key`           |
    /// | `PULSE_RECONNECT_ATTEMPTS`     | `reconnect_attempts`       |
    /// | `PULSE_RECONNECT_DELAY_MS`     | `reconnect_delay_ms`       |
    /// | `PULSE_CREDENTIAL_POLL_MS`     | `credential_poll_ms`       |
    /// | `PULSE_CONNECT_TIMEOUT_MS`     | `connect_timeout_ms`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup("PULSE_URL") {
            config.url = url;
        }
        if let Some(key) = lookup("PULSE_CREDENTIAL_KEY") {
            config.credential_key = key;
        }
        parse_var(&lookup, "PULSE_RECONNECT_ATTEMPTS", &mut config.reconnect_attempts)?;
        parse_var(&lookup, "PULSE_RECONNECT_DELAY_MS", &mut config.reconnect_delay_ms)?;
        parse_var(&lookup, "PULSE_CREDENTIAL_POLL_MS", &mut config.credential_poll_ms)?;
        parse_var(&lookup, "PULSE_CONNECT_TIMEOUT_MS", &mut config.connect_timeout_ms)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "url must use ws:// or wss://, got {:?}",
                self.url
            )));
        }
        if self.credential_key.is_empty() {
            return Err(ConfigError::Invalid("credential key is empty".to_string()));
        }
        if self.credential_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "credential poll interval must be positive".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event buffer must be positive".to_string()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn credential_poll_interval(&self) -> Duration {
        Duration::from_millis(self.credential_poll_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn presence_min_interval(&self) -> Duration {
        Duration::from_millis(self.presence_min_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(var) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { var, value })?;
    }
    Ok(())
}
