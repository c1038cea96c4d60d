//! Manager configuration
//!
//! Defaults mirror a socket.io deployment: 5s first retry growing by 5s up to
//! 5 minutes, 200ms stability window, 20s disconnection margin.

use std::time::Duration;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Upper bound for `disconnect_margin_ms` (one day)
const MAX_DISCONNECT_MARGIN_MS: u64 = 24 * 60 * 60 * 1_000;

/// Options handed to the channel factory on every open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Transport names the factory may use, in preference order
    pub transports: Vec<String>,
    /// Upper bound for the transport handshake
    pub connect_timeout_ms: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            transports: vec!["websocket".to_string()],
            connect_timeout_ms: 10_000,
        }
    }
}

impl ChannelOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Identity tag attached to every log record
    pub id: String,

    // Backoff
    pub initial_reconnect_period_ms: u64,
    pub reconnect_increment_ms: u64,
    pub max_reconnect_period_ms: u64,

    // Episode tracking
    pub stability_period_ms: u64,
    /// Subtracted from "now" when stamping `disconnected_at`; should cover the
    /// transport's keep-alive timeout
    pub disconnect_margin_ms: u64,

    /// Verbose diagnostics
    pub local: bool,

    pub channel: ChannelOptions,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            id: "WebsocketIoClient".to_string(),

            initial_reconnect_period_ms: 5_000,
            reconnect_increment_ms: 5_000,
            max_reconnect_period_ms: 5 * 60 * 1_000,

            stability_period_ms: 200,
            disconnect_margin_ms: 20_000,

            local: false,

            channel: ChannelOptions::default(),
        }
    }
}

impl ManagerConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("WSIO_ID") {
            if !v.trim().is_empty() {
                config.id = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("WSIO_INITIAL_RECONNECT_MS") {
            config.initial_reconnect_period_ms =
                v.parse().unwrap_or(config.initial_reconnect_period_ms);
        }
        if let Ok(v) = std::env::var("WSIO_RECONNECT_INCREMENT_MS") {
            config.reconnect_increment_ms = v.parse().unwrap_or(config.reconnect_increment_ms);
        }
        if let Ok(v) = std::env::var("WSIO_MAX_RECONNECT_MS") {
            config.max_reconnect_period_ms = v.parse().unwrap_or(config.max_reconnect_period_ms);
        }
        if let Ok(v) = std::env::var("WSIO_STABILITY_MS") {
            config.stability_period_ms = v.parse().unwrap_or(config.stability_period_ms);
        }
        if let Ok(v) = std::env::var("WSIO_DISCONNECT_MARGIN_MS") {
            config.disconnect_margin_ms = v.parse().unwrap_or(config.disconnect_margin_ms);
        }
        if let Ok(v) = std::env::var("WSIO_LOCAL") {
            config.local = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = std::env::var("WSIO_TRANSPORTS") {
            let transports: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !transports.is_empty() {
                config.channel.transports = transports;
            }
        }
        if let Ok(v) = std::env::var("WSIO_CONNECT_TIMEOUT_MS") {
            config.channel.connect_timeout_ms =
                v.parse().unwrap_or(config.channel.connect_timeout_ms);
        }

        config
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.id.trim().is_empty(), "manager id must not be empty");
        ensure!(
            self.initial_reconnect_period_ms > 0,
            "initial_reconnect_period_ms must be positive"
        );
        ensure!(
            self.max_reconnect_period_ms >= self.initial_reconnect_period_ms,
            "max_reconnect_period_ms ({}) is below initial_reconnect_period_ms ({})",
            self.max_reconnect_period_ms,
            self.initial_reconnect_period_ms
        );
        ensure!(
            self.stability_period_ms > 0,
            "stability_period_ms must be positive"
        );
        ensure!(
            self.disconnect_margin_ms <= MAX_DISCONNECT_MARGIN_MS,
            "disconnect_margin_ms ({}) exceeds {}",
            self.disconnect_margin_ms,
            MAX_DISCONNECT_MARGIN_MS
        );
        ensure!(
            !self.channel.transports.is_empty(),
            "at least one transport is required"
        );
        Ok(())
    }

    pub fn initial_reconnect_period(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_period_ms)
    }

    pub fn reconnect_increment(&self) -> Duration {
        Duration::from_millis(self.reconnect_increment_ms)
    }

    pub fn max_reconnect_period(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_period_ms)
    }

    pub fn stability_period(&self) -> Duration {
        Duration::from_millis(self.stability_period_ms)
    }

    pub fn disconnect_margin(&self) -> Duration {
        Duration::from_millis(self.disconnect_margin_ms)
    }
}
