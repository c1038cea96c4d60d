//! Connection lifecycle states.
//!
//! Exactly one state is current at any instant. Only the supervisor's
//! transition function writes it; everyone else observes it through the
//! state signal or the read-only mirror on the manager handle.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the managed channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No channel, nothing scheduled
    Initial,
    /// First channel of a run is being opened
    Connecting,
    /// Channel open, deployment-specific authentication in progress
    Login,
    /// Channel open and usable
    Connected,
    /// Channel lost, waiting for (or running) a retry
    Reconnecting,
    /// Caller-initiated shutdown in progress
    Closing,
}

impl ConnectionState {
    /// `Connected` and `Login` both count as having a live channel.
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Login)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Connecting => "connecting",
            Self::Login => "login",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Initial
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two single-shot timers the supervisor runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Delay before the next `connect()` of a reconnect cycle
    Retry,
    /// Grace window after a reconnection before the episode is closed
    Stability,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Stability => write!(f, "stability"),
        }
    }
}
