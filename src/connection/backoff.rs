//! Retry delay and disconnection episode bookkeeping
//!
//! - Linear growth with a ceiling: every unexpected close adds a fixed
//!   increment, a confirmed-stable reconnection resets to the initial delay
//! - One `disconnected_at` stamp per episode, backdated by a safety margin

use std::time::Duration;

use chrono::{DateTime, Utc};

// =============================================================================
// LINEAR BACKOFF
// =============================================================================

/// Retry delay that grows linearly up to a ceiling.
///
/// `initial <= current <= max` holds for every value this type hands out.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    initial: Duration,
    increment: Duration,
    max: Duration,
    current: Duration,
}

impl LinearBackoff {
    pub fn new(initial: Duration, increment: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            increment,
            max,
            current: initial,
        }
    }

    /// Delay the next retry will wait
    #[inline]
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Add one increment, capped at the ceiling. Returns the new delay.
    pub fn grow(&mut self) -> Duration {
        self.current = self.current.saturating_add(self.increment).min(self.max);
        self.current
    }

    /// Back to the initial delay (episode over)
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// =============================================================================
// DISCONNECTION EPISODE
// =============================================================================

/// Earliest instant from which a consumer must assume it missed data.
///
/// Only the first failure of an episode stamps the time; later failures keep
/// it. The stamp is backdated by `margin` since the transport's keep-alive can
/// hide a dead link for that long.
#[derive(Debug, Clone)]
pub struct DisconnectionEpisode {
    margin: Duration,
    started_at: Option<DateTime<Utc>>,
}

impl DisconnectionEpisode {
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            started_at: None,
        }
    }

    /// Stamp the episode start if none is recorded. Returns true when a new
    /// episode started.
    pub fn record(&mut self, now: DateTime<Utc>) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        // Saturates at the earliest representable instant
        let stamp = chrono::Duration::from_std(self.margin)
            .ok()
            .and_then(|margin| now.checked_sub_signed(margin))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.started_at = Some(stamp);
        true
    }

    pub fn clear(&mut self) -> Option<DateTime<Utc>> {
        self.started_at.take()
    }

    #[inline]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn is_open(&self) -> bool {
        self.started_at.is_some()
    }
}
